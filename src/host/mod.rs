//! Simulation content exposed to scripts: a handful of components, events,
//! subsystems and services, plus the host systems that consume bridged events.

pub mod bindings;
pub mod components;
pub mod events;
pub mod gameplay;

use bevy::prelude::*;

use crate::scripting::{CapabilityRegistryBuilder, LuaHostSet, LuaListenerComponent};
use bindings::{
    ChatSystem, DamageableSystem, LogService, MovementSystem, RandomService, TimingService,
};
use components::{HealthComponent, PositionComponent, TagsComponent, VelocityComponent};
use events::{DamageEvent, InteractHandEvent, MoveEvent, SpeakAttemptEvent};
use gameplay::ChatLog;

/// Registration table for everything the host lets scripts reach.
pub fn register_capabilities(builder: CapabilityRegistryBuilder) -> CapabilityRegistryBuilder {
    builder
        .subsystem::<DamageableSystem>()
        .subsystem::<MovementSystem>()
        .subsystem::<ChatSystem>()
        .service::<TimingService>()
        .service::<RandomService>()
        .service::<LogService>()
        .component::<HealthComponent>(true)
        .component::<PositionComponent>(true)
        .component::<VelocityComponent>(true)
        .component::<TagsComponent>(false)
        .component::<LuaListenerComponent>(true)
        .event::<DamageEvent>()
        .event::<SpeakAttemptEvent>()
        .event::<InteractHandEvent>()
        .event::<MoveEvent>()
}

#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct GameplaySet;

/// Requires `LuaHostPlugin` built from [`register_capabilities`].
pub struct GameplayPlugin;

impl Plugin for GameplayPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<ChatLog>()
            .configure_sets(FixedUpdate, GameplaySet.before(LuaHostSet::Tick))
            .add_systems(
                FixedUpdate,
                (
                    gameplay::integrate_velocity.in_set(GameplaySet),
                    (gameplay::apply_damage, gameplay::record_speech)
                        .after(LuaHostSet::Dispatch),
                ),
            );
    }
}
