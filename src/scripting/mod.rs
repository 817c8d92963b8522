pub mod autoload;
pub mod bindings;
pub mod bridge;
pub mod convert;
pub mod environment;
pub mod registry;
pub mod render;
pub mod world_access;

use std::sync::Arc;

use bevy::prelude::*;

pub use bridge::{
    LuaListenerComponent, PendingEvents, Raised, BROADCAST_HANDLER_SUFFIX, GLOBAL_HANDLERS_ENV,
    LOCAL_HANDLER_SUFFIX,
};
pub use convert::{EntityCoordinates, EntityHandle, LuaVec2, MapCoordinates};
pub use environment::{with_environments, Environment, EnvironmentManager, ScriptLimits};
pub use registry::{
    CapabilityRegistry, CapabilityRegistryBuilder, EventConstructor, ScriptBinding,
    ScriptComponent, ScriptEvent,
};
pub use world_access::{live_entity, live_entity_mut, WorldAccess};

/// Frozen capability registry, shared with non-script systems.
#[derive(Resource, Clone)]
pub struct Capabilities(pub Arc<CapabilityRegistry>);

#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub enum LuaHostSet {
    /// Per-environment `Update(dt)`.
    Tick,
    /// Event bridge: script handlers see queued events.
    Dispatch,
}

pub struct LuaHostPlugin {
    registry: Arc<CapabilityRegistry>,
    limits: ScriptLimits,
}

impl LuaHostPlugin {
    pub fn new(registry: CapabilityRegistry, limits: ScriptLimits) -> Self {
        Self {
            registry: Arc::new(registry),
            limits,
        }
    }
}

impl Plugin for LuaHostPlugin {
    fn build(&self, app: &mut App) {
        for event in self.registry.events() {
            (event.setup)(app);
        }
        app.insert_resource(Capabilities(self.registry.clone()))
            .insert_non_send_resource(EnvironmentManager::new(
                self.registry.clone(),
                self.limits,
            ))
            .configure_sets(FixedUpdate, (LuaHostSet::Tick, LuaHostSet::Dispatch).chain())
            .add_systems(
                FixedUpdate,
                (
                    tick_environments.in_set(LuaHostSet::Tick),
                    dispatch_events.in_set(LuaHostSet::Dispatch),
                ),
            );
    }
}

pub fn tick_environments(world: &mut World) {
    let dt = world
        .get_resource::<Time>()
        .map(|t| t.delta_secs())
        .unwrap_or_default();
    with_environments(world, |world, envs| envs.tick(world, dt));
}

pub fn dispatch_events(world: &mut World) {
    with_environments(world, |world, envs| {
        let registry = envs.capabilities().clone();
        for event in registry.events() {
            (event.dispatch)(world, envs, &event.name);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct AlarmEvent {
        level: u32,
        silenced: bool,
    }

    impl ScriptEvent for AlarmEvent {
        const BY_REF: bool = true;

        fn constructors() -> Vec<EventConstructor<Self>> {
            vec![EventConstructor::new(&["u32"], |level: u32| {
                Ok(AlarmEvent {
                    level,
                    silenced: false,
                })
            })]
        }
    }

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct ChimeEvent {
        tone: u32,
    }

    impl ScriptEvent for ChimeEvent {}

    fn app() -> App {
        let registry = CapabilityRegistry::builder()
            .component::<LuaListenerComponent>(true)
            .event::<AlarmEvent>()
            .event::<ChimeEvent>()
            .build();
        let mut app = App::new();
        app.add_plugins(LuaHostPlugin::new(registry, ScriptLimits::default()));
        app
    }

    fn exec(app: &mut App, env: &str, src: &str) {
        with_environments(app.world_mut(), |world, envs| {
            if !envs.contains(env) {
                envs.create_environment(env);
            }
            envs.exec_in_environment(world, env, src)
                .expect("environment")
                .expect("script ok");
        })
        .expect("manager installed");
    }

    fn drain<E: ScriptEvent>(app: &mut App) -> Vec<Raised<E>> {
        app.world_mut()
            .resource_mut::<Events<Raised<E>>>()
            .drain()
            .collect()
    }

    #[test]
    fn listener_handler_replaces_by_ref_payload() {
        let mut app = app();
        exec(
            &mut app,
            "guard",
            "seen = {}
             function AlarmEventHandler(uid, ev)
               seen[#seen + 1] = uid
               ev.level = ev.level * 10
               return ev
             end",
        );
        let e = app
            .world_mut()
            .spawn(LuaListenerComponent::new("guard"))
            .id();
        app.world_mut()
            .resource_mut::<PendingEvents<AlarmEvent>>()
            .raise_local(e, AlarmEvent { level: 2, silenced: false });
        dispatch_events(app.world_mut());

        let raised = drain::<AlarmEvent>(&mut app);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].target, Some(e));
        assert_eq!(raised[0].event.level, 20);
    }

    #[test]
    fn mismatched_or_missing_return_leaves_payload_untouched() {
        let mut app = app();
        exec(
            &mut app,
            "guard",
            "function AlarmEventHandler(uid, ev) return { __type = 'ChimeEvent', tone = 1 } end",
        );
        let listening = app.world_mut().spawn(LuaListenerComponent::new("guard")).id();
        let unknown_env = app.world_mut().spawn(LuaListenerComponent::new("nobody")).id();
        let plain = app.world_mut().spawn_empty().id();
        {
            let mut pending = app.world_mut().resource_mut::<PendingEvents<AlarmEvent>>();
            for target in [listening, unknown_env, plain] {
                pending.raise_local(target, AlarmEvent { level: 1, silenced: false });
            }
        }
        dispatch_events(app.world_mut());
        let raised = drain::<AlarmEvent>(&mut app);
        assert_eq!(raised.len(), 3);
        assert!(raised.iter().all(|r| r.event.level == 1));
    }

    #[test]
    fn disabled_listener_suppresses_local_dispatch() {
        let mut app = app();
        exec(&mut app, "guard", "hits = 0; function AlarmEventHandler() hits = hits + 1 end");
        let mut listener = LuaListenerComponent::new("guard");
        listener.enabled = false;
        let e = app.world_mut().spawn(listener).id();
        app.world_mut()
            .resource_mut::<PendingEvents<AlarmEvent>>()
            .raise_local(e, AlarmEvent { level: 1, silenced: false });
        dispatch_events(app.world_mut());
        with_environments(app.world_mut(), |_, envs| {
            assert!(envs.environment_state("guard").expect("state").contains("hits: 0"));
        });
    }

    #[test]
    fn broadcast_handlers_live_in_global_environment() {
        let mut app = app();
        app.world_mut()
            .resource_mut::<PendingEvents<ChimeEvent>>()
            .raise_broadcast(ChimeEvent { tone: 3 });
        dispatch_events(app.world_mut());
        assert_eq!(drain::<ChimeEvent>(&mut app).len(), 1);

        exec(
            &mut app,
            GLOBAL_HANDLERS_ENV,
            "tones = {}
             function ChimeEventBroadcastHandler(ev) tones[#tones + 1] = ev.tone; return { __type = 'ChimeEvent', tone = 99 } end
             function AlarmEventBroadcastHandler(ev) ev.silenced = true; return ev end",
        );
        app.world_mut()
            .resource_mut::<PendingEvents<ChimeEvent>>()
            .raise_broadcast(ChimeEvent { tone: 4 });
        app.world_mut()
            .resource_mut::<PendingEvents<AlarmEvent>>()
            .raise_broadcast(AlarmEvent { level: 5, silenced: false });
        dispatch_events(app.world_mut());

        let chimes = drain::<ChimeEvent>(&mut app);
        assert_eq!(chimes[0].event.tone, 4, "value events are never replaced");
        let alarms = drain::<AlarmEvent>(&mut app);
        assert!(alarms[0].event.silenced);
        with_environments(app.world_mut(), |_, envs| {
            let state = envs.environment_state(GLOBAL_HANDLERS_ENV).expect("state");
            assert!(state.contains("1: 4"), "{state}");
        });
    }

    #[test]
    fn scripts_raise_events_through_constructors() {
        let mut app = app();
        let e = app.world_mut().spawn_empty().id();
        exec(
            &mut app,
            "raiser",
            &format!(
                "local ev = createevent.AlarmEvent_u32(7)
                 entman.raise(ev, {})
                 entman.raise(createevent.AlarmEvent_u32(8))",
                e.to_bits()
            ),
        );
        assert_eq!(app.world().resource::<PendingEvents<AlarmEvent>>().len(), 2);
        dispatch_events(app.world_mut());
        let raised = drain::<AlarmEvent>(&mut app);
        assert_eq!(raised[0].target, Some(e));
        assert_eq!(raised[0].event.level, 7);
        assert_eq!(raised[1].target, None);
    }

    #[test]
    fn raising_untagged_tables_is_a_script_error() {
        let mut app = app();
        let err = with_environments(app.world_mut(), |world, envs| {
            envs.create_environment("bad");
            envs.exec_in_environment(world, "bad", "entman.raise({ level = 1 })")
                .expect("environment")
                .expect_err("untagged")
        })
        .expect("manager");
        assert!(render::error_text(&err).contains("unknown event type"));
    }
}
