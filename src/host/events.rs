use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::scripting::{
    EntityCoordinates, EntityHandle, EventConstructor, MapCoordinates, ScriptEvent,
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DamageEvent {
    pub amount: f32,
    #[serde(default)]
    pub origin: Option<Entity>,
}

impl ScriptEvent for DamageEvent {
    const BY_REF: bool = true;

    fn constructors() -> Vec<EventConstructor<Self>> {
        vec![
            EventConstructor::new(&["f32"], |amount: f32| {
                Ok(DamageEvent {
                    amount,
                    origin: None,
                })
            }),
            EventConstructor::new(&["f32", "entity"], |(amount, origin): (f32, EntityHandle)| {
                Ok(DamageEvent {
                    amount,
                    origin: Some(origin.entity()?),
                })
            }),
        ]
    }
}

/// Raised before a line of chat is accepted; setting `cancelled` drops it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SpeakAttemptEvent {
    pub message: String,
    #[serde(default)]
    pub cancelled: bool,
}

impl ScriptEvent for SpeakAttemptEvent {
    const BY_REF: bool = true;

    fn constructors() -> Vec<EventConstructor<Self>> {
        vec![EventConstructor::new(&["string"], |message: String| {
            Ok(SpeakAttemptEvent {
                message,
                cancelled: false,
            })
        })]
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InteractHandEvent {
    pub user: Entity,
    pub target: Entity,
    pub click: EntityCoordinates,
}

impl ScriptEvent for InteractHandEvent {
    fn constructors() -> Vec<EventConstructor<Self>> {
        vec![EventConstructor::new(
            &["entity", "entity", "entitycoordinates"],
            |(user, target, click): (EntityHandle, EntityHandle, EntityCoordinates)| {
                Ok(InteractHandEvent {
                    user: user.entity()?,
                    target: target.entity()?,
                    click,
                })
            },
        )]
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MoveEvent {
    pub old_position: MapCoordinates,
    pub new_position: MapCoordinates,
}

impl ScriptEvent for MoveEvent {
    fn constructors() -> Vec<EventConstructor<Self>> {
        vec![EventConstructor::new(
            &["mapcoordinates", "mapcoordinates"],
            |(old_position, new_position): (MapCoordinates, MapCoordinates)| {
                Ok(MoveEvent {
                    old_position,
                    new_position,
                })
            },
        )]
    }
}
