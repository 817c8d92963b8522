use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::scripting::MapCoordinates;

/// Hit points. `current` is clamped to `0..=max` by the damage consumer.
#[derive(Component, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct HealthComponent {
    pub current: f32,
    pub max: f32,
}

impl Default for HealthComponent {
    fn default() -> Self {
        Self {
            current: 100.0,
            max: 100.0,
        }
    }
}

/// Position on a map, in world units
#[derive(Component, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct PositionComponent {
    #[serde(rename = "mapid")]
    pub map_id: u32,
    pub x: f32,
    pub y: f32,
}

impl PositionComponent {
    pub fn coordinates(&self) -> MapCoordinates {
        MapCoordinates {
            map_id: self.map_id,
            x: self.x,
            y: self.y,
        }
    }
}

impl From<MapCoordinates> for PositionComponent {
    fn from(c: MapCoordinates) -> Self {
        Self {
            map_id: c.map_id,
            x: c.x,
            y: c.y,
        }
    }
}

/// Velocity in world units per second
#[derive(Component, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct VelocityComponent {
    pub x: f32,
    pub y: f32,
}

/// Free-form labels. Server-side only.
#[derive(Component, Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct TagsComponent {
    pub tags: Vec<String>,
}
