use bevy::prelude::*;
use mlua::{FromLua, IntoLua, Lua, LuaSerdeExt, SerializeOptions, Value};
use serde::{Deserialize, Serialize};

use crate::error::BindingError;

/// Serializer settings shared by every host value pushed into Lua: absent
/// options become `nil` and arrays stay plain tables.
pub fn serialize_options() -> SerializeOptions {
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
        .set_array_metatable(false)
}

pub fn to_lua_value<T: Serialize + ?Sized>(lua: &Lua, value: &T) -> mlua::Result<Value> {
    lua.to_value_with(value, serialize_options())
}

/// Raw entity handle as scripts see it. Validation against the world happens
/// at the call site through [`crate::scripting::live_entity`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityHandle(pub u64);

impl EntityHandle {
    /// Decodes the handle without checking that the entity is alive.
    pub fn entity(self) -> Result<Entity, BindingError> {
        Entity::try_from_bits(self.0).map_err(|_| BindingError::EntityNotFound(self.0))
    }
}

impl From<Entity> for EntityHandle {
    fn from(entity: Entity) -> Self {
        Self(entity.to_bits())
    }
}

impl FromLua for EntityHandle {
    fn from_lua(value: Value, _lua: &Lua) -> mlua::Result<Self> {
        match value {
            Value::Integer(i) if i >= 0 => Ok(Self(i as u64)),
            Value::Number(n) if n >= 0.0 && n.fract() == 0.0 => Ok(Self(n as u64)),
            other => Err(mlua::Error::runtime(format!(
                "expected an entity handle, got {}",
                other.type_name()
            ))),
        }
    }
}

impl IntoLua for EntityHandle {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        self.0.into_lua(lua)
    }
}

/// 2D vector crossing the script boundary as `{x = .., y = ..}`; `{a, b}` is
/// accepted on the way in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LuaVec2(pub Vec2);

fn number(value: Value) -> Option<f32> {
    match value {
        Value::Integer(i) => Some(i as f32),
        Value::Number(n) => Some(n as f32),
        _ => None,
    }
}

impl FromLua for LuaVec2 {
    fn from_lua(value: Value, _lua: &Lua) -> mlua::Result<Self> {
        let Value::Table(t) = value else {
            return Err(BindingError::InvalidVector.into());
        };
        let named = (t.get::<Value>("x")?, t.get::<Value>("y")?);
        let (x, y) = match named {
            (Value::Nil, Value::Nil) => (t.get::<Value>(1)?, t.get::<Value>(2)?),
            pair => pair,
        };
        match (number(x), number(y)) {
            (Some(x), Some(y)) => Ok(Self(Vec2::new(x, y))),
            _ => Err(BindingError::InvalidVector.into()),
        }
    }
}

impl IntoLua for LuaVec2 {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        let t = lua.create_table()?;
        t.set("x", self.0.x)?;
        t.set("y", self.0.y)?;
        Ok(Value::Table(t))
    }
}

/// Position relative to a parent entity: `{entity = id, x = .., y = ..}`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct EntityCoordinates {
    pub entity: Entity,
    pub x: f32,
    pub y: f32,
}

impl EntityCoordinates {
    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

/// Absolute position on a map: `{mapid = .., x = .., y = ..}`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct MapCoordinates {
    #[serde(rename = "mapid")]
    pub map_id: u32,
    pub x: f32,
    pub y: f32,
}

impl MapCoordinates {
    pub fn new(map_id: u32, position: Vec2) -> Self {
        Self {
            map_id,
            x: position.x,
            y: position.y,
        }
    }

    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

macro_rules! serde_lua_value {
    ($ty:ty) => {
        impl FromLua for $ty {
            fn from_lua(value: Value, lua: &Lua) -> mlua::Result<Self> {
                lua.from_value(value)
            }
        }

        impl IntoLua for $ty {
            fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
                to_lua_value(lua, &self)
            }
        }
    };
}

serde_lua_value!(EntityCoordinates);
serde_lua_value!(MapCoordinates);
