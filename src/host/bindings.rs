use std::cell::RefCell;
use std::rc::Rc;

use bevy::core::FrameCount;
use bevy::prelude::*;
use mlua::{Lua, Table};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::components::{HealthComponent, PositionComponent, VelocityComponent};
use super::events::{DamageEvent, MoveEvent, SpeakAttemptEvent};
use super::gameplay::ChatLog;
use crate::error::BindingError;
use crate::scripting::{
    live_entity, live_entity_mut, EntityHandle, LuaVec2, MapCoordinates, PendingEvents,
    ScriptBinding, ScriptEvent, WorldAccess,
};

fn raise<E: ScriptEvent>(world: &mut World, target: Entity, event: E) -> Result<(), BindingError> {
    let name = crate::scripting::registry::simple_type_name::<E>();
    world
        .get_resource_mut::<PendingEvents<E>>()
        .ok_or_else(|| BindingError::EventNotWired(name.to_string()))?
        .raise_local(target, event);
    Ok(())
}

pub struct DamageableSystem;

impl ScriptBinding for DamageableSystem {
    fn bind(lua: &Lua, world: &WorldAccess) -> mlua::Result<Table> {
        let t = lua.create_table()?;

        let access = world.clone();
        t.set(
            "damage",
            lua.create_function(
                move |_, (id, amount, origin): (EntityHandle, f32, Option<EntityHandle>)| {
                    access.with(|w| -> mlua::Result<()> {
                        let target = live_entity(w, id.0)?;
                        let origin = origin.map(|o| live_entity(w, o.0)).transpose()?;
                        raise(w, target, DamageEvent { amount, origin })?;
                        Ok(())
                    })?
                },
            )?,
        )?;

        let access = world.clone();
        t.set(
            "health",
            lua.create_function(move |_, id: EntityHandle| {
                Ok(access.with(|w| -> Result<Option<f32>, BindingError> {
                    let e = live_entity(w, id.0)?;
                    Ok(w.get::<HealthComponent>(e).map(|h| h.current))
                })??)
            })?,
        )?;

        Ok(t)
    }
}

pub struct MovementSystem;

impl ScriptBinding for MovementSystem {
    fn bind(lua: &Lua, world: &WorldAccess) -> mlua::Result<Table> {
        let t = lua.create_table()?;

        let access = world.clone();
        t.set(
            "teleport",
            lua.create_function(move |_, (id, coords): (EntityHandle, MapCoordinates)| {
                Ok(access.with(|w| -> Result<(), BindingError> {
                    let e = live_entity(w, id.0)?;
                    let old = w
                        .get::<PositionComponent>(e)
                        .map(PositionComponent::coordinates)
                        .unwrap_or_default();
                    live_entity_mut(w, e)?.insert(PositionComponent::from(coords));
                    raise(
                        w,
                        e,
                        MoveEvent {
                            old_position: old,
                            new_position: coords,
                        },
                    )
                })??)
            })?,
        )?;

        let access = world.clone();
        t.set(
            "coordinates",
            lua.create_function(move |_, id: EntityHandle| {
                Ok(access.with(|w| -> Result<Option<MapCoordinates>, BindingError> {
                    let e = live_entity(w, id.0)?;
                    Ok(w.get::<PositionComponent>(e).map(PositionComponent::coordinates))
                })??)
            })?,
        )?;

        let access = world.clone();
        t.set(
            "set_velocity",
            lua.create_function(move |_, (id, v): (EntityHandle, LuaVec2)| {
                Ok(access.with(|w| -> Result<(), BindingError> {
                    let e = live_entity(w, id.0)?;
                    live_entity_mut(w, e)?.insert(VelocityComponent { x: v.0.x, y: v.0.y });
                    Ok(())
                })??)
            })?,
        )?;

        let access = world.clone();
        t.set(
            "velocity",
            lua.create_function(move |_, id: EntityHandle| {
                Ok(access.with(|w| -> Result<Option<LuaVec2>, BindingError> {
                    let e = live_entity(w, id.0)?;
                    Ok(w
                        .get::<VelocityComponent>(e)
                        .map(|v| LuaVec2(Vec2::new(v.x, v.y))))
                })??)
            })?,
        )?;

        Ok(t)
    }
}

pub struct ChatSystem;

impl ScriptBinding for ChatSystem {
    fn bind(lua: &Lua, world: &WorldAccess) -> mlua::Result<Table> {
        let t = lua.create_table()?;

        let access = world.clone();
        t.set(
            "say",
            lua.create_function(move |_, (id, message): (EntityHandle, String)| {
                Ok(access.with(|w| -> Result<(), BindingError> {
                    let e = live_entity(w, id.0)?;
                    raise(
                        w,
                        e,
                        SpeakAttemptEvent {
                            message,
                            cancelled: false,
                        },
                    )
                })??)
            })?,
        )?;

        let access = world.clone();
        t.set(
            "history",
            lua.create_function(move |_, limit: Option<usize>| {
                Ok(access.with(|w| {
                    w.get_resource::<ChatLog>()
                        .map(|log| log.recent(limit.unwrap_or(usize::MAX)))
                        .unwrap_or_default()
                })?)
            })?,
        )?;

        Ok(t)
    }
}

pub struct TimingService;

impl ScriptBinding for TimingService {
    fn bind(lua: &Lua, world: &WorldAccess) -> mlua::Result<Table> {
        let t = lua.create_table()?;

        let access = world.clone();
        t.set(
            "curtime",
            lua.create_function(move |_, ()| {
                Ok(access.with(|w| {
                    w.get_resource::<Time>()
                        .map(|time| time.elapsed_secs_f64())
                        .unwrap_or_default()
                })?)
            })?,
        )?;

        let access = world.clone();
        t.set(
            "frame",
            lua.create_function(move |_, ()| {
                Ok(access.with(|w| w.get_resource::<FrameCount>().map(|f| f.0).unwrap_or(0))?)
            })?,
        )?;

        Ok(t)
    }
}

/// Per-environment generator; environments never share random state.
pub struct RandomService;

impl ScriptBinding for RandomService {
    fn bind(lua: &Lua, _world: &WorldAccess) -> mlua::Result<Table> {
        let t = lua.create_table()?;
        let rng = Rc::new(RefCell::new(SmallRng::from_entropy()));

        let r = rng.clone();
        t.set(
            "range",
            lua.create_function(move |_, (min, max): (i64, i64)| {
                if min > max {
                    return Err(mlua::Error::runtime(format!(
                        "empty range {min}..={max}"
                    )));
                }
                Ok(r.borrow_mut().gen_range(min..=max))
            })?,
        )?;

        let r = rng.clone();
        t.set(
            "float",
            lua.create_function(move |_, ()| Ok(r.borrow_mut().gen::<f64>()))?,
        )?;

        let r = rng;
        t.set(
            "prob",
            lua.create_function(move |_, chance: f64| {
                if !chance.is_finite() {
                    return Err(mlua::Error::runtime(format!(
                        "probability must be a finite number, got {chance}"
                    )));
                }
                Ok(r.borrow_mut().gen_bool(chance.clamp(0.0, 1.0)))
            })?,
        )?;

        Ok(t)
    }
}

pub struct LogService;

impl ScriptBinding for LogService {
    fn bind(lua: &Lua, _world: &WorldAccess) -> mlua::Result<Table> {
        let t = lua.create_table()?;
        t.set(
            "info",
            lua.create_function(|_, msg: String| {
                info!("[LuaHost script] {msg}");
                Ok(())
            })?,
        )?;
        t.set(
            "warn",
            lua.create_function(|_, msg: String| {
                warn!("[LuaHost script] {msg}");
                Ok(())
            })?,
        )?;
        Ok(t)
    }
}
