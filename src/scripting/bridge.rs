use bevy::prelude::*;
use mlua::{IntoLuaMulti, Lua, LuaSerdeExt, Table, Value};
use serde::{Deserialize, Serialize};

use super::convert::{to_lua_value, EntityHandle};
use super::environment::EnvironmentManager;
use super::registry::ScriptEvent;

/// Environment that receives every broadcast event.
pub const GLOBAL_HANDLERS_ENV: &str = "GlobalHandlers";
pub const LOCAL_HANDLER_SUFFIX: &str = "Handler";
pub const BROADCAST_HANDLER_SUFFIX: &str = "BroadcastHandler";

/// Marks an entity whose events should reach the handlers of `env_name`.
#[derive(Component, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LuaListenerComponent {
    pub env_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for LuaListenerComponent {
    fn default() -> Self {
        Self {
            env_name: String::new(),
            enabled: true,
        }
    }
}

impl LuaListenerComponent {
    pub fn new(env_name: impl Into<String>) -> Self {
        Self {
            env_name: env_name.into(),
            enabled: true,
        }
    }
}

pub struct PendingEvent<E> {
    pub target: Option<Entity>,
    pub broadcast: bool,
    pub event: E,
}

/// Events raised by host code or scripts, waiting for the bridge.
#[derive(Resource)]
pub struct PendingEvents<E: ScriptEvent> {
    queue: Vec<PendingEvent<E>>,
}

impl<E: ScriptEvent> Default for PendingEvents<E> {
    fn default() -> Self {
        Self { queue: Vec::new() }
    }
}

impl<E: ScriptEvent> PendingEvents<E> {
    /// Directed at `target`, then seen by broadcast handlers.
    pub fn raise_local(&mut self, target: Entity, event: E) {
        self.queue.push(PendingEvent {
            target: Some(target),
            broadcast: true,
            event,
        });
    }

    /// Directed at `target` only.
    pub fn raise_directed(&mut self, target: Entity, event: E) {
        self.queue.push(PendingEvent {
            target: Some(target),
            broadcast: false,
            event,
        });
    }

    pub fn raise_broadcast(&mut self, event: E) {
        self.queue.push(PendingEvent {
            target: None,
            broadcast: true,
            event,
        });
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// An event after scripts have had their say; host systems read these.
#[derive(Event, Clone, Debug)]
pub struct Raised<E: ScriptEvent> {
    pub target: Option<Entity>,
    pub event: E,
}

pub fn event_to_table<E: Serialize>(lua: &Lua, name: &str, event: &E) -> mlua::Result<Table> {
    let table = match to_lua_value(lua, event)? {
        Value::Table(t) => t,
        _ => lua.create_table()?,
    };
    table.set("__type", name)?;
    Ok(table)
}

/// A handler's return value replaces the payload only when it is a table
/// tagged with the same event type that converts back cleanly.
pub fn event_from_return<E: ScriptEvent>(lua: &Lua, name: &str, value: Value) -> Option<E> {
    let Value::Table(table) = value else {
        return None;
    };
    match table.get::<Option<String>>("__type") {
        Ok(Some(tag)) if tag == name => {}
        _ => return None,
    }
    lua.from_value::<E>(Value::Table(table)).ok()
}

fn listener_env(world: &World, entity: Entity) -> Option<String> {
    world
        .get::<LuaListenerComponent>(entity)
        .filter(|l| l.enabled)
        .map(|l| l.env_name.clone())
}

fn intercept<E: ScriptEvent>(
    world: &mut World,
    envs: &EnvironmentManager,
    env_name: &str,
    handler: &str,
    target: Option<Entity>,
    event: &E,
    event_name: &str,
) -> Option<E> {
    let outcome = envs.call_handler(
        world,
        env_name,
        handler,
        |lua| {
            let table = event_to_table(lua, event_name, event)?;
            match target {
                Some(entity) => (EntityHandle::from(entity), table).into_lua_multi(lua),
                None => table.into_lua_multi(lua),
            }
        },
        |lua, returned| {
            if E::BY_REF {
                event_from_return::<E>(lua, event_name, returned)
            } else {
                None
            }
        },
    )?;
    match outcome {
        Ok(replacement) => replacement,
        Err(err) => {
            warn!("[LuaHost bridge] {handler} in '{env_name}' failed: {err}");
            None
        }
    }
}

/// Drains one event type through script handlers and forwards the
/// (possibly replaced) payloads as [`Raised`] events.
pub fn dispatch_pending<E: ScriptEvent>(
    world: &mut World,
    envs: &EnvironmentManager,
    event_name: &str,
) {
    let pending = match world.get_resource_mut::<PendingEvents<E>>() {
        Some(mut p) if !p.queue.is_empty() => std::mem::take(&mut p.queue),
        _ => return,
    };
    let local_handler = format!("{event_name}{LOCAL_HANDLER_SUFFIX}");
    let broadcast_handler = format!("{event_name}{BROADCAST_HANDLER_SUFFIX}");

    for PendingEvent {
        target,
        broadcast,
        mut event,
    } in pending
    {
        if let Some(entity) = target {
            if let Some(env_name) = listener_env(world, entity) {
                if let Some(replacement) = intercept(
                    world,
                    envs,
                    &env_name,
                    &local_handler,
                    Some(entity),
                    &event,
                    event_name,
                ) {
                    event = replacement;
                }
            }
        }
        if broadcast {
            if let Some(replacement) = intercept(
                world,
                envs,
                GLOBAL_HANDLERS_ENV,
                &broadcast_handler,
                None,
                &event,
                event_name,
            ) {
                event = replacement;
            }
        }
        world.send_event(Raised { target, event });
    }
}
