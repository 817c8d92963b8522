use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bevy::prelude::*;
use mlua::{FromLuaMulti, Lua, LuaSerdeExt, MultiValue, Table, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::bridge::{self, PendingEvents, Raised};
use super::environment::EnvironmentManager;
use super::world_access::{live_entity_mut, WorldAccess};
use crate::error::BindingError;

/// A host subsystem or service exposed to scripts as a table of functions.
pub trait ScriptBinding: 'static {
    fn bind(lua: &Lua, world: &WorldAccess) -> mlua::Result<Table>;
}

/// Components scripts may read and write through the `comp` helper family.
pub trait ScriptComponent: Component + Serialize + DeserializeOwned + Default {}

impl<T: Component + Serialize + DeserializeOwned + Default> ScriptComponent for T {}

/// An event payload the bridge can route into script handlers.
pub trait ScriptEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Handlers may return a replacement payload.
    const BY_REF: bool = false;

    fn constructors() -> Vec<EventConstructor<Self>> {
        Vec::new()
    }
}

type BuildEvent<E> = Arc<dyn Fn(&Lua, MultiValue) -> mlua::Result<E> + Send + Sync>;

pub struct EventConstructor<E> {
    params: Vec<String>,
    build: BuildEvent<E>,
}

impl<E: 'static> EventConstructor<E> {
    /// `params` are the argument type names used to derive the script-side key.
    pub fn new<A: FromLuaMulti + 'static>(params: &[&str], f: fn(A) -> mlua::Result<E>) -> Self {
        Self {
            params: params.iter().map(|p| p.to_ascii_lowercase()).collect(),
            build: Arc::new(move |lua: &Lua, args: MultiValue| f(lua.unpack_multi::<A>(args)?)),
        }
    }

    pub fn key(&self, event_name: &str) -> String {
        std::iter::once(event_name.to_string())
            .chain(self.params.iter().cloned())
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Last path segment of a type name, with generic arguments dropped.
pub fn simple_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

pub fn component_key(name: &str) -> &str {
    match name.strip_suffix("Component") {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => name,
    }
}

#[derive(Clone)]
pub struct BindingRegistration {
    pub name: String,
    pub type_name: &'static str,
    pub(crate) bind: fn(&Lua, &WorldAccess) -> mlua::Result<Table>,
}

#[derive(Clone)]
pub struct ComponentRegistration {
    pub name: String,
    pub type_name: &'static str,
    pub networked: bool,
    pub(crate) has: fn(&World, Entity) -> bool,
    pub(crate) get: fn(&World, Entity, &Lua) -> mlua::Result<Value>,
    pub(crate) ensure: fn(&mut World, Entity, &Lua) -> mlua::Result<Value>,
    pub(crate) remove: fn(&mut World, Entity) -> mlua::Result<bool>,
    pub(crate) set: fn(&mut World, Entity, &Lua, Value) -> mlua::Result<()>,
    pub(crate) mark_changed: fn(&mut World, Entity) -> bool,
}

fn has_component<C: ScriptComponent>(world: &World, entity: Entity) -> bool {
    world.get::<C>(entity).is_some()
}

fn get_component<C: ScriptComponent>(
    world: &World,
    entity: Entity,
    lua: &Lua,
) -> mlua::Result<Value> {
    match world.get::<C>(entity) {
        Some(c) => super::convert::to_lua_value(lua, c),
        None => Ok(Value::Nil),
    }
}

fn ensure_component<C: ScriptComponent>(
    world: &mut World,
    entity: Entity,
    lua: &Lua,
) -> mlua::Result<Value> {
    if !has_component::<C>(world, entity) {
        live_entity_mut(world, entity)?.insert(C::default());
    }
    get_component::<C>(world, entity, lua)
}

fn remove_component<C: ScriptComponent>(world: &mut World, entity: Entity) -> mlua::Result<bool> {
    Ok(live_entity_mut(world, entity)?.take::<C>().is_some())
}

fn set_component<C: ScriptComponent>(
    world: &mut World,
    entity: Entity,
    lua: &Lua,
    value: Value,
) -> mlua::Result<()> {
    let component: C = lua.from_value(value)?;
    live_entity_mut(world, entity)?.insert(component);
    Ok(())
}

fn mark_component_changed<C: ScriptComponent>(world: &mut World, entity: Entity) -> bool {
    match world.get_mut::<C>(entity) {
        Some(mut c) => {
            c.set_changed();
            true
        }
        None => false,
    }
}

#[derive(Clone)]
pub struct EventRegistration {
    pub name: String,
    pub type_name: &'static str,
    pub by_ref: bool,
    pub(crate) setup: fn(&mut App),
    pub(crate) dispatch: fn(&mut World, &EnvironmentManager, &str),
    pub(crate) raise: fn(&mut World, &Lua, &str, Table, Option<Entity>) -> mlua::Result<()>,
}

fn setup_event<E: ScriptEvent>(app: &mut App) {
    app.init_resource::<PendingEvents<E>>()
        .add_event::<Raised<E>>();
}

fn raise_from_script<E: ScriptEvent>(
    world: &mut World,
    lua: &Lua,
    name: &str,
    table: Table,
    target: Option<Entity>,
) -> mlua::Result<()> {
    let event: E = lua.from_value(Value::Table(table))?;
    let mut pending = world
        .get_resource_mut::<PendingEvents<E>>()
        .ok_or_else(|| BindingError::EventNotWired(name.to_string()))?;
    match target {
        Some(entity) => pending.raise_local(entity, event),
        None => pending.raise_broadcast(event),
    }
    Ok(())
}

#[derive(Clone)]
pub struct EventConstructorBinding {
    pub key: String,
    pub event: String,
    pub(crate) build: Arc<dyn Fn(&Lua, MultiValue) -> mlua::Result<Table> + Send + Sync>,
}

/// Frozen name → capability tables shared read-only by every environment.
pub struct CapabilityRegistry {
    subsystems: BTreeMap<String, BindingRegistration>,
    services: BTreeMap<String, BindingRegistration>,
    components: BTreeMap<String, ComponentRegistration>,
    events: BTreeMap<String, EventRegistration>,
    constructors: BTreeMap<String, EventConstructorBinding>,
    warnings: Vec<String>,
}

impl CapabilityRegistry {
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::default()
    }

    pub fn subsystems(&self) -> impl Iterator<Item = &BindingRegistration> {
        self.subsystems.values()
    }

    pub fn services(&self) -> impl Iterator<Item = &BindingRegistration> {
        self.services.values()
    }

    pub fn events(&self) -> impl Iterator<Item = &EventRegistration> {
        self.events.values()
    }

    pub fn constructors(&self) -> impl Iterator<Item = &EventConstructorBinding> {
        self.constructors.values()
    }

    pub fn subsystem(&self, name: &str) -> Option<&BindingRegistration> {
        self.subsystems.get(name)
    }

    pub fn service(&self, name: &str) -> Option<&BindingRegistration> {
        self.services.get(name)
    }

    pub fn event(&self, name: &str) -> Option<&EventRegistration> {
        self.events.get(name)
    }

    pub fn constructor(&self, key: &str) -> Option<&EventConstructorBinding> {
        self.constructors.get(key)
    }

    /// Accepts both `Health` and `HealthComponent`.
    pub fn component(&self, name: &str) -> Option<&ComponentRegistration> {
        self.components
            .get(name)
            .or_else(|| self.components.get(component_key(name)))
    }

    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// Collisions and dropped constructors recorded while building.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    subsystems: Vec<BindingRegistration>,
    services: Vec<BindingRegistration>,
    components: Vec<ComponentRegistration>,
    events: Vec<(EventRegistration, Vec<(String, EventConstructorBinding)>)>,
}

impl CapabilityRegistryBuilder {
    pub fn subsystem<T: ScriptBinding>(mut self) -> Self {
        self.subsystems.push(BindingRegistration {
            name: simple_type_name::<T>().to_string(),
            type_name: std::any::type_name::<T>(),
            bind: T::bind,
        });
        self
    }

    pub fn service<T: ScriptBinding>(mut self) -> Self {
        self.services.push(BindingRegistration {
            name: simple_type_name::<T>().to_string(),
            type_name: std::any::type_name::<T>(),
            bind: T::bind,
        });
        self
    }

    pub fn component<C: ScriptComponent>(mut self, networked: bool) -> Self {
        self.components.push(ComponentRegistration {
            name: component_key(simple_type_name::<C>()).to_string(),
            type_name: std::any::type_name::<C>(),
            networked,
            has: has_component::<C>,
            get: get_component::<C>,
            ensure: ensure_component::<C>,
            remove: remove_component::<C>,
            set: set_component::<C>,
            mark_changed: mark_component_changed::<C>,
        });
        self
    }

    pub fn event<E: ScriptEvent>(mut self) -> Self {
        let name = simple_type_name::<E>().to_string();
        let constructors = E::constructors()
            .into_iter()
            .map(|ctor| {
                let key = ctor.key(&name);
                let event_name = name.clone();
                let build = ctor.build;
                let binding = EventConstructorBinding {
                    key: key.clone(),
                    event: name.clone(),
                    build: Arc::new(move |lua: &Lua, args: MultiValue| {
                        let event = build(lua, args)?;
                        bridge::event_to_table(lua, &event_name, &event)
                    }),
                };
                (key, binding)
            })
            .collect();
        self.events.push((
            EventRegistration {
                name,
                type_name: std::any::type_name::<E>(),
                by_ref: E::BY_REF,
                setup: setup_event::<E>,
                dispatch: bridge::dispatch_pending::<E>,
                raise: raise_from_script::<E>,
            },
            constructors,
        ));
        self
    }

    pub fn build(self) -> CapabilityRegistry {
        let started = Instant::now();
        let mut warnings = Vec::new();

        let subsystems = insert_unique("subsystem", self.subsystems, &mut warnings, |r| {
            (&r.name, r.type_name)
        });
        let services = insert_unique("service", self.services, &mut warnings, |r| {
            (&r.name, r.type_name)
        });
        let components = insert_unique("component", self.components, &mut warnings, |r| {
            (&r.name, r.type_name)
        });

        let mut events: BTreeMap<String, EventRegistration> = BTreeMap::new();
        let mut constructors = BTreeMap::new();
        for (registration, ctors) in self.events {
            if let Some(existing) = events.get(&registration.name) {
                let msg = format!(
                    "event {} from {} collides with {}; skipped",
                    registration.name, registration.type_name, existing.type_name
                );
                warn!("[LuaHost registry] {msg}");
                warnings.push(msg);
                continue;
            }
            for (key, binding) in ctors {
                if constructors.contains_key(&key) {
                    let msg = format!("duplicate event constructor {key}; skipped");
                    warn!("[LuaHost registry] {msg}");
                    warnings.push(msg);
                    continue;
                }
                constructors.insert(key, binding);
            }
            events.insert(registration.name.clone(), registration);
        }

        info!(
            "[LuaHost registry] Built {} subsystems, {} services, {} components, {} events ({} constructors) in {:.2}ms",
            subsystems.len(),
            services.len(),
            components.len(),
            events.len(),
            constructors.len(),
            started.elapsed().as_secs_f64() * 1000.0
        );

        CapabilityRegistry {
            subsystems,
            services,
            components,
            events,
            constructors,
            warnings,
        }
    }
}

/// First registration of a name wins; later ones are recorded and dropped.
fn insert_unique<T>(
    kind: &str,
    items: Vec<T>,
    warnings: &mut Vec<String>,
    identity: impl Fn(&T) -> (&String, &'static str),
) -> BTreeMap<String, T> {
    let mut out: BTreeMap<String, T> = BTreeMap::new();
    for item in items {
        let (key, type_name) = identity(&item);
        let key = key.clone();
        if let Some(existing) = out.get(&key) {
            let msg = format!(
                "{kind} {key} from {type_name} collides with {}; skipped",
                identity(existing).1
            );
            warn!("[LuaHost registry] {msg}");
            warnings.push(msg);
            continue;
        }
        out.insert(key, item);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    mod physics {
        use super::*;
        pub struct ClockSystem;
        impl ScriptBinding for ClockSystem {
            fn bind(lua: &Lua, _world: &WorldAccess) -> mlua::Result<Table> {
                let t = lua.create_table()?;
                t.set("origin", "physics")?;
                Ok(t)
            }
        }
    }

    mod audio {
        use super::*;
        pub struct ClockSystem;
        impl ScriptBinding for ClockSystem {
            fn bind(lua: &Lua, _world: &WorldAccess) -> mlua::Result<Table> {
                let t = lua.create_table()?;
                t.set("origin", "audio")?;
                Ok(t)
            }
        }
    }

    #[derive(Component, Serialize, Deserialize, Default)]
    struct FuelComponent {
        litres: f32,
    }

    #[derive(Serialize, Deserialize, Clone)]
    struct PingEvent {
        strength: f32,
    }

    impl ScriptEvent for PingEvent {
        fn constructors() -> Vec<EventConstructor<Self>> {
            vec![
                EventConstructor::new(&["f32"], |strength: f32| Ok(PingEvent { strength })),
                EventConstructor::new(&["F32"], |strength: f32| {
                    Ok(PingEvent {
                        strength: strength * 2.0,
                    })
                }),
                EventConstructor::new(&[], |()| Ok(PingEvent { strength: 1.0 })),
            ]
        }
    }

    #[test]
    fn colliding_simple_names_keep_first_and_warn() {
        let registry = CapabilityRegistry::builder()
            .subsystem::<physics::ClockSystem>()
            .subsystem::<audio::ClockSystem>()
            .build();
        assert_eq!(registry.subsystems().count(), 1);
        let kept = registry.subsystem("ClockSystem").expect("clock");
        assert!(kept.type_name.contains("physics"));
        assert_eq!(registry.warnings().len(), 1);
        assert!(registry.warnings()[0].contains("ClockSystem"));
    }

    #[test]
    fn component_keys_drop_the_component_suffix() {
        let registry = CapabilityRegistry::builder()
            .component::<FuelComponent>(true)
            .build();
        assert_eq!(registry.component_names().collect::<Vec<_>>(), vec!["Fuel"]);
        assert!(registry.component("Fuel").is_some());
        assert!(registry.component("FuelComponent").is_some());
        assert!(registry.component("Oxygen").is_none());
    }

    #[test]
    fn constructor_keys_follow_parameter_types_and_drop_duplicates() {
        let registry = CapabilityRegistry::builder().event::<PingEvent>().build();
        let keys: Vec<_> = registry.constructors().map(|c| c.key.clone()).collect();
        assert_eq!(keys, vec!["PingEvent".to_string(), "PingEvent_f32".to_string()]);
        assert_eq!(registry.warnings().len(), 1);

        let lua = Lua::new();
        let ctor = registry.constructor("PingEvent_f32").expect("ctor");
        let table = (ctor.build)(&lua, MultiValue::from_iter([Value::Number(3.0)]))
            .expect("build");
        assert_eq!(table.get::<f32>("strength").expect("strength"), 3.0);
        assert_eq!(table.get::<String>("__type").expect("type"), "PingEvent");
    }

    #[test]
    fn simple_type_name_strips_paths_and_generics() {
        assert_eq!(simple_type_name::<physics::ClockSystem>(), "ClockSystem");
        assert_eq!(simple_type_name::<PendingEvents<PingEvent>>(), "PendingEvents");
    }
}
