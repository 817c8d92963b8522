use std::sync::Arc;

use bevy::prelude::*;
use mlua::{Lua, LuaOptions, MultiValue, StdLib, Table, Value};

use super::convert::EntityHandle;
use super::registry::{CapabilityRegistry, ComponentRegistration};
use super::render;
use super::world_access::{live_entity, WorldAccess};
use crate::error::BindingError;

/// Globals stripped from every sandbox after the standard libraries load.
const REMOVED_GLOBALS: &[&str] = &[
    "dofile",
    "loadfile",
    "load",
    "loadstring",
    "require",
    "collectgarbage",
    "module",
];

/// Builds a fresh interpreter with the capability tables and helpers installed.
pub(crate) fn create_sandbox(
    env_name: &str,
    registry: &Arc<CapabilityRegistry>,
    access: &WorldAccess,
) -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH,
        LuaOptions::default(),
    )?;
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.set(*name, Value::Nil)?;
    }
    install_print(&lua, env_name)?;
    install_capabilities(&lua, registry, access)?;
    install_entity_manager(&lua, registry, access)?;
    install_component_helpers(&lua, registry, access)?;
    Ok(lua)
}

fn install_print(lua: &Lua, env_name: &str) -> mlua::Result<()> {
    let env_name = env_name.to_string();
    let print = lua.create_function(move |_, args: MultiValue| {
        let line = args
            .iter()
            .map(render::render_scalar)
            .collect::<Vec<_>>()
            .join("\t");
        info!("[LuaHost {env_name}] {line}");
        Ok(())
    })?;
    lua.globals().set("print", print)
}

fn install_capabilities(
    lua: &Lua,
    registry: &Arc<CapabilityRegistry>,
    access: &WorldAccess,
) -> mlua::Result<()> {
    let systems = lua.create_table()?;
    for binding in registry.subsystems() {
        systems.set(binding.name.as_str(), (binding.bind)(lua, access)?)?;
    }
    let services = lua.create_table()?;
    for binding in registry.services() {
        services.set(binding.name.as_str(), (binding.bind)(lua, access)?)?;
    }
    let constructors = lua.create_table()?;
    for ctor in registry.constructors() {
        let build = ctor.build.clone();
        let f = lua.create_function(move |lua, args: MultiValue| build(lua, args))?;
        constructors.set(ctor.key.as_str(), f)?;
    }

    let globals = lua.globals();
    globals.set("systems", systems)?;
    globals.set("services", services)?;
    globals.set("createevent", constructors)?;
    Ok(())
}

fn install_entity_manager(
    lua: &Lua,
    registry: &Arc<CapabilityRegistry>,
    access: &WorldAccess,
) -> mlua::Result<()> {
    let entman = lua.create_table()?;

    let world = access.clone();
    entman.set(
        "spawn",
        lua.create_function(move |_, ()| {
            Ok(EntityHandle::from(world.with(|w| w.spawn_empty().id())?))
        })?,
    )?;

    let world = access.clone();
    entman.set(
        "exists",
        lua.create_function(move |_, id: EntityHandle| {
            Ok(world.with(|w| live_entity(w, id.0).is_ok())?)
        })?,
    )?;

    let world = access.clone();
    entman.set(
        "despawn",
        lua.create_function(move |_, id: EntityHandle| {
            Ok(world.with(|w| match live_entity(w, id.0) {
                Ok(entity) => w.despawn(entity),
                Err(_) => false,
            })?)
        })?,
    )?;

    let world = access.clone();
    let registry = registry.clone();
    entman.set(
        "raise",
        lua.create_function(move |lua, (event, target): (Table, Option<EntityHandle>)| {
            let name: String = event
                .get::<Option<String>>("__type")?
                .ok_or_else(|| BindingError::UnknownEvent("<untagged>".to_string()))?;
            let registration = registry
                .event(&name)
                .ok_or_else(|| BindingError::UnknownEvent(name.clone()))?;
            world.with(|w| {
                let target = target.map(|t| live_entity(w, t.0)).transpose()?;
                (registration.raise)(w, lua, &name, event, target)
            })?
        })?,
    )?;

    lua.globals().set("entman", entman)
}

/// Resolves the entity and component for a helper call and runs `f` with
/// the world borrowed.
fn with_component<R>(
    registry: &CapabilityRegistry,
    access: &WorldAccess,
    id: EntityHandle,
    name: &str,
    f: impl FnOnce(&mut World, Entity, &ComponentRegistration) -> mlua::Result<R>,
) -> mlua::Result<R> {
    access.with(|world| {
        let entity = live_entity(world, id.0)?;
        let registration = registry
            .component(name)
            .ok_or_else(|| BindingError::UnknownComponent(name.to_string()))?;
        f(world, entity, registration)
    })?
}

fn require_networked(registration: &ComponentRegistration) -> Result<(), BindingError> {
    if registration.networked {
        Ok(())
    } else {
        Err(BindingError::NotNetworked(registration.name.clone()))
    }
}

fn install_component_helpers(
    lua: &Lua,
    registry: &Arc<CapabilityRegistry>,
    access: &WorldAccess,
) -> mlua::Result<()> {
    let globals = lua.globals();

    let (reg, world) = (registry.clone(), access.clone());
    globals.set(
        "comp",
        lua.create_function(move |lua, (id, name): (EntityHandle, String)| {
            with_component(&reg, &world, id, &name, |w, e, c| (c.get)(w, e, lua))
        })?,
    )?;

    let (reg, world) = (registry.clone(), access.clone());
    globals.set(
        "ensurecomp",
        lua.create_function(move |lua, (id, name): (EntityHandle, String)| {
            with_component(&reg, &world, id, &name, |w, e, c| (c.ensure)(w, e, lua))
        })?,
    )?;

    let (reg, world) = (registry.clone(), access.clone());
    globals.set(
        "hascomp",
        lua.create_function(move |_, (id, name): (EntityHandle, String)| {
            with_component(&reg, &world, id, &name, |w, e, c| Ok((c.has)(w, e)))
        })?,
    )?;

    let (reg, world) = (registry.clone(), access.clone());
    globals.set(
        "remcomp",
        lua.create_function(move |_, (id, name): (EntityHandle, String)| {
            with_component(&reg, &world, id, &name, |w, e, c| (c.remove)(w, e))
        })?,
    )?;

    let (reg, world) = (registry.clone(), access.clone());
    globals.set(
        "dirty",
        lua.create_function(move |_, (id, name): (EntityHandle, String)| {
            with_component(&reg, &world, id, &name, |w, e, c| {
                require_networked(c)?;
                Ok((c.mark_changed)(w, e))
            })
        })?,
    )?;

    let (reg, world) = (registry.clone(), access.clone());
    globals.set(
        "setcomp",
        lua.create_function(
            move |lua, (id, name, value): (EntityHandle, String, Value)| {
                with_component(&reg, &world, id, &name, |w, e, c| {
                    require_networked(c)?;
                    (c.set)(w, e, lua, value)
                })
            },
        )?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::environment::{EnvironmentManager, ScriptLimits};
    use serde::{Deserialize, Serialize};

    #[derive(Component, Serialize, Deserialize, Default, Debug, PartialEq)]
    struct ShieldComponent {
        charge: f32,
    }

    #[derive(Component, Serialize, Deserialize, Default)]
    struct NoteComponent {
        text: String,
    }

    fn setup() -> (World, EnvironmentManager, Entity) {
        let registry = CapabilityRegistry::builder()
            .component::<ShieldComponent>(true)
            .component::<NoteComponent>(false)
            .build();
        let mut envs = EnvironmentManager::new(Arc::new(registry), ScriptLimits::default());
        envs.create_environment("t");
        let mut world = World::new();
        let e = world.spawn(ShieldComponent { charge: 3.0 }).id();
        (world, envs, e)
    }

    fn run(envs: &mut EnvironmentManager, world: &mut World, src: &str) -> mlua::Result<String> {
        envs.exec_in_environment(world, "t", src)
            .expect("environment")
            .map(|v| render::render_values(&v).unwrap_or_default())
    }

    #[test]
    fn helpers_read_and_toggle_components() {
        let (mut world, mut envs, e) = setup();
        let id = e.to_bits();
        let src = format!(
            "local e = {id}
             local had = hascomp(e, 'Shield')
             local charge = comp(e, 'ShieldComponent').charge
             local note = ensurecomp(e, 'Note')
             return had, charge, note.text == '', hascomp(e, 'Note'), remcomp(e, 'Note'), remcomp(e, 'Note')"
        );
        let out = run(&mut envs, &mut world, &src).expect("script ok");
        assert_eq!(out, "true, 3, true, true, true, false");
        assert!(world.get::<NoteComponent>(e).is_none());
    }

    #[test]
    fn setcomp_writes_and_requires_networked() {
        let (mut world, mut envs, e) = setup();
        let id = e.to_bits();
        run(&mut envs, &mut world, &format!("setcomp({id}, 'Shield', {{ charge = 9 }})"))
            .expect("set shield");
        assert_eq!(world.get::<ShieldComponent>(e), Some(&ShieldComponent { charge: 9.0 }));

        let err = run(&mut envs, &mut world, &format!("dirty({id}, 'Note')"))
            .expect_err("note is not networked");
        assert_eq!(render::error_text(&err), "component Note is not networked");
        assert_eq!(
            run(&mut envs, &mut world, &format!("return dirty({id}, 'Shield')")).expect("dirty"),
            "true"
        );
    }

    #[test]
    fn helpers_reject_bad_entities_and_unknown_components() {
        let (mut world, mut envs, e) = setup();
        let id = e.to_bits();
        let err = run(&mut envs, &mut world, &format!("return comp({id}, 'Cloak')"))
            .expect_err("unknown component");
        assert_eq!(render::error_text(&err), "unknown component Cloak");

        world.despawn(e);
        let err = run(&mut envs, &mut world, &format!("return hascomp({id}, 'Shield')"))
            .expect_err("dead entity");
        assert!(render::error_text(&err).contains(&id.to_string()));
    }

    #[test]
    fn next_generation_handles_raise_instead_of_panicking() {
        let (mut world, mut envs, e) = setup();
        world.despawn(e);
        let next = e.to_bits() + (1 << 32);
        for src in [
            format!("return ensurecomp({next}, 'Shield')"),
            format!("return remcomp({next}, 'Shield')"),
            format!("setcomp({next}, 'Shield', {{ charge = 1 }})"),
            format!("return comp({next}, 'Shield')"),
        ] {
            let err = run(&mut envs, &mut world, &src).expect_err("stale handle");
            assert!(render::error_text(&err).contains("was not found"), "{src}");
        }
        assert_eq!(run(&mut envs, &mut world, "return 1").expect("still usable"), "1");
    }

    #[test]
    fn entity_manager_spawns_and_despawns() {
        let (mut world, mut envs, _) = setup();
        let out = run(
            &mut envs,
            &mut world,
            "local e = entman.spawn()
             local alive = entman.exists(e)
             local removed = entman.despawn(e)
             return alive, removed, entman.exists(e), entman.despawn(e)",
        )
        .expect("script ok");
        assert_eq!(out, "true, true, false, false");
    }
}
