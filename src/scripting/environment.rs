use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bevy::prelude::*;
use mlua::{HookTriggers, Lua, MultiValue, Value, VmState};

use super::bindings;
use super::registry::CapabilityRegistry;
use super::render;
use super::world_access::WorldAccess;

pub const DEFAULT_SCRIPT_BUDGET: Duration = Duration::from_millis(50);
pub const DEFAULT_HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;
const MAX_UPDATE_ERROR_STREAK: u32 = 8;

/// Wall-clock guard applied to every script entry. A zero budget disables it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScriptLimits {
    pub budget: Duration,
    pub instruction_interval: u32,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            budget: DEFAULT_SCRIPT_BUDGET,
            instruction_interval: DEFAULT_HOOK_INSTRUCTION_INTERVAL,
        }
    }
}

pub(crate) fn call_with_budget<T>(
    lua: &Lua,
    limits: ScriptLimits,
    f: impl FnOnce() -> mlua::Result<T>,
) -> mlua::Result<T> {
    if limits.budget.is_zero() {
        return f();
    }
    let started = Instant::now();
    let max_duration = limits.budget;
    let budget_ms = max_duration.as_secs_f64() * 1000.0;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(limits.instruction_interval.max(1)),
        move |_lua, _debug| {
            if started.elapsed() >= max_duration {
                return Err(mlua::Error::RuntimeError(format!(
                    "Script execution budget exceeded ({budget_ms:.1}ms)"
                )));
            }
            Ok(VmState::Continue)
        },
    );
    let out = f();
    lua.remove_hook();
    out
}

pub struct Environment {
    name: String,
    lua: Lua,
    baseline: HashSet<String>,
    created_at: Instant,
    update_failures: u32,
}

impl Environment {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Globals installed at creation; excluded from rendered state.
    pub fn baseline(&self) -> &HashSet<String> {
        &self.baseline
    }

    pub fn update_suspended(&self) -> bool {
        self.update_failures >= MAX_UPDATE_ERROR_STREAK
    }
}

/// Owns every named sandbox. Environments are kept in creation order, which
/// is also the order [`EnvironmentManager::tick`] visits them.
pub struct EnvironmentManager {
    environments: Vec<Environment>,
    capabilities: Arc<CapabilityRegistry>,
    access: WorldAccess,
    limits: ScriptLimits,
}

impl EnvironmentManager {
    pub fn new(capabilities: Arc<CapabilityRegistry>, limits: ScriptLimits) -> Self {
        Self {
            environments: Vec::new(),
            capabilities,
            access: WorldAccess::default(),
            limits,
        }
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    pub fn limits(&self) -> ScriptLimits {
        self.limits
    }

    pub fn names(&self) -> Vec<String> {
        self.environments.iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// Returns false when the name is taken or the sandbox fails to build.
    pub fn create_environment(&mut self, name: &str) -> bool {
        if self.contains(name) {
            return false;
        }
        let lua = match bindings::create_sandbox(name, &self.capabilities, &self.access) {
            Ok(lua) => lua,
            Err(e) => {
                error!("[LuaHost scripts] Failed to build environment '{name}': {e}");
                return false;
            }
        };
        let baseline = lua
            .globals()
            .pairs::<Value, Value>()
            .filter_map(Result::ok)
            .filter_map(|(k, _)| match k {
                Value::String(s) => Some(s.to_string_lossy()),
                _ => None,
            })
            .collect();
        self.environments.push(Environment {
            name: name.to_string(),
            lua,
            baseline,
            created_at: Instant::now(),
            update_failures: 0,
        });
        info!("[LuaHost scripts] Created environment '{name}'");
        true
    }

    /// Removes the environment. Viewer bookkeeping is the caller's job.
    pub fn delete_environment(&mut self, name: &str) -> bool {
        let Some(index) = self.environments.iter().position(|e| e.name == name) else {
            return false;
        };
        self.environments.remove(index);
        info!("[LuaHost scripts] Deleted environment '{name}'");
        true
    }

    /// Runs `source` against the environment's persistent globals. `None`
    /// when no such environment exists; script errors are returned as-is.
    pub fn exec_in_environment(
        &mut self,
        world: &mut World,
        name: &str,
        source: &str,
    ) -> Option<mlua::Result<MultiValue>> {
        let limits = self.limits;
        let access = self.access.clone();
        let env = self.environments.iter_mut().find(|e| e.name == name)?;
        env.update_failures = 0;
        let lua = &env.lua;
        Some(access.enter(world, || {
            call_with_budget(lua, limits, || {
                lua.load(source)
                    .set_name(format!("={name}"))
                    .eval::<MultiValue>()
            })
        }))
    }

    pub fn environment_state(&self, name: &str) -> Option<String> {
        let env = self.get(name)?;
        Some(render::render_globals(&env.lua.globals(), &env.baseline))
    }

    /// Calls `Update(dt)` in every environment that defines it. An environment
    /// whose `Update` keeps failing is skipped until its next execution.
    pub fn tick(&mut self, world: &mut World, dt: f32) {
        if self.environments.is_empty() {
            return;
        }
        let limits = self.limits;
        let access = self.access.clone();
        access.enter(world, || {
            for env in &mut self.environments {
                if env.update_failures >= MAX_UPDATE_ERROR_STREAK {
                    continue;
                }
                let update = match env.lua.globals().get::<Value>("Update") {
                    Ok(Value::Function(f)) => f,
                    _ => continue,
                };
                match call_with_budget(&env.lua, limits, || update.call::<()>(dt)) {
                    Ok(()) => env.update_failures = 0,
                    Err(e) => {
                        env.update_failures += 1;
                        warn!(
                            "[LuaHost scripts] Update in '{}' failed: {}",
                            env.name,
                            render::error_text(&e)
                        );
                        if env.update_failures == MAX_UPDATE_ERROR_STREAK {
                            warn!(
                                "[LuaHost scripts] Suspending Update in '{}' after {} consecutive errors",
                                env.name, MAX_UPDATE_ERROR_STREAK
                            );
                        }
                    }
                }
            }
        });
    }

    /// Invokes a global handler function by name. `None` when the environment
    /// or the function is missing, which callers treat as "not intercepted".
    pub fn call_handler<R>(
        &self,
        world: &mut World,
        env_name: &str,
        handler: &str,
        args: impl FnOnce(&Lua) -> mlua::Result<MultiValue>,
        ret: impl FnOnce(&Lua, Value) -> R,
    ) -> Option<mlua::Result<R>> {
        let env = self.get(env_name)?;
        let func = match env.lua.globals().get::<Value>(handler) {
            Ok(Value::Function(f)) => f,
            _ => return None,
        };
        Some(self.access.enter(world, || {
            let args = args(&env.lua)?;
            let value = call_with_budget(&env.lua, self.limits, || func.call::<Value>(args))?;
            Ok(ret(&env.lua, value))
        }))
    }
}

struct Reinsert<'a> {
    world: &'a mut World,
    envs: Option<EnvironmentManager>,
}

impl Drop for Reinsert<'_> {
    fn drop(&mut self) {
        if let Some(envs) = self.envs.take() {
            self.world.insert_non_send_resource(envs);
        }
    }
}

/// Lifts the manager out of the world so scripts can borrow the world. The
/// manager goes back even if `f` unwinds.
pub fn with_environments<R>(
    world: &mut World,
    f: impl FnOnce(&mut World, &mut EnvironmentManager) -> R,
) -> Option<R> {
    let envs = world.remove_non_send_resource::<EnvironmentManager>()?;
    let mut guard = Reinsert {
        world,
        envs: Some(envs),
    };
    let Reinsert { world, envs } = &mut guard;
    let envs = envs.as_mut()?;
    Some(f(world, envs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> EnvironmentManager {
        EnvironmentManager::new(
            Arc::new(CapabilityRegistry::builder().build()),
            ScriptLimits::default(),
        )
    }

    fn exec(envs: &mut EnvironmentManager, world: &mut World, name: &str, src: &str) -> String {
        let values = envs
            .exec_in_environment(world, name, src)
            .expect("environment exists")
            .expect("script ok");
        render::render_values(&values).unwrap_or_default()
    }

    #[test]
    fn create_is_unique_and_keeps_existing_state() {
        let mut world = World::new();
        let mut envs = manager();
        assert!(envs.create_environment("test"));
        exec(&mut envs, &mut world, "test", "x = 5");
        assert!(!envs.create_environment("test"));
        assert_eq!(exec(&mut envs, &mut world, "test", "return x + 1"), "6");
        assert_eq!(envs.len(), 1);
    }

    #[test]
    fn state_persists_per_environment_and_is_isolated() {
        let mut world = World::new();
        let mut envs = manager();
        envs.create_environment("a");
        envs.create_environment("b");
        exec(&mut envs, &mut world, "a", "counter = 41; function bump() counter = counter + 1 end");
        exec(&mut envs, &mut world, "a", "bump()");
        assert_eq!(exec(&mut envs, &mut world, "a", "return counter"), "42");
        assert_eq!(exec(&mut envs, &mut world, "b", "return counter"), "nil");
    }

    #[test]
    fn delete_makes_environment_unreachable() {
        let mut world = World::new();
        let mut envs = manager();
        assert!(!envs.delete_environment("ghost"));
        envs.create_environment("gone");
        assert!(envs.delete_environment("gone"));
        assert!(envs.exec_in_environment(&mut world, "gone", "return 1").is_none());
        assert!(envs.environment_state("gone").is_none());
    }

    #[test]
    fn state_excludes_baseline_bindings() {
        let mut world = World::new();
        let mut envs = manager();
        envs.create_environment("s");
        assert_eq!(envs.environment_state("s").as_deref(), Some("{}"));
        exec(&mut envs, &mut world, "s", "player = { name = 'ada', hp = 10 }");
        let state = envs.environment_state("s").expect("state");
        assert!(state.starts_with("player:"), "{state}");
        assert!(state.contains("name: ada"));
        assert!(!state.contains("comp"));
        assert!(!state.contains("string"));
    }

    #[test]
    fn sandbox_removes_file_and_loader_access() {
        let mut world = World::new();
        let mut envs = manager();
        envs.create_environment("box");
        assert_eq!(
            exec(&mut envs, &mut world, "box", "return dofile, loadfile, load, require, io, os"),
            "nil, nil, nil, nil, nil, nil"
        );
    }

    #[test]
    fn script_errors_are_returned_not_swallowed() {
        let mut world = World::new();
        let mut envs = manager();
        envs.create_environment("e");
        let err = envs
            .exec_in_environment(&mut world, "e", "error('nope')")
            .expect("environment exists")
            .expect_err("should fail");
        assert!(render::error_text(&err).contains("nope"));
    }

    #[test]
    fn tick_runs_update_in_creation_order_and_skips_missing() {
        let mut world = World::new();
        let mut envs = manager();
        for name in ["first", "silent", "second"] {
            envs.create_environment(name);
        }
        exec(&mut envs, &mut world, "first", "log = {}; function Update(dt) log[#log + 1] = dt end");
        exec(&mut envs, &mut world, "second", "ticks = 0; function Update(dt) ticks = ticks + 1 end");
        envs.tick(&mut world, 0.5);
        envs.tick(&mut world, 0.25);
        assert_eq!(exec(&mut envs, &mut world, "first", "return log[1], log[2]"), "0.5, 0.25");
        assert_eq!(exec(&mut envs, &mut world, "second", "return ticks"), "2");
        assert_eq!(envs.names(), vec!["first", "silent", "second"]);
    }

    #[test]
    fn failing_update_is_suspended_until_next_exec() {
        let mut world = World::new();
        let mut envs = manager();
        envs.create_environment("flaky");
        exec(&mut envs, &mut world, "flaky", "calls = 0; function Update() calls = calls + 1; error('bad') end");
        for _ in 0..(MAX_UPDATE_ERROR_STREAK + 4) {
            envs.tick(&mut world, 0.1);
        }
        assert!(envs.get("flaky").expect("env").update_suspended());
        assert_eq!(
            exec(&mut envs, &mut world, "flaky", "return calls"),
            MAX_UPDATE_ERROR_STREAK.to_string()
        );
        assert!(!envs.get("flaky").expect("env").update_suspended());
    }

    #[test]
    fn budget_guard_interrupts_runaway_scripts_and_recovers() {
        let mut world = World::new();
        let mut envs = EnvironmentManager::new(
            Arc::new(CapabilityRegistry::builder().build()),
            ScriptLimits {
                budget: Duration::from_nanos(1),
                instruction_interval: 1,
            },
        );
        envs.create_environment("spin");
        let err = envs
            .exec_in_environment(&mut world, "spin", "while true do end")
            .expect("environment exists")
            .expect_err("runaway script should be interrupted");
        assert!(render::error_text(&err).contains("budget"));

        envs.limits.budget = Duration::ZERO;
        assert_eq!(exec(&mut envs, &mut world, "spin", "return 42"), "42");
    }

    #[test]
    fn manager_survives_a_panicking_borrower() {
        let mut world = World::new();
        world.insert_non_send_resource(manager());
        with_environments(&mut world, |_, envs| envs.create_environment("kept"));

        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_environments(&mut world, |_, _| panic!("host bug"));
        }));
        assert!(unwound.is_err());
        let names = with_environments(&mut world, |_, envs| envs.names());
        assert_eq!(names, Some(vec!["kept".to_string()]));
    }

    #[test]
    fn handlers_are_optional() {
        let mut world = World::new();
        let mut envs = manager();
        envs.create_environment("h");
        exec(&mut envs, &mut world, "h", "function PingHandler(a) return a * 2 end");
        let none = envs.call_handler(&mut world, "h", "PongHandler", |_| Ok(MultiValue::new()), |_, v| v);
        assert!(none.is_none());
        let doubled = envs
            .call_handler(
                &mut world,
                "h",
                "PingHandler",
                |lua| mlua::IntoLuaMulti::into_lua_multi(21, lua),
                |_, v| render::render_scalar(&v),
            )
            .expect("handler exists")
            .expect("handler ok");
        assert_eq!(doubled, "42");
        assert!(envs
            .call_handler(&mut world, "missing", "PingHandler", |_| Ok(MultiValue::new()), |_, v| v)
            .is_none());
    }
}
