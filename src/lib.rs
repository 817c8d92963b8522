pub mod config;
pub mod error;
pub mod host;
pub mod net;
pub mod scripting;

use std::time::Duration;

use bevy::app::ScheduleRunnerPlugin;
use bevy::log::LogPlugin;
use bevy::prelude::*;

use config::HostConfig;
use host::GameplayPlugin;
use net::LuaNetPlugin;
use scripting::autoload::ScriptAutoloadPlugin;
use scripting::{CapabilityRegistry, LuaHostPlugin};

/// Headless simulation with the script host, gameplay content and, unless
/// disabled, the remote scripting listener.
pub fn build_app(cfg: &HostConfig) -> App {
    let tick_hz = cfg.tick_hz();
    let mut app = App::new();
    app.add_plugins(MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(
        Duration::from_secs_f64(1.0 / tick_hz),
    )))
    .add_plugins(LogPlugin::default())
    .insert_resource(Time::<Fixed>::from_hz(tick_hz));

    let registry = host::register_capabilities(CapabilityRegistry::builder()).build();
    app.add_plugins(LuaHostPlugin::new(registry, cfg.script_limits()))
        .add_plugins(GameplayPlugin)
        .add_plugins(LuaNetPlugin::from_config(cfg));

    if let Some(dir) = &cfg.scripts_dir {
        app.add_plugins(ScriptAutoloadPlugin {
            dir: dir.clone(),
            watch: cfg.watch_scripts,
        });
    }
    app
}
