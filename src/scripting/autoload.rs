use std::path::{Path, PathBuf};

use bevy::prelude::*;
use crossbeam_channel::{Receiver, Sender};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::environment::with_environments;
use super::render;

/// Loads `*.lua` files from a directory at startup, one environment per file
/// named after its stem, and optionally re-runs files as they change.
pub struct ScriptAutoloadPlugin {
    pub dir: PathBuf,
    pub watch: bool,
}

#[derive(Resource, Clone)]
pub struct AutoloadDir(pub PathBuf);

pub struct ScriptChanged {
    pub name: String,
    pub source: String,
}

#[derive(Resource)]
pub struct ScriptWatchReceiver(pub Receiver<ScriptChanged>);

impl Plugin for ScriptAutoloadPlugin {
    fn build(&self, app: &mut App) {
        app.insert_resource(AutoloadDir(self.dir.clone()))
            .add_systems(Startup, autoload_scripts);
        if self.watch {
            let (tx, rx) = crossbeam_channel::unbounded::<ScriptChanged>();
            let dir = self.dir.clone();
            std::thread::spawn(move || run_watcher(dir, tx));
            app.insert_resource(ScriptWatchReceiver(rx))
                .add_systems(Update, apply_script_changes);
        }
    }
}

fn script_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("lua") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

/// `(environment name, source)` for every script in `dir`, sorted by name.
pub fn read_scripts(dir: &Path) -> std::io::Result<Vec<(String, String)>> {
    let mut scripts = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = script_name(&path) else {
            continue;
        };
        match std::fs::read_to_string(&path) {
            Ok(source) => scripts.push((name, source)),
            Err(e) => warn!("[LuaHost autoload] Skipping {}: {e}", path.display()),
        }
    }
    scripts.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(scripts)
}

/// Creates the environment if needed and runs `source` in it.
pub fn load_script(world: &mut World, name: &str, source: &str) -> bool {
    with_environments(world, |world, envs| {
        if !envs.contains(name) && !envs.create_environment(name) {
            return false;
        }
        match envs.exec_in_environment(world, name, source) {
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                warn!(
                    "[LuaHost autoload] Script '{name}' failed: {}",
                    render::error_text(&e)
                );
                false
            }
            None => false,
        }
    })
    .unwrap_or(false)
}

pub fn autoload_scripts(world: &mut World) {
    let Some(dir) = world.get_resource::<AutoloadDir>().map(|d| d.0.clone()) else {
        return;
    };
    let scripts = match read_scripts(&dir) {
        Ok(scripts) => scripts,
        Err(e) => {
            warn!("[LuaHost autoload] Cannot read {}: {e}", dir.display());
            return;
        }
    };
    let total = scripts.len();
    let loaded = scripts
        .iter()
        .filter(|(name, source)| load_script(world, name, source))
        .count();
    info!(
        "[LuaHost autoload] Loaded {loaded}/{total} scripts from {}",
        dir.display()
    );
}

fn apply_script_changes(world: &mut World) {
    let changes: Vec<ScriptChanged> = match world.get_resource::<ScriptWatchReceiver>() {
        Some(rx) => rx.0.try_iter().collect(),
        None => return,
    };
    for change in changes {
        if load_script(world, &change.name, &change.source) {
            info!("[LuaHost autoload] Reloaded '{}'", change.name);
        }
    }
}

fn run_watcher(dir: PathBuf, tx: Sender<ScriptChanged>) {
    let mut watcher: RecommendedWatcher =
        match notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| {
            let Ok(event) = res else {
                return;
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            for path in &event.paths {
                let Some(name) = script_name(path) else {
                    continue;
                };
                if let Ok(source) = std::fs::read_to_string(path) {
                    let _ = tx.send(ScriptChanged { name, source });
                }
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                error!("[LuaHost autoload] Failed to create watcher: {e}");
                return;
            }
        };

    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        error!("[LuaHost autoload] Failed to watch {}: {e}", dir.display());
        return;
    }
    info!("[LuaHost autoload] Watching {}", dir.display());

    // The watcher stops when dropped.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}
