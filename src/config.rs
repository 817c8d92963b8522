use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::net::permissions::AdminFlags;
use crate::scripting::environment::DEFAULT_HOOK_INSTRUCTION_INTERVAL;
use crate::scripting::ScriptLimits;

pub const DEFAULT_BIND: &str = "127.0.0.1:3100";
pub const DEFAULT_TICK_HZ: f64 = 60.0;
pub const DEFAULT_SCRIPT_BUDGET_MS: u64 = 50;
pub const DEFAULT_RATE_LIMIT_PER_SEC: u32 = 120;

#[derive(Deserialize, Clone, Debug)]
pub struct UserConfig {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl UserConfig {
    pub fn admin_flags(&self) -> Result<AdminFlags, ConfigError> {
        self.flags.iter().try_fold(AdminFlags::empty(), |acc, flag| {
            AdminFlags::parse(flag)
                .map(|f| acc | f)
                .ok_or_else(|| ConfigError::UnknownFlag {
                    user: self.name.clone(),
                    flag: flag.clone(),
                })
        })
    }
}

/// Host settings loaded from `luahost.json`, overridable per field through
/// `LUAHOST_*` environment variables.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct HostConfig {
    pub bind: String,
    pub tick_hz: f64,
    /// Wall-clock budget per script entry. 0 disables the guard.
    pub script_budget_ms: u64,
    pub hook_instruction_interval: u32,
    pub scripts_dir: Option<PathBuf>,
    pub watch_scripts: bool,
    pub listen: bool,
    /// Upgrade requests accepted per user per second.
    pub rate_limit_per_sec: u32,
    pub users: Vec<UserConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            tick_hz: DEFAULT_TICK_HZ,
            script_budget_ms: DEFAULT_SCRIPT_BUDGET_MS,
            hook_instruction_interval: DEFAULT_HOOK_INSTRUCTION_INTERVAL,
            scripts_dir: None,
            watch_scripts: false,
            listen: true,
            rate_limit_per_sec: DEFAULT_RATE_LIMIT_PER_SEC,
            users: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::from_json(&contents, &display)
    }

    pub fn from_json(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        let cfg: HostConfig =
            serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
                path: origin.to_string(),
                source,
            })?;
        for user in &cfg.users {
            user.admin_flags()?;
        }
        Ok(cfg)
    }

    /// Reads the config file named by `LUAHOST_CONFIG` (default `luahost.json`),
    /// then applies environment overrides. A missing file yields defaults.
    pub fn load() -> Self {
        let path = std::env::var("LUAHOST_CONFIG")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "luahost.json".to_string());
        let path = PathBuf::from(path);
        let mut cfg = if path.exists() {
            match Self::from_path(&path) {
                Ok(cfg) => {
                    println!("[LuaHost] Loaded config from {}", path.display());
                    cfg
                }
                Err(e) => {
                    eprintln!("[LuaHost] {e}; falling back to defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        };
        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(bind) = var("LUAHOST_BIND") {
            self.bind = bind;
        }
        if let Some(hz) = var("LUAHOST_TICK_HZ").and_then(|v| v.parse::<f64>().ok()) {
            self.tick_hz = hz;
        }
        if let Some(ms) = var("LUAHOST_SCRIPT_BUDGET_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.script_budget_ms = ms;
        }
        if let Some(n) = var("LUAHOST_HOOK_INTERVAL").and_then(|v| v.parse::<u32>().ok()) {
            self.hook_instruction_interval = n;
        }
        if let Some(n) = var("LUAHOST_RATE_LIMIT_PER_SEC").and_then(|v| v.parse::<u32>().ok()) {
            self.rate_limit_per_sec = n.max(1);
        }
        if let Some(dir) = var("LUAHOST_SCRIPTS_DIR") {
            self.scripts_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn tick_hz(&self) -> f64 {
        if self.tick_hz.is_finite() && self.tick_hz > 0.0 {
            self.tick_hz
        } else {
            DEFAULT_TICK_HZ
        }
    }

    pub fn script_limits(&self) -> ScriptLimits {
        ScriptLimits {
            budget: Duration::from_millis(self.script_budget_ms),
            instruction_interval: self.hook_instruction_interval.clamp(100, 1_000_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_users_and_fills_missing_fields_with_defaults() {
        let cfg = HostConfig::from_json(
            r#"{
                "bind": "0.0.0.0:4000",
                "users": [{ "name": "ada", "token": "t1", "flags": ["debug", "fun"] }]
            }"#,
            "inline",
        )
        .expect("config");
        assert_eq!(cfg.bind, "0.0.0.0:4000");
        assert_eq!(cfg.tick_hz, DEFAULT_TICK_HZ);
        assert_eq!(cfg.script_budget_ms, DEFAULT_SCRIPT_BUDGET_MS);
        let flags = cfg.users[0].admin_flags().expect("flags");
        assert!(flags.can_script());
    }

    #[test]
    fn rejects_unknown_permission_flags() {
        let err = HostConfig::from_json(
            r#"{ "users": [{ "name": "bob", "token": "t", "flags": ["root"] }] }"#,
            "inline",
        )
        .expect_err("unknown flag should fail");
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut cfg = HostConfig::default();
        cfg.apply_env_overrides(|name| match name {
            "LUAHOST_BIND" => Some("10.0.0.1:9000".to_string()),
            "LUAHOST_SCRIPT_BUDGET_MS" => Some(" 0 ".to_string()),
            "LUAHOST_TICK_HZ" => Some("not a number".to_string()),
            _ => None,
        });
        assert_eq!(cfg.bind, "10.0.0.1:9000");
        assert_eq!(cfg.script_budget_ms, 0);
        assert_eq!(cfg.tick_hz(), DEFAULT_TICK_HZ);
        assert!(cfg.script_limits().budget.is_zero());
    }
}
