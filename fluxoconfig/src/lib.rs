//! # fluxoconfig
//!
//! Settings of the Fluxo cast controller.
//!
//! The effective configuration is built from three layers, later ones winning:
//! the `fluxo.yaml` file compiled into the crate, the user's `config.yaml`,
//! then `FLUXO_CONFIG__SECTION__KEY=value` environment variables. The merged
//! tree is written back to `config.yaml` on load so every key is visible to
//! the user.
//!
//! ```no_run
//! use fluxoconfig::get_config;
//!
//! let config = get_config();
//! let suspend = config.get_suspend_timeout_secs()?;
//! config.set_suspend_timeout_secs(suspend + 15)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod tree;

use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_yaml::{Number, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const EMBEDDED_DEFAULTS: &str = include_str!("fluxo.yaml");
const CONFIG_FILE_NAME: &str = "config.yaml";

const ENV_CONFIG_DIR: &str = "FLUXO_CONFIG";
const ENV_OVERRIDE_PREFIX: &str = "FLUXO_CONFIG__";
const CONFIG_DIR_NAME: &str = ".fluxo";

const DEFAULT_SUSPEND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_SHARE_MIME: &str = "text/plain";
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;

lazy_static! {
    static ref CONFIG: Arc<Config> = Arc::new(
        Config::load_config("").unwrap_or_else(|err| panic!("Cannot load Fluxo configuration: {err:#}"))
    );
}

/// Getter/setter pair for an unsigned integer key.
macro_rules! u64_setting {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<u64> {
            let value = self.get_value($path).unwrap_or(Value::Null);
            Ok(match value {
                Value::Number(n) => n.as_u64().unwrap_or($default),
                Value::String(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                    warn!(key = %$path.join("."), value = %raw, "Not an integer, using default");
                    $default
                }),
                _ => $default,
            })
        }

        pub fn $setter(&self, value: u64) -> Result<()> {
            self.set_value($path, Value::Number(Number::from(value)))
        }
    };
}

/// Getter/setter pair for a boolean key.
macro_rules! bool_setting {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            Ok(self
                .get_value($path)
                .ok()
                .and_then(|v| v.as_bool())
                .unwrap_or($default))
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Typed view of the `cast` section. Missing keys take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CastSettings {
    pub session: SessionSettings,
    pub share: ShareSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub suspend_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            suspend_timeout_secs: DEFAULT_SUSPEND_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ShareSettings {
    pub accepted_mime: String,
}

impl Default for ShareSettings {
    fn default() -> Self {
        Self {
            accepted_mime: DEFAULT_SHARE_MIME.to_string(),
        }
    }
}

/// Loaded configuration, backed by `<dir>/config.yaml`.
///
/// Every setter writes the whole tree back to disk.
#[derive(Debug)]
pub struct Config {
    config_dir: PathBuf,
    file: PathBuf,
    tree: Mutex<Value>,
}

impl Clone for Config {
    fn clone(&self) -> Self {
        Self {
            config_dir: self.config_dir.clone(),
            file: self.file.clone(),
            tree: Mutex::new(self.tree().clone()),
        }
    }
}

impl Config {
    /// Resolves the configuration directory, creating it when missing.
    ///
    /// Candidates, first match wins: `directory` when non-empty, the
    /// `FLUXO_CONFIG` variable, `./.fluxo`, `~/.fluxo`. When none exists
    /// `./.fluxo` is created.
    pub fn config_dir(directory: &str) -> Result<PathBuf> {
        let dir = Self::resolve_dir(directory);
        Self::ensure_writable(&dir)
            .with_context(|| format!("config directory {} is unusable", dir.display()))?;
        Ok(dir)
    }

    fn resolve_dir(directory: &str) -> PathBuf {
        if !directory.is_empty() {
            return PathBuf::from(directory);
        }
        if let Ok(from_env) = env::var(ENV_CONFIG_DIR) {
            debug!(env_var = ENV_CONFIG_DIR, path = %from_env, "Config directory from environment");
            return PathBuf::from(from_env);
        }

        let local = PathBuf::from(CONFIG_DIR_NAME);
        if local.is_dir() {
            return local;
        }
        dirs::home_dir()
            .map(|home| home.join(CONFIG_DIR_NAME))
            .filter(|candidate| candidate.is_dir())
            .unwrap_or(local)
    }

    fn ensure_writable(dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        if !dir.is_dir() {
            return Err(anyhow!("{} is not a directory", dir.display()));
        }
        let probe = dir.join(".fluxo-probe");
        fs::write(&probe, b"probe")?;
        fs::remove_file(&probe)?;
        Ok(())
    }

    /// Loads and merges every layer, then saves the result.
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory)?;
        let file = config_dir.join(CONFIG_FILE_NAME);
        info!(config_file = %file.display(), "Loading configuration");

        let mut merged: Value = serde_yaml::from_str(EMBEDDED_DEFAULTS)?;
        match fs::read_to_string(&file) {
            Ok(text) if !text.trim().is_empty() => {
                let user: Value = serde_yaml::from_str(&text)
                    .with_context(|| format!("invalid YAML in {}", file.display()))?;
                tree::overlay(&mut merged, &tree::normalize_keys(user));
            }
            _ => debug!(config_file = %file.display(), "No user configuration, using defaults"),
        }
        let mut merged = tree::normalize_keys(merged);
        Self::apply_env_overrides(&mut merged);

        let config = Config {
            config_dir,
            file,
            tree: Mutex::new(merged),
        };
        config.save()?;
        Ok(config)
    }

    fn apply_env_overrides(root: &mut Value) {
        for (name, raw) in env::vars() {
            let Some(key_path) = name.strip_prefix(ENV_OVERRIDE_PREFIX) else {
                continue;
            };
            let path: Vec<&str> = key_path.split("__").collect();
            match tree::insert(root, &path, tree::parse_scalar(&raw)) {
                Ok(()) => debug!(env_var = %name, "Configuration overridden from environment"),
                Err(err) => warn!(env_var = %name, error = %err, "Ignoring configuration override"),
            }
        }
    }

    fn tree(&self) -> MutexGuard<'_, Value> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn directory(&self) -> &Path {
        &self.config_dir
    }

    /// Writes the current tree to `config.yaml`.
    pub fn save(&self) -> Result<()> {
        let yaml = serde_yaml::to_string(&*self.tree())?;
        fs::write(&self.file, yaml)
            .with_context(|| format!("cannot write {}", self.file.display()))
    }

    /// Sets the value at `path` (e.g. `&["cast", "session", "suspend_timeout_secs"]`)
    /// and persists the configuration.
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        tree::insert(&mut self.tree(), path, value)?;
        self.save()
    }

    /// Returns a copy of the value at `path`; keys are case-insensitive.
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        tree::lookup(&self.tree(), path)
    }

    pub fn cast_settings(&self) -> Result<CastSettings> {
        match self.get_value(&["cast"]) {
            Ok(section) => serde_yaml::from_value(section).context("invalid `cast` section"),
            Err(_) => Ok(CastSettings::default()),
        }
    }

    u64_setting!(
        get_suspend_timeout_secs,
        set_suspend_timeout_secs,
        &["cast", "session", "suspend_timeout_secs"],
        DEFAULT_SUSPEND_TIMEOUT_SECS
    );

    u64_setting!(
        get_connect_timeout_secs,
        set_connect_timeout_secs,
        &["cast", "session", "connect_timeout_secs"],
        DEFAULT_CONNECT_TIMEOUT_SECS
    );

    bool_setting!(
        get_log_enable_console,
        set_log_enable_console,
        &["host", "logger", "enable_console"],
        DEFAULT_LOG_ENABLE_CONSOLE
    );

    /// Minimum log level, `TRACE` to `ERROR`.
    pub fn get_log_min_level(&self) -> Result<String> {
        Ok(match self.get_value(&["host", "logger", "min_level"]) {
            Ok(Value::String(level)) if !level.trim().is_empty() => level.trim().to_string(),
            _ => DEFAULT_LOG_MIN_LEVEL.to_string(),
        })
    }

    pub fn set_log_min_level(&self, level: &str) -> Result<()> {
        self.set_value(
            &["host", "logger", "min_level"],
            Value::String(level.to_string()),
        )
    }

    /// Identifier of this controller installation. Generated and persisted
    /// on first use.
    pub fn get_controller_id(&self) -> Result<String> {
        let path = &["cast", "controller", "id"];
        if let Ok(Value::String(id)) = self.get_value(path) {
            if !id.trim().is_empty() {
                return Ok(id.trim().to_string());
            }
        }

        let id = Uuid::new_v4().to_string();
        info!(controller_id = %id, "Generated controller id");
        self.set_value(path, Value::String(id.clone()))?;
        Ok(id)
    }
}

/// Process-wide configuration, loaded from the default location on first use.
pub fn get_config() -> Arc<Config> {
    Arc::clone(&CONFIG)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_in(dir: &tempfile::TempDir) -> Config {
        Config::load_config(dir.path().to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_defaults_are_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_in(&dir);

        assert_eq!(config.get_suspend_timeout_secs().unwrap(), 30);
        assert_eq!(config.get_connect_timeout_secs().unwrap(), 15);
        assert_eq!(config.get_log_min_level().unwrap(), "INFO");
        assert!(config.get_log_enable_console().unwrap());
        assert_eq!(config.directory(), dir.path());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "cast:\n  session:\n    Suspend_Timeout_Secs: 5\n",
        )
        .unwrap();

        let config = load_in(&dir);
        assert_eq!(config.get_suspend_timeout_secs().unwrap(), 5);
        assert_eq!(config.get_connect_timeout_secs().unwrap(), 15);

        let settings = config.cast_settings().unwrap();
        assert_eq!(settings.session.suspend_timeout_secs, 5);
        assert_eq!(settings.share.accepted_mime, "text/plain");
    }

    #[test]
    fn test_env_override() {
        let dir = tempfile::tempdir().unwrap();
        env::set_var("FLUXO_CONFIG__TESTING__ENV_MARKER", "42");
        let config = load_in(&dir);
        env::remove_var("FLUXO_CONFIG__TESTING__ENV_MARKER");

        assert_eq!(
            config.get_value(&["testing", "env_marker"]).unwrap(),
            Value::Number(Number::from(42))
        );
    }

    #[test]
    fn test_string_integer_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_in(&dir);
        config
            .set_value(
                &["cast", "session", "connect_timeout_secs"],
                Value::String("soon".to_string()),
            )
            .unwrap();
        assert_eq!(config.get_connect_timeout_secs().unwrap(), 15);

        config
            .set_value(
                &["cast", "session", "connect_timeout_secs"],
                Value::String(" 8 ".to_string()),
            )
            .unwrap();
        assert_eq!(config.get_connect_timeout_secs().unwrap(), 8);
    }

    #[test]
    fn test_setters_persist() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_in(&dir);
        config.set_suspend_timeout_secs(12).unwrap();
        config.set_log_min_level("DEBUG").unwrap();
        config.set_log_enable_console(false).unwrap();

        let reloaded = load_in(&dir);
        assert_eq!(reloaded.get_suspend_timeout_secs().unwrap(), 12);
        assert_eq!(reloaded.get_log_min_level().unwrap(), "DEBUG");
        assert!(!reloaded.get_log_enable_console().unwrap());
    }

    #[test]
    fn test_controller_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_in(&dir);
        let first = config.get_controller_id().unwrap();
        assert!(Uuid::parse_str(&first).is_ok());
        assert_eq!(config.get_controller_id().unwrap(), first);

        let reloaded = load_in(&dir);
        assert_eq!(reloaded.get_controller_id().unwrap(), first);
    }

    #[test]
    fn test_invalid_user_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "cast: [unclosed").unwrap();
        assert!(Config::load_config(dir.path().to_str().unwrap()).is_err());
    }
}
