use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use tether_bridge::BridgeSettings;
use tether_modules::ModuleSettings;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("could not determine the config directory")]
    NoConfigDir,
    #[error("failed to parse config {path}: {message}")]
    ParseError { path: PathBuf, message: String },
    #[error("IO error reading config {path}: {message}")]
    IoError { path: PathBuf, message: String },
}

/// Platform config/data directories for tether.
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "tether")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
    #[serde(default)]
    pub watch: WatchDefaults,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shell: ShellDefaults,
    #[serde(default)]
    pub mail: MailDefaults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads for the native runtime (default: 2)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Upper bound on how long closing a handle waits for its workers
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Stop the run loop at the first failing callback
    #[serde(default)]
    pub strict_callbacks: bool,
}

fn default_worker_threads() -> usize {
    2
}

fn default_close_timeout() -> u64 {
    2000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            close_timeout_ms: default_close_timeout(),
            strict_callbacks: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Modules scripts may `require`
    #[serde(default = "default_enabled_modules")]
    pub enabled: Vec<String>,
}

fn default_enabled_modules() -> Vec<String> {
    tether_modules::MODULES
        .iter()
        .map(|(name, _)| name.to_string())
        .collect()
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_modules(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchDefaults {
    #[serde(default = "default_watch_interval")]
    pub default_interval_ms: u64,
}

fn default_watch_interval() -> u64 {
    250
}

impl Default for WatchDefaults {
    fn default() -> Self {
        Self {
            default_interval_ms: default_watch_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to `<data_dir>/logs/<component>.log`
    #[serde(default)]
    pub file: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellDefaults {
    #[serde(default = "default_transport")]
    pub default_transport: String,
}

fn default_transport() -> String {
    "local".to_string()
}

impl Default for ShellDefaults {
    fn default() -> Self {
        Self {
            default_transport: default_transport(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailDefaults {
    #[serde(default = "default_mail_timeout")]
    pub timeout_ms: u64,
}

fn default_mail_timeout() -> u64 {
    10_000
}

impl Default for MailDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_mail_timeout(),
        }
    }
}

impl HostConfig {
    pub fn config_path() -> Result<PathBuf, ConfigLoadError> {
        project_dirs()
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigLoadError::NoConfigDir)
    }

    /// Load `path`, or the default config file when `path` is `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigLoadError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigLoadError::IoError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config = toml::from_str(&content).map_err(|e| ConfigLoadError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        info!(target: "host", "Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(&self)?;
        fs::write(path, content)?;
        info!(target: "host", "Saved config to {}", path.display());
        Ok(())
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            close_timeout: Duration::from_millis(self.runtime.close_timeout_ms),
        }
    }

    pub fn module_settings(&self) -> ModuleSettings {
        ModuleSettings {
            watch_interval: Duration::from_millis(self.watch.default_interval_ms),
            default_transport: self.shell.default_transport.clone(),
            mail_timeout: Duration::from_millis(self.mail.timeout_ms),
        }
    }
}

/// Commented starting point written by `tether init-config`.
pub const EXAMPLE_CONFIG: &str = r#"# tether configuration

[runtime]
worker_threads = 2
# How long close() waits for a handle's background workers
close_timeout_ms = 2000
# Stop at the first callback that raises instead of logging and continuing
strict_callbacks = false

[modules]
enabled = ["fswatch", "process", "shell", "mail", "log"]

[watch]
default_interval_ms = 250

[logging]
# Also log to <data dir>/logs/tether.log
file = false

[shell]
default_transport = "local"

[mail]
timeout_ms = 10000
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.runtime.worker_threads, 2);
        assert_eq!(config.runtime.close_timeout_ms, 2000);
        assert!(!config.runtime.strict_callbacks);
        assert_eq!(
            config.modules.enabled,
            vec!["fswatch", "process", "shell", "mail", "log"]
        );
        assert_eq!(config.watch.default_interval_ms, 250);
        assert!(!config.logging.file);
        assert_eq!(config.shell.default_transport, "local");
        assert_eq!(config.mail.timeout_ms, 10_000);
    }

    #[test]
    fn test_example_matches_defaults() {
        let parsed: HostConfig = toml::from_str(EXAMPLE_CONFIG).unwrap();
        assert_eq!(parsed, HostConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let parsed: HostConfig = toml::from_str(
            r#"
            [runtime]
            strict_callbacks = true

            [modules]
            enabled = ["log"]
            "#,
        )
        .unwrap();
        assert!(parsed.runtime.strict_callbacks);
        assert_eq!(parsed.runtime.worker_threads, 2);
        assert_eq!(parsed.modules.enabled, vec!["log"]);
        assert_eq!(parsed.mail, MailDefaults::default());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn test_parse_error_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[runtime]\nworker_threads = \"many\"\n").unwrap();

        let err = HostConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigLoadError::ParseError { .. }));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = HostConfig::default();
        config.watch.default_interval_ms = 40;

        config.save_to(&path).unwrap();
        assert_eq!(HostConfig::load_from(&path).unwrap(), config);
        assert_eq!(
            config.module_settings().watch_interval,
            Duration::from_millis(40)
        );
    }
}
