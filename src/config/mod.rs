use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::Paths;
use crate::sandbox::DEFAULT_BACKEND;
use crate::sandbox::services::X11Settings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    /// File this config was read from (not serialized)
    #[serde(skip)]
    pub source: Option<PathBuf>,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub x11: X11Config,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Backend binary: a name looked up in PATH, or a path
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Retry programs that die from a signal (default: false)
    #[serde(default)]
    pub retry: bool,

    /// Run programs on a pseudo-terminal (default: true)
    #[serde(default = "default_true")]
    pub pty: bool,

    /// Seconds a helper process gets to stop before it is killed
    #[serde(default = "default_teardown_grace")]
    pub teardown_grace_secs: u64,

    /// Host variables copied in addition to HOME, TERM, USER and WINEDEBUG
    #[serde(default)]
    pub env_allow: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X11Config {
    /// Nested display width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Nested display height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Lowest display number for nested displays
    #[serde(default)]
    pub min_display: u32,

    /// Seconds to wait for a nested display to accept connections
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_string()
}
fn default_true() -> bool {
    true
}
fn default_teardown_grace() -> u64 {
    5
}
fn default_width() -> u32 {
    1024
}
fn default_height() -> u32 {
    768
}
fn default_ready_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            retry: false,
            pty: default_true(),
            teardown_grace_secs: default_teardown_grace(),
            env_allow: Vec::new(),
        }
    }
}

impl Default for X11Config {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            min_display: 0,
            ready_timeout_secs: default_ready_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from the default location, or from `override_path` when given.
    ///
    /// A missing file yields the defaults; nothing is written.
    pub fn load(override_path: Option<&str>) -> Result<Self> {
        let paths = Paths::resolve()?;
        let path = match override_path {
            Some(path) => PathBuf::from(shellexpand::tilde(path).as_ref()),
            None => paths.config_file(),
        };
        let mut config = Self::load_from(&path)?;
        config.paths = paths;
        Ok(config)
    }

    /// Parse the file at `path`; defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Write to the file this config came from, or the default location.
    pub fn save(&self) -> Result<()> {
        let path = self.file_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    pub fn file_path(&self) -> PathBuf {
        self.source
            .clone()
            .unwrap_or_else(|| self.paths.config_file())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["sandbox", "backend"] => Ok(self.sandbox.backend.clone()),
            ["sandbox", "retry"] => Ok(self.sandbox.retry.to_string()),
            ["sandbox", "pty"] => Ok(self.sandbox.pty.to_string()),
            ["sandbox", "teardown_grace_secs"] => Ok(self.sandbox.teardown_grace_secs.to_string()),
            ["sandbox", "env_allow"] => Ok(self.sandbox.env_allow.join(",")),
            ["x11", "width"] => Ok(self.x11.width.to_string()),
            ["x11", "height"] => Ok(self.x11.height.to_string()),
            ["x11", "min_display"] => Ok(self.x11.min_display.to_string()),
            ["x11", "ready_timeout_secs"] => Ok(self.x11.ready_timeout_secs.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["sandbox", "backend"] => self.sandbox.backend = value.to_string(),
            ["sandbox", "retry"] => self.sandbox.retry = value.parse()?,
            ["sandbox", "pty"] => self.sandbox.pty = value.parse()?,
            ["sandbox", "teardown_grace_secs"] => self.sandbox.teardown_grace_secs = value.parse()?,
            ["sandbox", "env_allow"] => {
                self.sandbox.env_allow = value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(String::from)
                    .collect()
            }
            ["x11", "width"] => self.x11.width = value.parse()?,
            ["x11", "height"] => self.x11.height = value.parse()?,
            ["x11", "min_display"] => self.x11.min_display = value.parse()?,
            ["x11", "ready_timeout_secs"] => self.x11.ready_timeout_secs = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }

    /// Nested display settings derived from the `[x11]` section.
    pub fn x11_settings(&self) -> X11Settings {
        X11Settings {
            width: self.x11.width,
            height: self.x11.height,
            min_display: self.x11.min_display,
            ready_timeout: Duration::from_secs(self.x11.ready_timeout_secs),
            scratch_dir: Some(self.paths.runtime_dir.clone()),
            ..X11Settings::default()
        }
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_secs(self.sandbox.teardown_grace_secs)
    }
}

/// Default config template with helpful comments (written by `config init`)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# winecage configuration

[sandbox]
# Backend binary, looked up in PATH unless it contains a slash
backend = "bwrap"

# Start the program again whenever it dies from a signal (same as --retry)
retry = false

# Give the program a pseudo-terminal (disable with --no-pty)
pty = true

# Seconds a display server gets to stop before it is killed
teardown_grace_secs = 5

# Extra host variables to copy into the sandbox.
# HOME, TERM, USER and WINEDEBUG are always copied when set.
# env_allow = ["LANG", "LC_ALL"]

[x11]
# Screen size of nested displays (Xephyr, Xnest, Xvfb)
width = 1024
height = 768

# Lowest display number handed to a nested display
# min_display = 0

# Seconds to wait for a nested display to come up
ready_timeout_secs = 10

[logging]
# trace | debug | info | warn | error (RUST_LOG and --verbose take precedence)
level = "info"
"#;
