//! Where winecage keeps its files.
//!
//! Lookup order for each directory, first hit wins:
//! 1. `WINECAGE_CONFIG_DIR` / `WINECAGE_RUNTIME_DIR`
//! 2. the XDG base directories (via `etcetera`)
//! 3. `~/.config/winecage` and `$TMPDIR/winecage-<uid>`
//!
//! Values that are empty or not absolute are skipped, as XDG requires.

use anyhow::{Context, Result};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "winecage";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone)]
pub struct Paths {
    /// Holds `config.toml`.
    pub config_dir: PathBuf,

    /// Private scratch space for display servers (xpra sockets and sessions).
    pub runtime_dir: PathBuf,
}

impl Paths {
    pub fn resolve() -> Result<Self> {
        Self::resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve against an arbitrary variable lookup.
    pub fn resolve_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        use etcetera::BaseStrategy;

        let base = etcetera::choose_base_strategy()
            .context("Failed to determine base directories")?;

        let config_dir = absolute_var(&lookup, "WINECAGE_CONFIG_DIR")
            .unwrap_or_else(|| base.config_dir().join(APP_DIR));
        let runtime_dir = absolute_var(&lookup, "WINECAGE_RUNTIME_DIR")
            .or_else(|| absolute_var(&lookup, "XDG_RUNTIME_DIR").map(|d| d.join(APP_DIR)))
            .unwrap_or_else(|| {
                let tmp = lookup("TMPDIR")
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "/tmp".to_string());
                Path::new(&tmp).join(format!("{APP_DIR}-{}", nix::unistd::getuid()))
            });

        Ok(Self {
            config_dir,
            runtime_dir,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Create the runtime directory, readable only by us.
    pub fn ensure_runtime_dir(&self) -> Result<&Path> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.runtime_dir)
            .with_context(|| format!("Failed to create {}", self.runtime_dir.display()))?;
        // An existing directory keeps its mode under DirBuilder.
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&self.runtime_dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to restrict {}", self.runtime_dir.display()))?;
        Ok(&self.runtime_dir)
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("/"));
            Self {
                config_dir: home.join(".config").join(APP_DIR),
                runtime_dir: std::env::temp_dir().join(APP_DIR),
            }
        })
    }
}

/// Variable `name` as an absolute path, after tilde expansion.
fn absolute_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<PathBuf> {
    let value = lookup(name).filter(|v| !v.is_empty())?;
    let path = PathBuf::from(shellexpand::tilde(&value).as_ref());
    path.is_absolute().then_some(path)
}
