//! Read-only view of the host that the policy compiler depends on.
//!
//! Keeping every host lookup behind [`HostFacts`] makes compilation a pure
//! function of the intent and these facts.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Directory holding the X11 unix sockets (`X0`, `X1`, ...).
pub const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

#[cfg_attr(test, mockall::automock)]
pub trait HostFacts {
    /// Canonical home directory of the invoking user.
    fn home_dir(&self) -> PathBuf;

    fn uid(&self) -> u32;

    fn env_var(&self, name: &str) -> Option<String>;

    fn exists(&self, path: &Path) -> bool;

    /// Resolve symlinks; returns the path unchanged when it cannot be resolved.
    fn canonicalize(&self, path: &Path) -> PathBuf;

    /// Display numbers that already have a socket in [`X11_SOCKET_DIR`].
    fn used_displays(&self) -> BTreeSet<u32>;
}

/// [`HostFacts`] backed by the live system.
#[derive(Debug, Clone)]
pub struct LiveHost {
    home: PathBuf,
    uid: u32,
}

impl LiveHost {
    pub fn new() -> Self {
        let home = directories::BaseDirs::new()
            .map(|b| b.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/"));
        let home = std::fs::canonicalize(&home).unwrap_or(home);
        Self {
            home,
            uid: nix::unistd::getuid().as_raw(),
        }
    }
}

impl Default for LiveHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostFacts for LiveHost {
    fn home_dir(&self) -> PathBuf {
        self.home.clone()
    }

    fn uid(&self) -> u32 {
        self.uid
    }

    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn canonicalize(&self, path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    fn used_displays(&self) -> BTreeSet<u32> {
        let pattern = format!("{X11_SOCKET_DIR}/X*");
        let Ok(entries) = glob::glob(&pattern) else {
            return BTreeSet::new();
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|p| display_from_socket(&p))
            .collect()
    }
}

/// Parse the display number out of `/tmp/.X11-unix/X<n>`.
pub fn display_from_socket(path: &Path) -> Option<u32> {
    path.file_name()?.to_str()?.strip_prefix('X')?.parse().ok()
}

/// Socket path for display `:<display>`.
pub fn x11_socket(display: u32) -> PathBuf {
    Path::new(X11_SOCKET_DIR).join(format!("X{display}"))
}
