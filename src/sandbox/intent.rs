use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::error::SandboxError;
use super::rule::MountKind;

/// Access requested for a host path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn bind_kind(self) -> MountKind {
        match self {
            AccessMode::ReadOnly => MountKind::BindReadOnly,
            AccessMode::ReadWrite => MountKind::BindReadWrite,
        }
    }
}

impl FromStr for AccessMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ro" => Ok(AccessMode::ReadOnly),
            "rw" => Ok(AccessMode::ReadWrite),
            other => Err(SandboxError::InvalidArgument(format!(
                "access mode {other:?} is neither \"ro\" nor \"rw\""
            ))),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadOnly => f.write_str("ro"),
            AccessMode::ReadWrite => f.write_str("rw"),
        }
    }
}

/// Split `PATH:MODE` at the last colon, so paths may contain colons.
fn split_path_access(candidate: &str) -> Result<(PathBuf, AccessMode), SandboxError> {
    let invalid = || {
        SandboxError::InvalidArgument(format!(
            "value {candidate:?} does not match pattern \"PATH:{{ro,rw}}\""
        ))
    };
    let (path, access) = candidate.rsplit_once(':').ok_or_else(invalid)?;
    if path.is_empty() {
        return Err(invalid());
    }
    let access = access.parse().map_err(|_| invalid())?;
    let expanded = shellexpand::tilde(path);
    Ok((PathBuf::from(expanded.as_ref()), access))
}

/// A host path exposed at the same path inside the sandbox (`--pass`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassThrough {
    pub path: PathBuf,
    pub access: AccessMode,
}

impl FromStr for PassThrough {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, access) = split_path_access(s)?;
        Ok(Self { path, access })
    }
}

/// Host directory used as the Wine prefix instead of a throwaway tmpfs
/// (`--dotwine`). The access suffix is optional and defaults to `rw`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePrefix {
    pub path: PathBuf,
    pub access: AccessMode,
    /// Does not exist yet and will be created before launch.
    #[serde(default)]
    pub fresh: bool,
}

impl FromStr for RuntimePrefix {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.ends_with(":ro") || s.ends_with(":rw") {
            let (path, access) = split_path_access(s)?;
            return Ok(Self {
                path,
                access,
                fresh: false,
            });
        }
        if s.is_empty() {
            return Err(SandboxError::InvalidArgument(
                "runtime prefix path is empty".to_string(),
            ));
        }
        Ok(Self {
            path: PathBuf::from(shellexpand::tilde(s).as_ref()),
            access: AccessMode::ReadWrite,
            fresh: false,
        })
    }
}

/// Interchangeable nested display servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NestedEngine {
    Nxagent,
    Xephyr,
    Xnest,
    Xpra,
    Xvfb,
}

impl NestedEngine {
    /// Engines tried by `--x11`, in order. Xvfb and xpra are left out because
    /// auto mode is meant to give the user visible windows with no extra setup.
    pub const AUTO_ORDER: [NestedEngine; 3] =
        [NestedEngine::Nxagent, NestedEngine::Xephyr, NestedEngine::Xnest];

    pub const ALL: [NestedEngine; 5] = [
        NestedEngine::Nxagent,
        NestedEngine::Xephyr,
        NestedEngine::Xnest,
        NestedEngine::Xpra,
        NestedEngine::Xvfb,
    ];

    /// Executable name of the engine.
    pub fn command(self) -> &'static str {
        match self {
            NestedEngine::Nxagent => "nxagent",
            NestedEngine::Xephyr => "Xephyr",
            NestedEngine::Xnest => "Xnest",
            NestedEngine::Xpra => "xpra",
            NestedEngine::Xvfb => "Xvfb",
        }
    }

    /// Pick the first auto-mode engine that `is_available` accepts.
    pub fn detect(is_available: impl Fn(&str) -> bool) -> Result<Self, SandboxError> {
        Self::AUTO_ORDER
            .into_iter()
            .find(|engine| is_available(engine.command()))
            .ok_or_else(|| {
                let names: Vec<&str> = Self::AUTO_ORDER.iter().map(|e| e.command()).collect();
                SandboxError::AuxiliaryServiceStart(format!(
                    "neither {} is available, please install one",
                    names.join(" nor ")
                ))
            })
    }
}

impl fmt::Display for NestedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

/// How (and whether) the sandboxed program reaches an X11 display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum X11Mode {
    /// No display; GUI programs fail to connect.
    None,
    /// The host display itself. Least safe: the program can see and drive
    /// every other window on the host display.
    HostDirect,
    /// A private nested display server.
    Nested(NestedEngine),
}

/// One X11-related command-line flag, before conflict checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X11Request {
    Auto,
    Host,
    Engine(NestedEngine),
}

impl X11Mode {
    /// Resolve the X11 flags given on the command line into one mode.
    ///
    /// Repeating the same flag is fine; two different flags are a conflict.
    pub fn from_requests(
        requests: &[X11Request],
        is_available: impl Fn(&str) -> bool,
    ) -> Result<Self, SandboxError> {
        let mut chosen: Option<X11Request> = None;
        for &request in requests {
            match chosen {
                Some(previous) if previous != request => {
                    return Err(SandboxError::ConflictingMode(format!(
                        "X11 modes {} and {} are mutually exclusive",
                        describe(previous),
                        describe(request)
                    )));
                }
                _ => chosen = Some(request),
            }
        }
        match chosen {
            None => Ok(X11Mode::None),
            Some(X11Request::Host) => Ok(X11Mode::HostDirect),
            Some(X11Request::Engine(engine)) => Ok(X11Mode::Nested(engine)),
            Some(X11Request::Auto) => NestedEngine::detect(is_available).map(X11Mode::Nested),
        }
    }

    pub fn is_enabled(self) -> bool {
        self != X11Mode::None
    }
}

fn describe(request: X11Request) -> String {
    match request {
        X11Request::Auto => "--x11".to_string(),
        X11Request::Host => "--host-x11-danger-danger".to_string(),
        X11Request::Engine(engine) => format!("--{}", engine.command().to_lowercase()),
    }
}

/// Resolved user choices for one invocation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub network: bool,
    pub x11: X11Mode,
    pub audio: bool,
    pub passes: Vec<PassThrough>,
    pub runtime_prefix: Option<RuntimePrefix>,
    /// Restart the program while it dies from a signal.
    pub retry: bool,
    pub pty: bool,
    /// Run the program through `wine`.
    pub with_wine: bool,
    /// Run `winecfg` before the program.
    pub configure: bool,
    /// Program and arguments; empty runs `true`.
    pub program: Vec<String>,
}

impl Default for Intent {
    fn default() -> Self {
        Self {
            network: false,
            x11: X11Mode::None,
            audio: false,
            passes: Vec::new(),
            runtime_prefix: None,
            retry: false,
            pty: true,
            with_wine: true,
            configure: false,
            program: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pass_through() {
        let pass: PassThrough = "/mnt:ro".parse().unwrap();
        assert_eq!(pass.path, PathBuf::from("/mnt"));
        assert_eq!(pass.access, AccessMode::ReadOnly);

        let pass: PassThrough = "/srv/a:b:rw".parse().unwrap();
        assert_eq!(pass.path, PathBuf::from("/srv/a:b"));
        assert_eq!(pass.access, AccessMode::ReadWrite);
    }

    #[test]
    fn test_parse_pass_through_rejects_bad_values() {
        for bad in ["/mnt", "/mnt:", "/mnt:rx", ":ro", ""] {
            assert!(
                matches!(bad.parse::<PassThrough>(), Err(SandboxError::InvalidArgument(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_pass_through_expands_tilde() {
        let pass: PassThrough = "~/Games:rw".parse().unwrap();
        assert!(!pass.path.starts_with("~"));
        assert!(pass.path.ends_with("Games"));
    }

    #[test]
    fn test_runtime_prefix_defaults_to_read_write() {
        let prefix: RuntimePrefix = "/srv/wine".parse().unwrap();
        assert_eq!(prefix.access, AccessMode::ReadWrite);

        let prefix: RuntimePrefix = "/srv/wine:ro".parse().unwrap();
        assert_eq!(prefix.path, PathBuf::from("/srv/wine"));
        assert_eq!(prefix.access, AccessMode::ReadOnly);
    }

    #[test]
    fn test_x11_mode_defaults_to_none() {
        assert_eq!(X11Mode::from_requests(&[], |_| true).unwrap(), X11Mode::None);
    }

    #[test]
    fn test_x11_conflicting_requests() {
        let err = X11Mode::from_requests(
            &[X11Request::Engine(NestedEngine::Xephyr), X11Request::Host],
            |_| true,
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::ConflictingMode(_)));
        assert!(err.to_string().contains("--xephyr"));
    }

    #[test]
    fn test_x11_repeated_request_is_fine() {
        let mode = X11Mode::from_requests(&[X11Request::Host, X11Request::Host], |_| false)
            .unwrap();
        assert_eq!(mode, X11Mode::HostDirect);
    }

    #[test]
    fn test_x11_auto_detection_order() {
        let mode = X11Mode::from_requests(&[X11Request::Auto], |cmd| cmd != "nxagent").unwrap();
        assert_eq!(mode, X11Mode::Nested(NestedEngine::Xephyr));
    }

    #[test]
    fn test_x11_auto_detection_never_picks_xvfb() {
        let err = X11Mode::from_requests(&[X11Request::Auto], |cmd| cmd == "Xvfb").unwrap_err();
        assert!(matches!(err, SandboxError::AuxiliaryServiceStart(_)));
        assert!(err.to_string().contains("nxagent nor Xephyr nor Xnest"));
    }
}
