//! Turns a [`SandboxPlan`] into a bubblewrap invocation.

use std::borrow::Cow;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

use super::error::SandboxError;
use super::policy::SandboxPlan;
use super::rule::{MountKind, MountRule};

/// Backend looked up in `PATH` unless configured otherwise.
pub const DEFAULT_BACKEND: &str = "bwrap";

/// Resolve the backend binary, either an explicit path or a name in `PATH`.
pub fn locate_backend(backend: &str) -> Result<PathBuf, SandboxError> {
    let unavailable = |reason: String| {
        SandboxError::BackendUnavailable(format!("command {backend:?} is not available: {reason}"))
    };
    if backend.contains('/') {
        let path = PathBuf::from(shellexpand::tilde(backend).as_ref());
        return match which::which(&path) {
            Ok(found) => Ok(found),
            Err(e) => Err(unavailable(e.to_string())),
        };
    }
    which::which(backend).map_err(|e| unavailable(e.to_string()))
}

/// Stdio wiring for the sandboxed child.
#[derive(Debug)]
pub enum ChildStdio {
    /// Share the supervisor's stdin, stdout and stderr.
    Inherit,
    /// Use the given pseudo-terminal slave for all three.
    Terminal(std::fs::File),
}

fn push_rule(args: &mut Vec<String>, rule: &MountRule) {
    let target = rule.target.to_string_lossy().into_owned();
    let source = rule
        .source_path()
        .map(|s| s.to_string_lossy().into_owned());
    let (flag, source) = match rule.kind {
        MountKind::FreshEmptyDir => ("--tmpfs", None),
        MountKind::FreshDeviceDir => ("--dev", None),
        MountKind::FreshProcDir => ("--proc", None),
        MountKind::BindReadOnly => ("--ro-bind", source),
        MountKind::BindReadWrite if rule.device_access => ("--dev-bind", source),
        MountKind::BindReadWrite => ("--bind", source),
    };
    args.push(flag.to_string());
    args.extend(source);
    args.push(target);
}

/// One call of the sandbox backend for a compiled plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInvocation {
    backend: PathBuf,
    /// Groups of arguments, one per line when announced.
    groups: Vec<Vec<String>>,
}

impl BackendInvocation {
    pub fn new(backend: impl Into<PathBuf>, plan: &SandboxPlan) -> Self {
        let mut groups: Vec<Vec<String>> = Vec::new();
        let mut isolation = vec![
            "--new-session".to_string(),
            "--die-with-parent".to_string(),
            "--unshare-all".to_string(),
        ];
        if plan.share_network {
            isolation.push("--share-net".to_string());
        }
        groups.push(isolation);

        for rule in &plan.rules {
            let mut group = Vec::with_capacity(3);
            push_rule(&mut group, rule);
            groups.push(group);
        }

        groups.push(vec!["--clearenv".to_string()]);
        for (name, value) in &plan.env {
            groups.push(vec!["--setenv".to_string(), name.clone(), value.clone()]);
        }
        groups.push(vec!["--".to_string()]);
        groups.push(plan.command.clone());

        Self {
            backend: backend.into(),
            groups,
        }
    }

    pub fn backend(&self) -> &Path {
        &self.backend
    }

    /// Arguments passed to the backend, without the backend itself.
    pub fn args(&self) -> Vec<String> {
        self.groups.iter().flatten().cloned().collect()
    }

    /// Shell-quoted rendering, one argument group per line, for the user to
    /// see what is about to run.
    pub fn announce(&self) -> String {
        let quote = |s: &str| shell_escape::escape(Cow::Borrowed(s)).into_owned();
        let mut lines = vec![format!("# {}", quote(&self.backend.to_string_lossy()))];
        for group in &self.groups {
            let line: Vec<String> = group.iter().map(|a| quote(a)).collect();
            lines.push(format!("#   {}", line.join(" ")));
        }
        lines.join(" \\\n")
    }

    /// Start the backend without waiting for it.
    ///
    /// The child always leads its own process group so forwarded signals
    /// reach the whole sandbox. With a terminal the child also becomes a
    /// session leader with the terminal as its controlling tty.
    pub fn spawn(&self, stdio: ChildStdio) -> Result<Child, SandboxError> {
        let mut command = Command::new(&self.backend);
        command.args(self.args()).kill_on_drop(true);

        match stdio {
            ChildStdio::Inherit => {
                command.process_group(0);
            }
            ChildStdio::Terminal(slave) => {
                command
                    .stdin(Stdio::from(slave.try_clone()?))
                    .stdout(Stdio::from(slave.try_clone()?))
                    .stderr(Stdio::from(slave));
                // SAFETY: only async-signal-safe calls between fork and exec.
                unsafe {
                    command.pre_exec(|| {
                        nix::unistd::setsid().map_err(io::Error::from)?;
                        if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                            return Err(io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
            }
        }

        command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                SandboxError::BackendUnavailable(format!(
                    "command {:?} is not available: {}",
                    self.backend.display().to_string(),
                    e
                ))
            }
            _ => SandboxError::Io(e),
        })
    }
}
