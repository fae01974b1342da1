//! Long-running helper processes owned by the supervisor.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::sandbox::error::SandboxError;

/// A spawned helper with a polite stop signal and a hard kill fallback.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    child: Child,
    stop_signal: Signal,
    exited: bool,
}

impl ManagedProcess {
    /// Spawn `argv` with stdin closed. Variables in `env_remove` are not
    /// inherited.
    pub fn spawn(
        argv: &[String],
        stop_signal: Signal,
        env_remove: &[&str],
    ) -> Result<Self, SandboxError> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            SandboxError::AuxiliaryServiceStart("empty helper command".to_string())
        })?;
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        for name in env_remove {
            command.env_remove(name);
        }

        debug!("Starting helper: {}", argv.join(" "));
        let child = command.spawn().map_err(|e| {
            SandboxError::AuxiliaryServiceStart(format!("failed to start {program}: {e}"))
        })?;
        Ok(Self {
            name: program.clone(),
            child,
            stop_signal,
            exited: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Reap the process without blocking; true once it has exited.
    pub fn has_exited(&mut self) -> bool {
        if self.exited {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Helper {} exited with {}", self.name, status);
                self.exited = true;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to poll helper {}: {}", self.name, e);
                self.exited = true;
            }
        }
        self.exited
    }

    /// Ask the process to stop, then kill it if it outlives `grace`.
    pub async fn shutdown(&mut self, grace: Duration) {
        if self.has_exited() {
            return;
        }
        if let Some(pid) = self.child.id() {
            debug!("Sending {} to helper {} ({})", self.stop_signal, self.name, pid);
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), self.stop_signal) {
                debug!("Could not signal helper {}: {}", self.name, e);
            }
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Helper {} stopped with {}", self.name, status),
            Ok(Err(e)) => warn!("Failed to wait for helper {}: {}", self.name, e),
            Err(_) => {
                warn!(
                    "Helper {} ignored {} for {:?}, killing it",
                    self.name, self.stop_signal, grace
                );
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill helper {}: {}", self.name, e);
                }
            }
        }
        self.exited = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_missing_helper_fails_to_start() {
        let err = ManagedProcess::spawn(
            &argv(&["winecage-no-such-helper"]),
            Signal::SIGINT,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::AuxiliaryServiceStart(_)));
    }

    #[tokio::test]
    async fn test_shutdown_with_stop_signal() {
        let mut process = ManagedProcess::spawn(&argv(&["sleep", "30"]), Signal::SIGINT, &[]).unwrap();
        assert!(!process.has_exited());
        process.shutdown(Duration::from_secs(5)).await;
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_shutdown_kills_after_grace() {
        let mut process = ManagedProcess::spawn(
            &argv(&["sh", "-c", "trap '' INT; sleep 30"]),
            Signal::SIGINT,
            &[],
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        process.shutdown(Duration::from_millis(300)).await;
        assert!(process.has_exited());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_exited_helper_is_reaped() {
        let mut process = ManagedProcess::spawn(&argv(&["true"]), Signal::SIGINT, &[]).unwrap();
        for _ in 0..50 {
            if process.has_exited() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(process.has_exited());
        // Shutting down an exited helper is a no-op.
        process.shutdown(Duration::from_millis(10)).await;
    }
}
