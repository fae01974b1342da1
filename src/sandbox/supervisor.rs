//! Runs a compiled sandbox to completion.
//!
//! Each attempt: bring auxiliary services up, spawn the backend (optionally
//! on a pty), relay terminal traffic and forward signals until the backend
//! exits, then classify the exit. A signal death is retried when retry is on
//! and the user did not ask us to stop.

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use super::error::SandboxError;
use super::invoker::{BackendInvocation, ChildStdio};
use super::pty::{self, PtySession};
use super::services::AuxiliaryServices;
use super::status;

/// Outcome of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Exit code to hand to our caller.
    pub exit_code: i32,
    /// Number of times the backend was started.
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Terminal(i32),
    Retry { signal: i32 },
}

/// Decide what an attempt's exit status means.
///
/// bwrap exits with `128 + N` when the sandboxed process was killed by
/// signal `N`, so those codes count as signal deaths too.
fn classify(status: ExitStatus, forwarded: Option<Signal>, retry: bool) -> Verdict {
    let (code, signal) = match status.signal() {
        Some(signal) => (status::from_signal(signal), Some(signal)),
        None => {
            let code = status.code().unwrap_or(status::GENERAL_FAILURE);
            (code, status::signal_from_code(code))
        }
    };
    match signal {
        Some(signal) if retry && forwarded.is_none() => Verdict::Retry { signal },
        _ => Verdict::Terminal(code),
    }
}

enum SignalEvent {
    Forward(Signal),
    WindowChange,
}

/// Signals the supervisor listens for while it runs.
struct SignalListener {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    window_change: tokio::signal::unix::Signal,
}

impl SignalListener {
    fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            window_change: signal(SignalKind::window_change())?,
        })
    }

    async fn recv(&mut self) -> SignalEvent {
        tokio::select! {
            Some(()) = self.interrupt.recv() => SignalEvent::Forward(Signal::SIGINT),
            Some(()) = self.terminate.recv() => SignalEvent::Forward(Signal::SIGTERM),
            Some(()) = self.hangup.recv() => SignalEvent::Forward(Signal::SIGHUP),
            Some(()) = self.window_change.recv() => SignalEvent::WindowChange,
            else => std::future::pending().await,
        }
    }

    /// Wait for the next signal that asks us to stop.
    async fn stop_request(&mut self) -> Signal {
        loop {
            if let SignalEvent::Forward(signal) = self.recv().await {
                return signal;
            }
        }
    }
}

struct Attempt {
    status: ExitStatus,
    forwarded: Option<Signal>,
}

/// Drives one sandboxed program through its attempts.
pub struct Supervisor {
    invocation: BackendInvocation,
    services: AuxiliaryServices,
    retry: bool,
    pty: bool,
}

impl Supervisor {
    pub fn new(
        invocation: BackendInvocation,
        services: AuxiliaryServices,
        retry: bool,
        pty: bool,
    ) -> Self {
        Self {
            invocation,
            services,
            retry,
            pty,
        }
    }

    /// Run until a terminal outcome. Auxiliary services are shut down on
    /// every path out of here.
    pub async fn run(mut self) -> Result<RunReport, SandboxError> {
        let result = match SignalListener::install() {
            Ok(mut signals) => self.run_attempts(&mut signals).await,
            Err(e) => Err(SandboxError::Io(e)),
        };
        self.services.shutdown().await;
        result
    }

    async fn run_attempts(
        &mut self,
        signals: &mut SignalListener,
    ) -> Result<RunReport, SandboxError> {
        let mut attempts = 0;
        loop {
            attempts += 1;

            tokio::select! {
                ready = self.services.ensure_ready() => ready?,
                signal = signals.stop_request() => {
                    info!("Received {} while starting services, stopping", signal);
                    return Ok(RunReport {
                        exit_code: status::from_signal(signal as i32),
                        attempts,
                    });
                }
            }

            let attempt = self.attempt(signals).await?;
            match classify(attempt.status, attempt.forwarded, self.retry) {
                Verdict::Terminal(exit_code) => {
                    debug!("Attempt {} finished with exit code {}", attempts, exit_code);
                    return Ok(RunReport {
                        exit_code,
                        attempts,
                    });
                }
                Verdict::Retry { signal } => {
                    warn!(
                        "Attempt {} was killed by signal {}, trying again",
                        attempts, signal
                    );
                }
            }
        }
    }

    async fn attempt(&mut self, signals: &mut SignalListener) -> Result<Attempt, SandboxError> {
        let (mut child, session) = if self.pty {
            let pair = pty::open()?;
            let child = self.invocation.spawn(ChildStdio::Terminal(pair.slave))?;
            (child, Some(PtySession::start(pair.master)?))
        } else {
            (self.invocation.spawn(ChildStdio::Inherit)?, None)
        };
        // The child leads its own process group (and session, with a pty).
        let group = child.id().map(|id| Pid::from_raw(id as i32));

        let mut forwarded = None;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                event = signals.recv() => match event {
                    SignalEvent::WindowChange => {
                        if let Some(session) = &session {
                            session.sync_window_size();
                        }
                    }
                    SignalEvent::Forward(signal) => {
                        info!("Forwarding {} to the sandbox", signal);
                        forwarded = Some(signal);
                        if let Some(group) = group
                            && let Err(e) = killpg(group, signal)
                        {
                            debug!("Could not forward {}: {}", signal, e);
                        }
                    }
                },
            }
        };

        if let Some(session) = session {
            session.finish().await;
        }
        Ok(Attempt {
            status: status?,
            forwarded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::intent::NestedEngine;
    use crate::sandbox::intent::X11Mode;
    use crate::sandbox::policy::SandboxPlan;
    use crate::sandbox::services::{DisplayPlan, ServicePlan, X11Settings};
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use crate::sandbox::host::x11_socket;
    use std::path::{Path, PathBuf};
    use std::sync::{Mutex, MutexGuard};
    use std::time::Duration;

    /// Signal handlers are process-wide: runs must not see each other's
    /// signals.
    static SIGNALS: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        SIGNALS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn wait_for_file(path: &Path) -> String {
        for _ in 0..200 {
            if let Ok(contents) = std::fs::read_to_string(path)
                && contents.ends_with('\n')
            {
                return contents;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{} never appeared", path.display());
    }

    /// Running or not yet reaped.
    fn is_running(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let (_, rest) = stat.rsplit_once(')')?;
                rest.trim_start().chars().next()
            })
            .is_some_and(|state| state != 'Z')
    }

    /// Stands in for bwrap: skips its own options and runs the command.
    const FAKE_BACKEND: &str = r#"#!/bin/sh
while [ "$#" -gt 0 ]; do
    if [ "$1" = "--" ]; then
        shift
        exec "$@"
    fi
    shift
done
exit 0
"#;

    fn fake_backend(dir: &Path) -> PathBuf {
        let path = dir.join("fake-bwrap");
        std::fs::write(&path, FAKE_BACKEND).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn no_services() -> AuxiliaryServices {
        AuxiliaryServices::new(
            ServicePlan {
                display: None,
                audio_socket: None,
                x11: X11Settings::default(),
            },
            Duration::from_secs(1),
        )
    }

    fn supervisor(backend: &Path, script: &str, retry: bool, pty: bool) -> Supervisor {
        let plan = SandboxPlan {
            rules: Vec::new(),
            env: BTreeMap::new(),
            share_network: false,
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        };
        Supervisor::new(
            BackendInvocation::new(backend, &plan),
            no_services(),
            retry,
            pty,
        )
    }

    #[test]
    fn test_classify_plain_exit_codes() {
        for code in [0, 2, 4, 5, 42] {
            let status = ExitStatus::from_raw(code << 8);
            assert_eq!(classify(status, None, true), Verdict::Terminal(code));
        }
    }

    #[test]
    fn test_classify_signal_deaths() {
        let killed = ExitStatus::from_raw(9);
        assert_eq!(classify(killed, None, true), Verdict::Retry { signal: 9 });
        assert_eq!(classify(killed, None, false), Verdict::Terminal(137));

        let reported = ExitStatus::from_raw(139 << 8);
        assert_eq!(classify(reported, None, true), Verdict::Retry { signal: 11 });
    }

    #[test]
    fn test_classify_cancelled_run_is_not_retried() {
        let killed = ExitStatus::from_raw(2);
        assert_eq!(
            classify(killed, Some(Signal::SIGINT), true),
            Verdict::Terminal(130)
        );
    }

    #[tokio::test]
    async fn test_retry_until_clean_exit() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend(dir.path());
        let marker = dir.path().join("attempts");
        let script = format!(
            "echo attempt >> '{m}'; [ $(wc -l < '{m}') -ge 2 ] || kill -9 $$; exit 0",
            m = marker.display()
        );

        let report = supervisor(&backend, &script, true, false).run().await.unwrap();
        assert_eq!(report, RunReport { exit_code: 0, attempts: 2 });
        let lines = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_retry_on_reported_signal_code() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend(dir.path());
        let marker = dir.path().join("attempts");
        let script = format!(
            "echo attempt >> '{m}'; [ $(wc -l < '{m}') -ge 2 ] || exit 137; exit 7",
            m = marker.display()
        );

        let report = supervisor(&backend, &script, true, false).run().await.unwrap();
        assert_eq!(report, RunReport { exit_code: 7, attempts: 2 });
    }

    #[tokio::test]
    async fn test_signal_death_without_retry() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend(dir.path());

        let report = supervisor(&backend, "kill -9 $$", false, false)
            .run()
            .await
            .unwrap();
        assert_eq!(report, RunReport { exit_code: 137, attempts: 1 });
    }

    #[tokio::test]
    async fn test_exit_codes_pass_through() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend(dir.path());

        for code in [0, 2, 4, 5] {
            let script = format!("exit {code}");
            let report = supervisor(&backend, &script, true, false).run().await.unwrap();
            assert_eq!(report.exit_code, code);
            assert_eq!(report.attempts, 1);
        }
    }

    #[tokio::test]
    async fn test_exit_code_through_pty() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend(dir.path());

        let report = supervisor(&backend, "echo hello from the pty; exit 3", false, true)
            .run()
            .await
            .unwrap();
        assert_eq!(report.exit_code, 3);
    }

    #[tokio::test]
    async fn test_missing_backend() {
        let _serial = serial();
        let err = supervisor(Path::new("/nonexistent/bwrap"), "exit 0", false, false)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_service_failure_prevents_launch() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend(dir.path());
        let marker = dir.path().join("launched");
        let plan = SandboxPlan {
            rules: Vec::new(),
            env: BTreeMap::new(),
            share_network: false,
            command: vec!["touch".to_string(), marker.to_string_lossy().into_owned()],
        };
        let services = AuxiliaryServices::new(
            ServicePlan {
                display: None,
                audio_socket: Some(dir.path().join("pulse/native")),
                x11: X11Settings::default(),
            },
            Duration::from_secs(1),
        );

        let err = Supervisor::new(BackendInvocation::new(&backend, &plan), services, true, false)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::AuxiliaryServiceStart(_)));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_nested_display_with_failing_target() {
        let _serial = serial();
        if which::which("Xvfb").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend(dir.path());
        let settings = X11Settings {
            min_display: 4000,
            ..X11Settings::default()
        };
        let host = crate::sandbox::host::LiveHost::new();
        let display =
            DisplayPlan::new(X11Mode::Nested(NestedEngine::Xvfb), &host, &settings).unwrap();
        let services = AuxiliaryServices::new(
            ServicePlan {
                display: Some(display),
                audio_socket: None,
                x11: settings,
            },
            Duration::from_secs(2),
        );
        let plan = SandboxPlan {
            rules: Vec::new(),
            env: BTreeMap::new(),
            share_network: false,
            command: vec!["sh".to_string(), "-c".to_string(), "exit 5".to_string()],
        };

        let report = Supervisor::new(BackendInvocation::new(&backend, &plan), services, true, false)
            .run()
            .await
            .unwrap();
        assert_eq!(report.exit_code, status::DISPLAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_forwarded_signal_ends_run_without_retry() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend(dir.path());
        let started = dir.path().join("started");
        let script = format!("echo up > '{}'; sleep 30", started.display());

        let run = supervisor(&backend, &script, true, false).run();
        let stop = async {
            wait_for_file(&started).await;
            nix::sys::signal::raise(Signal::SIGTERM).unwrap();
        };
        let (report, ()) = tokio::time::timeout(Duration::from_secs(20), async {
            tokio::join!(run, stop)
        })
        .await
        .unwrap();
        assert_eq!(report.unwrap(), RunReport { exit_code: 143, attempts: 1 });
    }

    #[tokio::test]
    async fn test_signal_while_display_starts_cancels_launch() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend(dir.path());
        let launched = dir.path().join("launched");
        let pidfile = dir.path().join("engine.pid");
        let number = (4500..4600).find(|n| !x11_socket(*n).exists()).unwrap();

        let engine = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > '{}'; exec sleep 30", pidfile.display()),
        ];
        let services = AuxiliaryServices::new(
            ServicePlan {
                display: Some(DisplayPlan {
                    mode: X11Mode::Nested(NestedEngine::Xvfb),
                    display: number,
                    display_env: format!(":{number}"),
                    xauthority: None,
                }),
                audio_socket: None,
                x11: X11Settings {
                    ready_timeout: Duration::from_secs(30),
                    poll_interval: Duration::from_millis(50),
                    ..X11Settings::default()
                },
            },
            Duration::from_secs(1),
        )
        .with_engine_command(engine);
        let plan = SandboxPlan {
            rules: Vec::new(),
            env: BTreeMap::new(),
            share_network: false,
            command: vec!["touch".to_string(), launched.to_string_lossy().into_owned()],
        };

        let run = Supervisor::new(BackendInvocation::new(&backend, &plan), services, true, false)
            .run();
        let interrupt = async {
            let pid: i32 = wait_for_file(&pidfile).await.trim().parse().unwrap();
            nix::sys::signal::raise(Signal::SIGINT).unwrap();
            pid
        };
        let (report, pid) = tokio::time::timeout(Duration::from_secs(20), async {
            tokio::join!(run, interrupt)
        })
        .await
        .unwrap();

        assert_eq!(report.unwrap(), RunReport { exit_code: 130, attempts: 1 });
        assert!(!launched.exists());
        for _ in 0..100 {
            if !is_running(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("display engine {pid} outlived the run");
    }
}
