//! Auxiliary services the sandboxed program talks to: a display and a sound
//! server.
//!
//! Planning is pure and happens before compilation, so the compiler knows
//! which sockets to bind. Starting happens right before each launch.

pub mod audio;
pub mod process;
pub mod x11;

use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::SandboxError;
use super::host::HostFacts;
use super::intent::{Intent, NestedEngine, X11Mode};
use super::policy::ServiceContribution;
pub use x11::{DisplayPlan, NestedDisplay, X11Settings};

/// Everything decided about auxiliary services before anything runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePlan {
    pub display: Option<DisplayPlan>,
    pub audio_socket: Option<PathBuf>,
    pub x11: X11Settings,
}

/// Decide display number, sockets and variables for the requested services.
pub fn plan_services<H: HostFacts + ?Sized>(
    intent: &Intent,
    host: &H,
    x11: &X11Settings,
) -> ServicePlan {
    ServicePlan {
        display: DisplayPlan::new(intent.x11, host, x11),
        audio_socket: intent.audio.then(|| audio::pulse_socket(host.uid())),
        x11: x11.clone(),
    }
}

impl ServicePlan {
    /// Rules and variables all planned services add to the sandbox.
    pub fn contribution(&self) -> ServiceContribution {
        let mut merged = ServiceContribution::default();
        let parts = self
            .display
            .iter()
            .map(DisplayPlan::contribution)
            .chain(self.audio_socket.iter().map(|s| audio::contribution(s)));
        for part in parts {
            merged.rules.extend(part.rules);
            merged.env.extend(part.env);
        }
        merged
    }
}

/// Running auxiliary services for one supervised run.
///
/// A healthy nested display survives retries; one that died is reaped and
/// started again on the same display number.
#[derive(Debug)]
pub struct AuxiliaryServices {
    plan: ServicePlan,
    nested: Option<NestedDisplay>,
    grace: Duration,
    engine_command: Option<Vec<String>>,
}

impl AuxiliaryServices {
    pub fn new(plan: ServicePlan, grace: Duration) -> Self {
        Self {
            plan,
            nested: None,
            grace,
            engine_command: None,
        }
    }

    /// Start nested displays with `argv` instead of the engine's own command
    /// line, e.g. a wrapper script. Readiness is still judged by the display
    /// socket. Has no effect on xpra, which needs its client as well.
    pub fn with_engine_command(mut self, argv: Vec<String>) -> Self {
        self.engine_command = Some(argv);
        self
    }

    pub fn plan(&self) -> &ServicePlan {
        &self.plan
    }

    /// Make sure every planned service accepts connections.
    pub async fn ensure_ready(&mut self) -> Result<(), SandboxError> {
        if let Some(socket) = &self.plan.audio_socket {
            audio::check_ready(socket)?;
        }

        let Some(display_plan) = &self.plan.display else {
            return Ok(());
        };
        match display_plan.mode {
            X11Mode::Nested(engine) => {
                if let Some(nested) = self.nested.as_mut() {
                    if nested.is_healthy() {
                        debug!("Reusing {} on display :{}", engine, nested.display());
                        return Ok(());
                    }
                    warn!("{} on display :{} has exited, restarting it", engine, nested.display());
                    nested.shutdown(self.grace).await;
                    self.nested = None;
                }
                let number = display_plan.display;
                let nested = match &self.engine_command {
                    Some(argv) if engine != NestedEngine::Xpra => {
                        info!("Starting {} on display :{} via {}", engine, number, argv.join(" "));
                        NestedDisplay::start_command(engine, number, argv.clone(), &self.plan.x11)
                            .await?
                    }
                    _ => NestedDisplay::start(engine, number, &self.plan.x11).await?,
                };
                self.nested = Some(nested);
            }
            X11Mode::HostDirect => {
                info!("Using host display {} directly", display_plan.display_env);
            }
            X11Mode::None => {}
        }
        Ok(())
    }

    /// Stop everything that is still running.
    pub async fn shutdown(&mut self) {
        if let Some(mut nested) = self.nested.take() {
            info!("Stopping {} on display :{}", nested.engine(), nested.display());
            nested.shutdown(self.grace).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::host::{MockHostFacts, X11_SOCKET_DIR, x11_socket};
    use std::collections::BTreeSet;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixListener;
    use std::path::Path;

    fn host() -> MockHostFacts {
        let mut host = MockHostFacts::new();
        host.expect_uid().return_const(1000u32);
        host.expect_used_displays()
            .returning(|| BTreeSet::from([0u32]));
        host.expect_env_var().returning(|_| None);
        host
    }

    #[test]
    fn test_no_services_contribute_nothing() {
        let plan = plan_services(&Intent::default(), &host(), &X11Settings::default());
        assert_eq!(plan.contribution(), ServiceContribution::default());
    }

    #[test]
    fn test_display_and_audio_contributions_merge() {
        let intent = Intent {
            x11: X11Mode::Nested(NestedEngine::Xnest),
            audio: true,
            ..Intent::default()
        };
        let plan = plan_services(&intent, &host(), &X11Settings::default());
        let contribution = plan.contribution();
        assert_eq!(contribution.rules.len(), 2);
        assert_eq!(contribution.env.get("DISPLAY").map(String::as_str), Some(":1"));
        assert!(contribution.env.contains_key("PULSE_SERVER"));
    }

    #[tokio::test]
    async fn test_ready_without_services() {
        let plan = plan_services(&Intent::default(), &host(), &X11Settings::default());
        let mut services = AuxiliaryServices::new(plan, Duration::from_secs(1));
        services.ensure_ready().await.unwrap();
        services.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_audio_socket_fails_readiness() {
        let plan = ServicePlan {
            display: None,
            audio_socket: Some(PathBuf::from("/nonexistent/winecage/pulse/native")),
            x11: X11Settings::default(),
        };
        let mut services = AuxiliaryServices::new(plan, Duration::from_secs(1));
        let err = services.ensure_ready().await.unwrap_err();
        assert!(matches!(err, SandboxError::AuxiliaryServiceStart(_)));
    }

    /// A listening socket standing in for a display server, removed on drop.
    struct FakeDisplaySocket {
        number: u32,
        path: PathBuf,
        _listener: UnixListener,
    }

    impl FakeDisplaySocket {
        /// `None` when the X11 socket directory cannot be used here.
        fn bind() -> Option<Self> {
            let dir = Path::new(X11_SOCKET_DIR);
            if !dir.exists() {
                std::fs::create_dir_all(dir).ok()?;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o1777)).ok()?;
            }
            let first = 5000 + std::process::id() % 1000;
            (first..first + 100).find_map(|number| {
                let path = x11_socket(number);
                if path.exists() {
                    return None;
                }
                let listener = UnixListener::bind(&path).ok()?;
                Some(Self {
                    number,
                    path,
                    _listener: listener,
                })
            })
        }
    }

    impl Drop for FakeDisplaySocket {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    async fn wait_for_lines(path: &Path, count: usize) -> Vec<String> {
        for _ in 0..100 {
            let lines: Vec<String> = std::fs::read_to_string(path)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect();
            if lines.len() >= count {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{} never reached {count} lines", path.display());
    }

    #[tokio::test]
    async fn test_nested_display_reused_while_healthy_and_restarted_after_exit() {
        let Some(socket) = FakeDisplaySocket::bind() else {
            eprintln!("skipping: {X11_SOCKET_DIR} is not usable");
            return;
        };
        let tmp = tempfile::tempdir().unwrap();
        let starts = tmp.path().join("starts");
        let engine = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ >> '{}'; exec sleep 30", starts.display()),
        ];
        let plan = ServicePlan {
            display: Some(DisplayPlan {
                mode: X11Mode::Nested(NestedEngine::Xvfb),
                display: socket.number,
                display_env: format!(":{}", socket.number),
                xauthority: None,
            }),
            audio_socket: None,
            x11: X11Settings {
                ready_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(50),
                ..X11Settings::default()
            },
        };
        let mut services =
            AuxiliaryServices::new(plan, Duration::from_secs(1)).with_engine_command(engine);

        services.ensure_ready().await.unwrap();
        let first = wait_for_lines(&starts, 1).await;
        services.ensure_ready().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(wait_for_lines(&starts, 1).await, first);

        let pid = nix::unistd::Pid::from_raw(first[0].parse().unwrap());
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        for _ in 0..100 {
            if !services.nested.as_mut().unwrap().is_healthy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        services.ensure_ready().await.unwrap();
        let restarted = wait_for_lines(&starts, 2).await;
        assert_eq!(restarted.len(), 2);
        assert_ne!(restarted[1], restarted[0]);
        assert_eq!(services.nested.as_ref().unwrap().display(), socket.number);

        services.shutdown().await;
        assert!(services.nested.is_none());
    }
}
