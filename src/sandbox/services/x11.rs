//! X11 display access: host passthrough and nested display servers.

use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

use super::process::ManagedProcess;
use crate::sandbox::error::SandboxError;
use crate::sandbox::host::{HostFacts, x11_socket};
use crate::sandbox::intent::{NestedEngine, X11Mode};
use crate::sandbox::policy::{RuleRequest, ServiceContribution};
use crate::sandbox::rule::MountRule;

/// How long a display that failed to come up gets to stop before it is killed.
const FAILED_START_GRACE: Duration = Duration::from_secs(2);

/// Geometry and timing for nested displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Settings {
    pub width: u32,
    pub height: u32,
    /// Lowest display number handed to a nested server.
    pub min_display: u32,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    /// Parent of the xpra scratch directory; the system temp dir if unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for X11Settings {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            min_display: 0,
            ready_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            scratch_dir: None,
        }
    }
}

/// Largest free display number in `0..=used.len()`, or `minimum` if that is
/// larger and free. There is always at least one candidate.
pub fn find_unused(used: &BTreeSet<u32>, minimum: u32) -> u32 {
    let count = used.len() as u32;
    (0..=count)
        .chain(std::iter::once(minimum))
        .filter(|n| !used.contains(n))
        .max()
        .unwrap_or(count)
}

/// Host display number from a `DISPLAY` value such as `:0` or `:1.0`.
pub fn parse_display_number(display: &str) -> Option<u32> {
    let (_, rest) = display.rsplit_once(':')?;
    let number = rest.split('.').next()?;
    number.parse().ok()
}

/// X11 decisions made before anything is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayPlan {
    pub mode: X11Mode,
    pub display: u32,
    /// `DISPLAY` as seen by the sandboxed program.
    pub display_env: String,
    /// Host `XAUTHORITY` file to expose, for host passthrough.
    pub xauthority: Option<PathBuf>,
}

impl DisplayPlan {
    pub fn new<H: HostFacts + ?Sized>(
        mode: X11Mode,
        host: &H,
        settings: &X11Settings,
    ) -> Option<Self> {
        match mode {
            X11Mode::None => None,
            X11Mode::HostDirect => {
                let host_display = host.env_var("DISPLAY");
                let display = host_display
                    .as_deref()
                    .and_then(parse_display_number)
                    .unwrap_or(0);
                Some(Self {
                    mode,
                    display,
                    display_env: host_display.unwrap_or_else(|| format!(":{display}")),
                    xauthority: host.env_var("XAUTHORITY").map(PathBuf::from),
                })
            }
            X11Mode::Nested(_) => {
                let display = find_unused(&host.used_displays(), settings.min_display);
                Some(Self {
                    mode,
                    display,
                    display_env: format!(":{display}"),
                    xauthority: None,
                })
            }
        }
    }

    pub fn socket(&self) -> PathBuf {
        x11_socket(self.display)
    }

    pub fn contribution(&self) -> ServiceContribution {
        let mut rules = vec![RuleRequest::deferred(MountRule::read_write(self.socket()))];
        let mut env = BTreeMap::from([("DISPLAY".to_string(), self.display_env.clone())]);
        if let Some(xauthority) = &self.xauthority {
            rules.push(RuleRequest::optional(MountRule::read_write(xauthority)));
            env.insert(
                "XAUTHORITY".to_string(),
                xauthority.to_string_lossy().into_owned(),
            );
        }
        ServiceContribution { rules, env }
    }
}

/// Argument vector that starts `engine` on `display`.
pub fn engine_argv(engine: NestedEngine, display: u32, settings: &X11Settings) -> Vec<String> {
    let display_arg = format!(":{display}");
    let geometry = format!("{}x{}", settings.width, settings.height);
    let args: Vec<String> = match engine {
        NestedEngine::Nxagent => vec![
            "-nolisten".into(),
            "tcp".into(),
            "-ac".into(),
            "-noshmem".into(),
            "-R".into(),
        ],
        NestedEngine::Xephyr => vec![
            "-screen".into(),
            geometry,
            "-extension".into(),
            "MIT-SHM".into(),
        ],
        NestedEngine::Xnest => vec!["-geometry".into(), geometry],
        NestedEngine::Xvfb => vec![
            "-screen".into(),
            "0".into(),
            format!("{geometry}x24"),
            "-extension".into(),
            "MIT-SHM".into(),
        ],
        NestedEngine::Xpra => return Vec::new(),
    };
    std::iter::once(engine.command().to_string())
        .chain(args)
        .chain(std::iter::once(display_arg))
        .collect()
}

/// Script xpra uses in place of its built-in Xvfb command line.
const XPRA_XVFB_WRAPPER: &str = r#"#! /usr/bin/env bash
exec Xvfb \
    +extension GLX \
    +extension Composite \
    -extension MIT-SHM \
    -screen 0 8192x4096x24+32 \
    -nolisten tcp \
    -noreset \
    -dpi 96 \
    "$@"
"#;

fn xpra_server_argv(display: u32, socket: &Path, sessions_dir: &Path, wrapper: &Path) -> Vec<String> {
    let mut argv: Vec<String> = [
        "xpra",
        "start",
        "--attach=no",
        "--bandwidth-limit=0",
        "--bell=no",
        "--clipboard=no",
        "--daemon=no",
        "--dbus-launch=",
        "--dbus-proxy=no",
        "--file-transfer=no",
        "--html=off",
        "--http-scripts=off",
        "--microphone=off",
        "--min-quality=100",
        "--open-files=no",
        "--open-url=no",
        "--printing=no",
        "--proxy-start-sessions=no",
        "--pulseaudio=no",
        "--quality=100",
        "--speaker=off",
        "--start-new-commands=no",
        "--systemd-run=no",
        "--use-display=no",
        "--video-scaling=0",
        "--webcam=no",
        "--xsettings=no",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    argv.push(format!("--bind={}", socket.display()));
    argv.push(format!("--sessions-dir={}", sessions_dir.display()));
    argv.push(format!("--xvfb={}", wrapper.display()));
    argv.push(format!(":{display}"));
    argv
}

fn xpra_client_argv(socket: &Path, sessions_dir: &Path) -> Vec<String> {
    vec![
        "xpra".to_string(),
        "attach".to_string(),
        format!("--sessions-dir={}", sessions_dir.display()),
        socket.to_string_lossy().into_owned(),
    ]
}

/// A running nested display server (plus, for xpra, its attached client).
#[derive(Debug)]
pub struct NestedDisplay {
    engine: NestedEngine,
    display: u32,
    processes: Vec<ManagedProcess>,
    /// Holds the xpra wrapper script and sessions dir while xpra runs.
    _workdir: Option<tempfile::TempDir>,
}

impl NestedDisplay {
    /// Start `engine` on `display` and wait until the display accepts clients.
    pub async fn start(
        engine: NestedEngine,
        number: u32,
        settings: &X11Settings,
    ) -> Result<Self, SandboxError> {
        info!("Starting {} on display :{}", engine, number);
        match engine {
            NestedEngine::Xpra => Self::start_xpra(number, settings).await,
            _ => {
                Self::start_command(engine, number, engine_argv(engine, number, settings), settings)
                    .await
            }
        }
    }

    pub(crate) async fn start_command(
        engine: NestedEngine,
        display: u32,
        argv: Vec<String>,
        settings: &X11Settings,
    ) -> Result<Self, SandboxError> {
        let process = ManagedProcess::spawn(&argv, Signal::SIGINT, &[])?;
        let mut nested = Self {
            engine,
            display,
            processes: vec![process],
            _workdir: None,
        };
        nested.ready_or_stop(settings).await?;
        Ok(nested)
    }

    async fn start_xpra(display: u32, settings: &X11Settings) -> Result<Self, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("winecage-xpra-");
        let workdir = match &settings.scratch_dir {
            Some(dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        };
        let wrapper = workdir.path().join("xvfb");
        std::fs::write(&wrapper, XPRA_XVFB_WRAPPER)?;
        std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755))?;
        let sessions_dir = workdir.path().join("sessions");
        std::fs::create_dir(&sessions_dir)?;
        let socket = workdir.path().join("xpra.sock");

        let server = ManagedProcess::spawn(
            &xpra_server_argv(display, &socket, &sessions_dir, &wrapper),
            Signal::SIGTERM,
            &[],
        )?;
        let mut nested = Self {
            engine: NestedEngine::Xpra,
            display,
            processes: vec![server],
            _workdir: Some(workdir),
        };

        if let Err(e) = nested.wait_for_xpra_server(&socket, settings).await {
            nested.shutdown(FAILED_START_GRACE).await;
            return Err(e);
        }

        // The client must not reach the user's SSH agent.
        let client = ManagedProcess::spawn(
            &xpra_client_argv(&socket, &sessions_dir),
            Signal::SIGTERM,
            &["SSH_AUTH_SOCK"],
        );
        match client {
            Ok(client) => nested.processes.push(client),
            Err(e) => {
                nested.shutdown(FAILED_START_GRACE).await;
                return Err(e);
            }
        }
        nested.ready_or_stop(settings).await?;
        Ok(nested)
    }

    async fn wait_for_xpra_server(
        &mut self,
        socket: &Path,
        settings: &X11Settings,
    ) -> Result<(), SandboxError> {
        let deadline = Instant::now() + settings.ready_timeout;
        loop {
            if socket.exists() && xpra_answers(socket).await {
                debug!("xpra server on {} is up", socket.display());
                return Ok(());
            }
            self.check_alive()?;
            if Instant::now() >= deadline {
                return Err(SandboxError::AuxiliaryServiceStart(format!(
                    "xpra server did not come up within {:?}",
                    settings.ready_timeout
                )));
            }
            tokio::time::sleep(settings.poll_interval).await;
        }
    }

    async fn ready_or_stop(&mut self, settings: &X11Settings) -> Result<(), SandboxError> {
        if let Err(e) = self.wait_until_ready(settings).await {
            self.shutdown(FAILED_START_GRACE).await;
            return Err(e);
        }
        Ok(())
    }

    /// Poll until the display socket accepts a connection.
    async fn wait_until_ready(&mut self, settings: &X11Settings) -> Result<(), SandboxError> {
        let socket = x11_socket(self.display);
        let deadline = Instant::now() + settings.ready_timeout;
        loop {
            if socket.exists() && UnixStream::connect(&socket).await.is_ok() {
                info!("Display :{} is ready", self.display);
                return Ok(());
            }
            self.check_alive()?;
            if Instant::now() >= deadline {
                return Err(SandboxError::AuxiliaryServiceStart(format!(
                    "{} did not bring up display :{} within {:?}",
                    self.engine, self.display, settings.ready_timeout
                )));
            }
            tokio::time::sleep(settings.poll_interval).await;
        }
    }

    fn check_alive(&mut self) -> Result<(), SandboxError> {
        for process in &mut self.processes {
            if process.has_exited() {
                return Err(SandboxError::AuxiliaryServiceStart(format!(
                    "{} exited before display :{} became ready",
                    process.name(),
                    self.display
                )));
            }
        }
        Ok(())
    }

    pub fn engine(&self) -> NestedEngine {
        self.engine
    }

    pub fn display(&self) -> u32 {
        self.display
    }

    /// True while every process of the display is still running.
    pub fn is_healthy(&mut self) -> bool {
        self.processes.iter_mut().all(|p| !p.has_exited())
    }

    /// Stop processes in reverse start order.
    pub async fn shutdown(&mut self, grace: Duration) {
        for process in self.processes.iter_mut().rev() {
            process.shutdown(grace).await;
        }
    }
}

async fn xpra_answers(socket: &Path) -> bool {
    Command::new("xpra")
        .arg("id")
        .arg(socket)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
