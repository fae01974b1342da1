use std::path::{Path, PathBuf};

use super::host::HostFacts;
use super::intent::NestedEngine;
use super::invoker::locate_backend;
use super::services::audio::pulse_socket;

/// What the current host offers for running sandboxes.
#[derive(Debug, Clone)]
pub struct SandboxCapabilities {
    /// Resolved backend binary, if found.
    pub backend: Option<PathBuf>,

    /// Whether unprivileged user namespaces look enabled; `None` if unknown.
    pub user_namespaces: Option<bool>,

    /// Every nested display engine and whether it is installed.
    pub engines: Vec<(NestedEngine, bool)>,

    /// Whether the PulseAudio socket exists.
    pub audio: bool,

    /// Host `DISPLAY`, if set.
    pub host_display: Option<String>,
}

/// Probe the current system.
pub fn detect_capabilities<H: HostFacts + ?Sized>(backend: &str, host: &H) -> SandboxCapabilities {
    SandboxCapabilities {
        backend: locate_backend(backend).ok(),
        user_namespaces: probe_user_namespaces(Path::new("/proc/sys")),
        engines: NestedEngine::ALL
            .into_iter()
            .map(|engine| (engine, which::which(engine.command()).is_ok()))
            .collect(),
        audio: host.exists(&pulse_socket(host.uid())),
        host_display: host.env_var("DISPLAY"),
    }
}

/// Read the user namespace knobs under a procfs `sys` directory.
fn probe_user_namespaces(proc_sys: &Path) -> Option<bool> {
    let read = |rel: &str| {
        std::fs::read_to_string(proc_sys.join(rel))
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
    };
    // Debian-style switch, absent on most kernels.
    if read("kernel/unprivileged_userns_clone") == Some(0) {
        return Some(false);
    }
    read("user/max_user_namespaces").map(|max| max > 0)
}

impl SandboxCapabilities {
    /// Engine `--x11` would pick right now.
    pub fn auto_engine(&self) -> Option<NestedEngine> {
        NestedEngine::AUTO_ORDER.into_iter().find(|engine| {
            self.engines
                .iter()
                .any(|(candidate, installed)| candidate == engine && *installed)
        })
    }

    /// Human-readable status lines for the `status` command.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        match &self.backend {
            Some(path) => lines.push(format!("  Backend:     {:<28} ok", path.display())),
            None => lines.push(format!("  Backend:     {:<28} --", "not found")),
        }

        let userns = match self.user_namespaces {
            Some(true) => "enabled                      ok",
            Some(false) => "disabled                     --",
            None => "unknown                      ??",
        };
        lines.push(format!("  User ns:     {userns}"));

        for (engine, installed) in &self.engines {
            let (state, mark) = if *installed {
                ("installed", "ok")
            } else {
                ("not installed", "--")
            };
            lines.push(format!("  {:<12} {:<28} {}", format!("{engine}:"), state, mark));
        }

        let auto = self
            .auto_engine()
            .map_or_else(|| "none".to_string(), |e| e.to_string());
        lines.push(format!("  --x11 picks: {auto}"));

        let audio = if self.audio {
            "socket present               ok"
        } else {
            "socket missing               --"
        };
        lines.push(format!("  PulseAudio:  {audio}"));

        lines.push(format!(
            "  Host X11:    {}",
            self.host_display.as_deref().unwrap_or("DISPLAY not set")
        ));

        lines
    }
}
