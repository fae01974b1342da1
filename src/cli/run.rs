//! CLI subcommand: `winecage run`
//!
//! Resolves the command line into an [`Intent`], compiles it, announces the
//! backend invocation and supervises the run.

use anyhow::{Context, Result};
use clap::Args;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Config;
use crate::sandbox::policy::CompileOptions;
use crate::sandbox::{
    AuxiliaryServices, BackendInvocation, Intent, LiveHost, NestedEngine, PassThrough,
    RuntimePrefix, SandboxError, Supervisor, X11Mode, X11Request, compile, locate_backend,
    plan_services,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Enable nested X11 using nxagent, Xephyr or Xnest, whichever is installed first
    #[arg(long, help_heading = "X11")]
    pub x11: bool,

    /// Enable nested X11 using X2Go nxagent
    #[arg(long, help_heading = "X11")]
    pub nxagent: bool,

    /// Enable nested X11 using Xephyr
    #[arg(long, help_heading = "X11")]
    pub xephyr: bool,

    /// Enable nested X11 using Xnest
    #[arg(long, help_heading = "X11")]
    pub xnest: bool,

    /// Enable nested X11 using xpra (seamless windows)
    #[arg(long, help_heading = "X11")]
    pub xpra: bool,

    /// Enable nested X11 using Xvfb (invisible)
    #[arg(long, help_heading = "X11")]
    pub xvfb: bool,

    /// Use the host X11 display directly (CAREFUL: the program sees every window)
    #[arg(long = "host-x11-danger-danger", help_heading = "X11")]
    pub host_x11: bool,

    /// Enable networking
    #[arg(long)]
    pub network: bool,

    /// Enable sound through the host PulseAudio socket
    #[arg(long)]
    pub pulseaudio: bool,

    /// Use host PATH for ~/.wine/ instead of an empty throwaway directory
    #[arg(long, value_name = "PATH[:{ro,rw}]", help_heading = "Mounts")]
    pub dotwine: Option<String>,

    /// Bind mount host PATH on PATH (CAREFUL!)
    #[arg(long = "pass", value_name = "PATH:{ro,rw}", help_heading = "Mounts")]
    pub passes: Vec<String>,

    /// Run winecfg before PROGRAM
    #[arg(long)]
    pub configure: bool,

    /// Run PROGRAM without Wine
    #[arg(long)]
    pub no_wine: bool,

    /// Start PROGRAM again whenever it is killed by a signal
    #[arg(long)]
    pub retry: bool,

    /// Do not allocate a pseudo-terminal
    #[arg(long)]
    pub no_pty: bool,

    /// Print the backend invocation and exit without running it
    #[arg(long)]
    pub dry_run: bool,

    /// Program to run, followed by its arguments
    #[arg(
        value_name = "PROGRAM",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub program: Vec<String>,
}

impl RunArgs {
    fn x11_requests(&self) -> Vec<X11Request> {
        [
            (self.x11, X11Request::Auto),
            (self.nxagent, X11Request::Engine(NestedEngine::Nxagent)),
            (self.xephyr, X11Request::Engine(NestedEngine::Xephyr)),
            (self.xnest, X11Request::Engine(NestedEngine::Xnest)),
            (self.xpra, X11Request::Engine(NestedEngine::Xpra)),
            (self.xvfb, X11Request::Engine(NestedEngine::Xvfb)),
            (self.host_x11, X11Request::Host),
        ]
        .into_iter()
        .filter_map(|(set, request)| set.then_some(request))
        .collect()
    }

    /// Resolve flags and config defaults into an intent. Relative paths are
    /// taken relative to `cwd`.
    pub fn to_intent(
        &self,
        config: &Config,
        cwd: &Path,
        is_available: impl Fn(&str) -> bool,
    ) -> Result<Intent, SandboxError> {
        let x11 = X11Mode::from_requests(&self.x11_requests(), is_available)?;

        let mut passes = Vec::with_capacity(self.passes.len());
        for raw in &self.passes {
            let mut pass: PassThrough = raw.parse()?;
            pass.path = absolutize(cwd, &pass.path);
            passes.push(pass);
        }

        let runtime_prefix = match &self.dotwine {
            Some(raw) => {
                let mut prefix: RuntimePrefix = raw.parse()?;
                prefix.path = absolutize(cwd, &prefix.path);
                prefix.fresh = !prefix.path.exists();
                Some(prefix)
            }
            None => None,
        };

        Ok(Intent {
            network: self.network,
            x11,
            audio: self.pulseaudio,
            passes,
            retry: self.retry || config.sandbox.retry,
            pty: !self.no_pty && config.sandbox.pty,
            with_wine: !self.no_wine,
            // A brand-new prefix needs winecfg to initialize it.
            configure: self.configure || runtime_prefix.as_ref().is_some_and(|p| p.fresh),
            runtime_prefix,
            program: self.program.clone(),
        })
    }
}

fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Create a prefix directory (and parents) with mode 0700.
fn create_prefix(path: &Path) -> Result<()> {
    info!("Creating directory {}...", path.display());
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .with_context(|| format!("Failed to create {}", path.display()))
}

/// Run a program in the sandbox and return the exit code for the process.
pub async fn run(args: RunArgs, config: &Config) -> Result<i32> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let intent = args.to_intent(config, &cwd, |cmd| which::which(cmd).is_ok())?;

    if let Some(prefix) = &intent.runtime_prefix
        && prefix.fresh
        && !args.dry_run
    {
        create_prefix(&prefix.path)?;
    }

    if intent.x11 == X11Mode::HostDirect {
        warn!("Using the host X11 display: the program can see and control all your windows");
    }

    let host = LiveHost::new();
    let x11 = config.x11_settings();
    if intent.x11 == X11Mode::Nested(NestedEngine::Xpra) {
        config.paths.ensure_runtime_dir()?;
    }
    let service_plan = plan_services(&intent, &host, &x11);
    if let Some(display_plan) = &service_plan.display {
        info!("Using display {}...", display_plan.display_env);
    }

    let options = CompileOptions {
        extra_env: config.sandbox.env_allow.clone(),
    };
    let plan = compile(&intent, &host, &service_plan.contribution(), &options)?;

    let backend = if args.dry_run {
        locate_backend(&config.sandbox.backend)
            .unwrap_or_else(|_| PathBuf::from(&config.sandbox.backend))
    } else {
        locate_backend(&config.sandbox.backend)?
    };
    let invocation = BackendInvocation::new(backend, &plan);
    eprintln!("{}", invocation.announce());

    if args.dry_run {
        return Ok(0);
    }

    let services = AuxiliaryServices::new(service_plan, config.teardown_grace());
    let report = Supervisor::new(invocation, services, intent.retry, intent.pty)
        .run()
        .await?;
    if report.attempts > 1 {
        info!("Program finished after {} attempts", report.attempts);
    }
    Ok(report.exit_code)
}
