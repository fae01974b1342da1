//! CLI subcommand: `winecage status`
//!
//! Shows what this host offers for sandboxing and the effective configuration.

use anyhow::Result;

use crate::config::Config;
use crate::sandbox::{LiveHost, detect_capabilities, status};

pub fn run(config: &Config) -> Result<()> {
    let caps = detect_capabilities(&config.sandbox.backend, &LiveHost::new());

    println!("Sandbox Capabilities:");
    for line in caps.status_lines() {
        println!("{}", line);
    }
    println!();

    println!("Configuration:");
    println!("  File:        {}", config.file_path().display());
    println!("  Backend:     {}", config.sandbox.backend);
    println!("  Retry:       {}", config.sandbox.retry);
    println!("  PTY:         {}", config.sandbox.pty);
    println!("  Teardown:    {}s", config.sandbox.teardown_grace_secs);
    println!(
        "  Display:     {}x{}, ready within {}s",
        config.x11.width, config.x11.height, config.x11.ready_timeout_secs
    );
    if !config.sandbox.env_allow.is_empty() {
        println!("  Extra env:   {}", config.sandbox.env_allow.join(", "));
    }
    println!();

    println!("Exit Codes:");
    for (code, meaning) in exit_code_table() {
        println!("  {:>7}  {}", code, meaning);
    }

    Ok(())
}

fn exit_code_table() -> Vec<(String, &'static str)> {
    [
        (status::SUCCESS, "program succeeded"),
        (status::GENERAL_FAILURE, "configuration or I/O error in winecage"),
        (status::PATH_EXPOSED, "probe found a path that should be hidden"),
        (status::NETWORK_DISABLED, "network needed but not enabled"),
        (status::DISPLAY_TIMEOUT, "nested display never got input"),
        (status::USAGE_ERROR, "conflicting or malformed options"),
        (status::MISSING_PATH, "a path to expose does not exist"),
        (status::SERVICE_UNAVAILABLE, "display or audio service did not start"),
        (status::BACKEND_UNAVAILABLE, "sandbox backend not found"),
    ]
    .into_iter()
    .map(|(code, meaning)| (code.to_string(), meaning))
    .chain(std::iter::once((
        format!("{}+N", status::SIGNAL_BASE),
        "program killed by signal N",
    )))
    .collect()
}
