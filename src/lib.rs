//! winecage - run untrusted Windows programs under Wine inside a
//! deny-by-default bubblewrap sandbox
//!
//! This crate provides:
//! - Policy compilation from user intents into mount rules and environment
//! - Nested X11 and PulseAudio services for sandboxed programs
//! - A supervisor that runs the sandbox on a pseudo-terminal, forwards
//!   signals and retries programs killed by a signal

pub mod cli;
pub mod config;
pub mod paths;
pub mod sandbox;

pub use config::Config;
