//! Sandboxing for untrusted Windows programs.
//!
//! A run goes through four stages:
//! - [`intent`]: what the user asked for, resolved and conflict-checked
//! - [`policy`]: compiled into mount rules, environment and a command
//! - [`invoker`]: serialized into a bubblewrap invocation
//! - [`supervisor`]: launched with its auxiliary [`services`], retried on
//!   signal deaths, and reported as an exit code from [`status`]

pub mod detect;
pub mod error;
pub mod host;
pub mod intent;
pub mod invoker;
pub mod policy;
pub mod pty;
pub mod rule;
pub mod services;
pub mod status;
pub mod supervisor;

pub use detect::{SandboxCapabilities, detect_capabilities};
pub use error::SandboxError;
pub use host::{HostFacts, LiveHost};
pub use intent::{AccessMode, Intent, NestedEngine, PassThrough, RuntimePrefix, X11Mode, X11Request};
pub use invoker::{BackendInvocation, DEFAULT_BACKEND, locate_backend};
pub use policy::{CompileOptions, SandboxPlan, ServiceContribution, compile};
pub use rule::{MountKind, MountRule};
pub use services::{AuxiliaryServices, ServicePlan, X11Settings, plan_services};
pub use supervisor::{RunReport, Supervisor};
