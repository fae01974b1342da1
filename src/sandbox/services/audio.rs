//! PulseAudio passthrough.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::sandbox::error::SandboxError;
use crate::sandbox::policy::{RuleRequest, ServiceContribution};
use crate::sandbox::rule::MountRule;

/// The per-user PulseAudio socket.
pub fn pulse_socket(uid: u32) -> PathBuf {
    PathBuf::from(format!("/run/user/{uid}/pulse/native"))
}

pub fn contribution(socket: &Path) -> ServiceContribution {
    ServiceContribution {
        rules: vec![RuleRequest::deferred(MountRule::read_write(socket))],
        env: BTreeMap::from([(
            "PULSE_SERVER".to_string(),
            format!("unix:{}", socket.display()),
        )]),
    }
}

/// The sound server is not started by us, so it must already be listening.
pub fn check_ready(socket: &Path) -> Result<(), SandboxError> {
    if socket.exists() {
        Ok(())
    } else {
        Err(SandboxError::AuxiliaryServiceStart(format!(
            "audio socket {} does not exist, is PulseAudio running?",
            socket.display()
        )))
    }
}
