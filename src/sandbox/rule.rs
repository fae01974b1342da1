use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::SandboxError;

/// How a single target path is populated inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountKind {
    /// Host path exposed read-only.
    BindReadOnly,
    /// Host path exposed read-write.
    BindReadWrite,
    /// Fresh, empty tmpfs.
    FreshEmptyDir,
    /// Fresh devtmpfs with the minimal device nodes.
    FreshDeviceDir,
    /// Fresh procfs for the sandbox's pid namespace.
    FreshProcDir,
}

impl MountKind {
    pub fn is_bind(self) -> bool {
        matches!(self, MountKind::BindReadOnly | MountKind::BindReadWrite)
    }
}

/// One exposure decision for one target path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRule {
    /// Host path for binds; `None` for synthetic filesystems.
    pub source: Option<PathBuf>,

    /// Absolute path inside the sandbox.
    pub target: PathBuf,

    pub kind: MountKind,

    /// Keep device nodes usable (only for read-write binds, e.g. `/dev/dri`).
    pub device_access: bool,
}

impl MountRule {
    /// Bind `path` at the same path inside the sandbox.
    pub fn bind(path: impl Into<PathBuf>, kind: MountKind) -> Self {
        let path = path.into();
        Self {
            source: Some(path.clone()),
            target: path,
            kind,
            device_access: false,
        }
    }

    /// Bind `source` at a different `target` inside the sandbox.
    pub fn bind_at(source: impl Into<PathBuf>, target: impl Into<PathBuf>, kind: MountKind) -> Self {
        Self {
            source: Some(source.into()),
            target: target.into(),
            kind,
            device_access: false,
        }
    }

    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self::bind(path, MountKind::BindReadOnly)
    }

    pub fn read_write(path: impl Into<PathBuf>) -> Self {
        Self::bind(path, MountKind::BindReadWrite)
    }

    /// Read-write bind that keeps device nodes functional.
    pub fn device(path: impl Into<PathBuf>) -> Self {
        Self {
            device_access: true,
            ..Self::bind(path, MountKind::BindReadWrite)
        }
    }

    pub fn fresh(target: impl Into<PathBuf>, kind: MountKind) -> Self {
        Self {
            source: None,
            target: target.into(),
            kind,
            device_access: false,
        }
    }

    pub fn tmpfs(target: impl Into<PathBuf>) -> Self {
        Self::fresh(target, MountKind::FreshEmptyDir)
    }

    /// Host path backing this rule, if it is a bind.
    pub fn source_path(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn is_writable(&self) -> bool {
        self.kind != MountKind::BindReadOnly
    }

    /// Check the structural invariants of a rule.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if !self.target.is_absolute() {
            return Err(SandboxError::InvalidArgument(format!(
                "mount target {} is not absolute",
                self.target.display()
            )));
        }
        match (self.kind.is_bind(), &self.source) {
            (true, None) => {
                return Err(SandboxError::InvalidArgument(format!(
                    "bind mount at {} has no source",
                    self.target.display()
                )));
            }
            (false, Some(source)) => {
                return Err(SandboxError::InvalidArgument(format!(
                    "synthetic filesystem at {} cannot have source {}",
                    self.target.display(),
                    source.display()
                )));
            }
            _ => {}
        }
        if self.device_access && self.kind != MountKind::BindReadWrite {
            return Err(SandboxError::InvalidArgument(format!(
                "device access at {} requires a read-write bind",
                self.target.display()
            )));
        }
        Ok(())
    }
}
