use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use berth_core::SessionId;

/// Container port the in-sandbox agent listens on.
pub const AGENT_PORT: u16 = 3002;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxStatus {
    Created,
    Running,
    Stopped,
    Failed,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SandboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown SandboxStatus: {other}")),
        }
    }
}

/// What happens to a sandbox's volumes on removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumePolicy {
    /// Keep volumes so a recreated sandbox resumes where it left off
    /// (image upgrades, orphan cleanup).
    Preserve,
    /// Delete volumes. Only explicit session deletion does this.
    Delete,
}

/// Resource limits handed to the backend at create time.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    /// Idle timeout the sidecar enforces inside the sandbox.
    pub timeout: Option<Duration>,
}

/// Arguments to [`SandboxProvider::create`](crate::SandboxProvider::create).
#[derive(Debug, Clone)]
pub struct CreateOpts {
    /// 32-byte random secret authenticating sidecar calls.
    pub shared_secret: String,
    pub labels: HashMap<String, String>,
    /// Host path of the per-session working copy, mounted as the sandbox
    /// workspace.
    pub workspace_path: PathBuf,
    pub workspace_source: Option<String>,
    pub workspace_commit: Option<String>,
    pub resources: Resources,
}

/// Provider view of one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub session_id: SessionId,
    pub status: SandboxStatus,
    pub image: String,
    /// Host port mapped to [`AGENT_PORT`], once started.
    pub agent_port: Option<u16>,
    pub labels: HashMap<String, String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct AttachOpts {
    pub rows: u16,
    pub cols: u16,
    /// Empty string means the container's default user.
    pub user: String,
}

impl Default for AttachOpts {
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 80,
            user: String::new(),
        }
    }
}
