use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::types::{AgentId, JobId, ProjectId, SessionId, WorkspaceId};

// ── Job kinds ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    WorkspaceInit,
    SessionInit,
    SessionCommit,
    SessionDelete,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WorkspaceInit => "workspace_init",
            Self::SessionInit => "session_init",
            Self::SessionCommit => "session_commit",
            Self::SessionDelete => "session_delete",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workspace_init" => Ok(Self::WorkspaceInit),
            "session_init" => Ok(Self::SessionInit),
            "session_commit" => Ok(Self::SessionCommit),
            "session_delete" => Ok(Self::SessionDelete),
            other => Err(format!("unknown JobKind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Leased,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "leased" => Ok(Self::Leased),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown JobStatus: {other}")),
        }
    }
}

// ── FIFO keys ──

/// FIFO key serialising all init/commit/delete work for one session.
pub fn fifo_key_session(id: SessionId) -> String {
    format!("session:{id}")
}

/// FIFO key serialising init work for one workspace.
pub fn fifo_key_workspace(id: WorkspaceId) -> String {
    format!("workspace:{id}")
}

// ── Job row ──

/// A durable row in the job queue.
///
/// Invariants: at most one `Leased` job per `fifo_key`; a leased job whose
/// `lease_expires_at` has passed is eligible for stealing; terminal status
/// is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Monotone enqueue order; the FIFO-key claim orders by this, never by
    /// wall-clock time.
    pub seq: i64,
    pub kind: JobKind,
    pub fifo_key: String,
    /// Kind-specific payload, JSON-encoded.
    pub payload: String,
    pub status: JobStatus,
    pub attempt: i32,
    pub max_attempts: i32,
    pub not_before: i64,
    pub lease_expires_at: Option<i64>,
    pub lease_owner: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ── Payloads ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInitPayload {
    pub project_id: ProjectId,
    pub workspace_id: WorkspaceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInitPayload {
    pub project_id: ProjectId,
    pub session_id: SessionId,
    pub workspace_id: WorkspaceId,
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCommitPayload {
    pub project_id: ProjectId,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDeletePayload {
    pub project_id: ProjectId,
    pub session_id: SessionId,
}
