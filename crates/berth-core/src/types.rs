use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

// ── ID types ──
pub type UserId = Uuid;
pub type ProjectId = Uuid;
pub type WorkspaceId = Uuid;
pub type SessionId = Uuid;
pub type AgentId = Uuid;
pub type JobId = Uuid;

// ── Workspace ──

/// Where a workspace's repository comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    /// A path on the host, cloned locally.
    Local,
    /// A remote git URL.
    Git,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Git => "git",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "git" => Ok(Self::Git),
            other => Err(format!("unknown SourceType: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkspaceStatus {
    Initializing,
    Ready,
    Error,
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl FromStr for WorkspaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown WorkspaceStatus: {other}")),
        }
    }
}

/// A project-level git clone shared by all sessions in the project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub project_id: ProjectId,
    /// Absolute host path of the shared clone. Set by the workspace-init job.
    pub path: Option<PathBuf>,
    pub source_type: SourceType,
    pub source: String,
    pub display_name: Option<String>,
    pub status: WorkspaceStatus,
    /// HEAD of the shared clone. Non-empty iff `source_type == Git` and
    /// `status == Ready`.
    pub commit: Option<String>,
    pub branches: Option<Vec<String>>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ── Session ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Initializing,
    Reinitializing,
    Cloning,
    PullingImage,
    CreatingSandbox,
    Ready,
    Running,
    Stopped,
    Error,
    Removing,
}

impl SessionStatus {
    /// States where no init/commit/delete work is in flight. `Error` and
    /// `Stopped` are settled but not terminal — `EnsureReady` drives them
    /// back through init.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ready | Self::Stopped | Self::Error)
    }

    /// Init-phase states the gatekeeper polls through before giving up.
    pub fn is_initializing(&self) -> bool {
        matches!(
            self,
            Self::Initializing
                | Self::Reinitializing
                | Self::Cloning
                | Self::PullingImage
                | Self::CreatingSandbox
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Reinitializing => "reinitializing",
            Self::Cloning => "cloning",
            Self::PullingImage => "pulling_image",
            Self::CreatingSandbox => "creating_sandbox",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Removing => "removing",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "reinitializing" => Ok(Self::Reinitializing),
            "cloning" => Ok(Self::Cloning),
            "pulling_image" => Ok(Self::PullingImage),
            "creating_sandbox" => Ok(Self::CreatingSandbox),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            "removing" => Ok(Self::Removing),
            other => Err(format!("unknown SessionStatus: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitStatus {
    None,
    Pending,
    Committing,
    Completed,
    Failed,
}

impl std::fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Committing => "committing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CommitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "committing" => Ok(Self::Committing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown CommitStatus: {other}")),
        }
    }
}

/// An ephemeral workbench: one sandbox, one per-session working copy.
///
/// `workspace_path` and `workspace_commit` are frozen at first successful
/// init and never overwritten — reinit preserves them bit-for-bit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub project_id: ProjectId,
    pub workspace_id: WorkspaceId,
    pub agent_id: Option<AgentId>,
    pub name: String,
    pub display_name: Option<String>,
    pub status: SessionStatus,
    pub workspace_path: Option<PathBuf>,
    pub workspace_commit: Option<String>,
    /// The workspace SHA the agent treats as the parent of its patches.
    pub base_commit: Option<String>,
    /// HEAD of the session branch after the last successful patch application.
    pub applied_commit: Option<String>,
    pub commit_status: CommitStatus,
    pub commit_error: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ── Agent ──

/// A recipe for materialising the in-sandbox agent: type, prompt, model
/// options. One agent per project may be the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub project_id: ProjectId,
    pub name: String,
    pub agent_type: String,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub model_options: Option<serde_json::Value>,
    pub is_default: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

// ── Events ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    SessionUpdated,
    WorkspaceUpdated,
    JobCompleted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SessionUpdated => "session_updated",
            Self::WorkspaceUpdated => "workspace_updated",
            Self::JobCompleted => "job_completed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_updated" => Ok(Self::SessionUpdated),
            "workspace_updated" => Ok(Self::WorkspaceUpdated),
            "job_completed" => Ok(Self::JobCompleted),
            other => Err(format!("unknown EventKind: {other}")),
        }
    }
}

/// One append-only event row, tailed by the poller and fanned out to SSE
/// subscribers. `sequence` is gap-free and strictly increasing per project;
/// `id` is the global poller cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub project_id: ProjectId,
    pub kind: EventKind,
    pub target_id: String,
    /// For `job_completed` rows, which job kind finished.
    pub job_kind: Option<String>,
    pub status: Option<String>,
    pub message: Option<String>,
    pub sequence: i64,
    pub ts: i64,
}

// ── Ancillary entities ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub owner_id: UserId,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreference {
    pub user_id: UserId,
    pub key: String,
    pub value: serde_json::Value,
}

/// A chat message persisted for session reload. Content is the sidecar's
/// message JSON, stored opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: SessionId,
    pub role: String,
    pub content: serde_json::Value,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_round_trips_through_strings() {
        let all = [
            SessionStatus::Initializing,
            SessionStatus::Reinitializing,
            SessionStatus::Cloning,
            SessionStatus::PullingImage,
            SessionStatus::CreatingSandbox,
            SessionStatus::Ready,
            SessionStatus::Running,
            SessionStatus::Stopped,
            SessionStatus::Error,
            SessionStatus::Removing,
        ];
        for status in all {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!("warming_up".parse::<SessionStatus>().is_err());
        assert!("".parse::<CommitStatus>().is_err());
    }

    #[test]
    fn settled_states() {
        assert!(SessionStatus::Ready.is_settled());
        assert!(SessionStatus::Stopped.is_settled());
        assert!(SessionStatus::Error.is_settled());
        assert!(!SessionStatus::Cloning.is_settled());
        assert!(!SessionStatus::Removing.is_settled());
    }

    #[test]
    fn initializing_states_cover_the_init_pipeline() {
        assert!(SessionStatus::Cloning.is_initializing());
        assert!(SessionStatus::PullingImage.is_initializing());
        assert!(SessionStatus::CreatingSandbox.is_initializing());
        assert!(!SessionStatus::Running.is_initializing());
    }

    #[test]
    fn event_kind_wire_names() {
        assert_eq!(EventKind::SessionUpdated.to_string(), "session_updated");
        assert_eq!(
            "workspace_updated".parse::<EventKind>().unwrap(),
            EventKind::WorkspaceUpdated
        );
    }
}
