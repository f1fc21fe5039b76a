//! Shared types for the berth workbench backend.
//!
//! Everything the other crates agree on lives here: entity structs, status
//! enums with their wire string forms, job kinds and payloads, and the error
//! taxonomy the dispatcher uses to decide retry-vs-fail.

pub mod error;
pub mod job;
pub mod types;

pub use error::{Error, ErrorClass, Result};
pub use job::{
    fifo_key_session, fifo_key_workspace, Job, JobKind, JobStatus, SessionCommitPayload,
    SessionDeletePayload, SessionInitPayload, WorkspaceInitPayload,
};
pub use types::{
    Agent, AgentId, CommitStatus, EventKind, EventRecord, JobId, Message, Project, ProjectId,
    Session, SessionId, SessionStatus, SourceType, User, UserId, UserPreference, Workspace,
    WorkspaceId, WorkspaceStatus,
};

/// Current wall-clock time as unix milliseconds.
///
/// All persisted timestamps use this representation so that one query text
/// serves both database backends.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
