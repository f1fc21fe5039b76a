//! Row-to-entity decoding.
//!
//! The Any driver only maps scalar column types, so rows come back as
//! tuples of `i64` / `String` / `Option<_>` and are converted here. UUID or
//! enum parse failures mean a corrupted row and surface as `Internal`.

use std::path::PathBuf;
use std::str::FromStr;

use berth_core::{
    Agent, Error, EventKind, EventRecord, Job, JobKind, JobStatus, Result, Session, Workspace,
};
use uuid::Uuid;

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Internal(format!("corrupt uuid column '{s}': {e}")))
}

fn parse_enum<T: FromStr<Err = String>>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|e| Error::Internal(format!("corrupt enum column: {e}")))
}

pub(crate) type WorkspaceRow = (
    String,         // id
    String,         // project_id
    Option<String>, // path
    String,         // source_type
    String,         // source
    Option<String>, // display_name
    String,         // status
    Option<String>, // commit_sha
    Option<String>, // branches (JSON)
    Option<String>, // error_message
    i64,            // created_at
    i64,            // updated_at
);

pub(crate) const WORKSPACE_COLS: &str = "id, project_id, path, source_type, source, \
     display_name, status, commit_sha, branches, error_message, created_at, updated_at";

pub(crate) fn workspace_from_row(r: WorkspaceRow) -> Result<Workspace> {
    let branches = match r.8 {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| Error::Internal(format!("corrupt branches column: {e}")))?,
        ),
        None => None,
    };
    Ok(Workspace {
        id: parse_uuid(&r.0)?,
        project_id: parse_uuid(&r.1)?,
        path: r.2.map(PathBuf::from),
        source_type: parse_enum(&r.3)?,
        source: r.4,
        display_name: r.5,
        status: parse_enum(&r.6)?,
        commit: r.7,
        branches,
        error_message: r.9,
        created_at: r.10,
        updated_at: r.11,
    })
}

pub(crate) type SessionRow = (
    String,         // id
    String,         // project_id
    String,         // workspace_id
    Option<String>, // agent_id
    String,         // name
    Option<String>, // display_name
    String,         // status
    Option<String>, // workspace_path
    Option<String>, // workspace_commit
    Option<String>, // base_commit
    Option<String>, // applied_commit
    String,         // commit_status
    Option<String>, // commit_error
    Option<String>, // error_message
    i64,            // created_at
    i64,            // updated_at
);

pub(crate) const SESSION_COLS: &str = "id, project_id, workspace_id, agent_id, name, \
     display_name, status, workspace_path, workspace_commit, base_commit, applied_commit, \
     commit_status, commit_error, error_message, created_at, updated_at";

pub(crate) fn session_from_row(r: SessionRow) -> Result<Session> {
    Ok(Session {
        id: parse_uuid(&r.0)?,
        project_id: parse_uuid(&r.1)?,
        workspace_id: parse_uuid(&r.2)?,
        agent_id: r.3.as_deref().map(parse_uuid).transpose()?,
        name: r.4,
        display_name: r.5,
        status: parse_enum(&r.6)?,
        workspace_path: r.7.map(PathBuf::from),
        workspace_commit: r.8,
        base_commit: r.9,
        applied_commit: r.10,
        commit_status: parse_enum(&r.11)?,
        commit_error: r.12,
        error_message: r.13,
        created_at: r.14,
        updated_at: r.15,
    })
}

pub(crate) type AgentRow = (
    String,         // id
    String,         // project_id
    String,         // name
    String,         // agent_type
    Option<String>, // prompt
    Option<String>, // model
    Option<String>, // model_options (JSON)
    i64,            // is_default
    i64,            // created_at
    i64,            // updated_at
);

pub(crate) const AGENT_COLS: &str = "id, project_id, name, agent_type, prompt, model, \
     model_options, is_default, created_at, updated_at";

pub(crate) fn agent_from_row(r: AgentRow) -> Result<Agent> {
    let model_options = match r.6 {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| Error::Internal(format!("corrupt model_options column: {e}")))?,
        ),
        None => None,
    };
    Ok(Agent {
        id: parse_uuid(&r.0)?,
        project_id: parse_uuid(&r.1)?,
        name: r.2,
        agent_type: r.3,
        prompt: r.4,
        model: r.5,
        model_options,
        is_default: r.7 != 0,
        created_at: r.8,
        updated_at: r.9,
    })
}

pub(crate) type JobRow = (
    i64,            // seq
    String,         // id
    String,         // kind
    String,         // fifo_key
    String,         // payload
    String,         // status
    i64,            // attempt
    i64,            // max_attempts
    i64,            // not_before
    Option<i64>,    // lease_expires_at
    Option<String>, // lease_owner
    Option<String>, // last_error
    i64,            // created_at
    i64,            // updated_at
);

pub(crate) const JOB_COLS: &str = "seq, id, kind, fifo_key, payload, status, attempt, \
     max_attempts, not_before, lease_expires_at, lease_owner, last_error, created_at, updated_at";

pub(crate) fn job_from_row(r: JobRow) -> Result<Job> {
    Ok(Job {
        seq: r.0,
        id: parse_uuid(&r.1)?,
        kind: parse_enum::<JobKind>(&r.2)?,
        fifo_key: r.3,
        payload: r.4,
        status: parse_enum::<JobStatus>(&r.5)?,
        attempt: r.6 as i32,
        max_attempts: r.7 as i32,
        not_before: r.8,
        lease_expires_at: r.9,
        lease_owner: r.10,
        last_error: r.11,
        created_at: r.12,
        updated_at: r.13,
    })
}

pub(crate) type EventRow = (
    i64,            // id
    String,         // project_id
    String,         // kind
    String,         // target_id
    Option<String>, // job_kind
    Option<String>, // status
    Option<String>, // message
    i64,            // sequence
    i64,            // ts
);

pub(crate) const EVENT_COLS: &str =
    "id, project_id, kind, target_id, job_kind, status, message, sequence, ts";

pub(crate) fn event_from_row(r: EventRow) -> Result<EventRecord> {
    Ok(EventRecord {
        id: r.0,
        project_id: parse_uuid(&r.1)?,
        kind: parse_enum::<EventKind>(&r.2)?,
        target_id: r.3,
        job_kind: r.4,
        status: r.5,
        message: r.6,
        sequence: r.7,
        ts: r.8,
    })
}
