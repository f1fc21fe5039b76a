//! Append-only event rows and the poller cursor.
//!
//! Events are written inside the same transaction as the state change they
//! describe (see `sessions`/`workspaces`/`jobs`), with a gap-free per-project
//! `sequence` drawn from the `event_sequences` counter table. The global row
//! `id` orders rows for the poller.

use berth_core::{now_millis, EventKind, EventRecord, ProjectId, Result};
use sqlx::{AnyConnection, AnyPool};

use crate::row::{event_from_row, EventRow, EVENT_COLS};

/// Allocate the next per-project sequence and insert one event row.
///
/// Must run inside the transaction that performs the state change so the
/// event and the change commit or roll back together.
pub(crate) async fn append_tx(
    conn: &mut AnyConnection,
    project_id: ProjectId,
    kind: EventKind,
    target_id: &str,
    job_kind: Option<&str>,
    status: Option<&str>,
    message: Option<&str>,
) -> Result<()> {
    let (sequence,): (i64,) = sqlx::query_as(
        "INSERT INTO event_sequences (project_id, next_seq) VALUES ($1, 1)
         ON CONFLICT (project_id) DO UPDATE SET next_seq = event_sequences.next_seq + 1
         RETURNING next_seq",
    )
    .bind(project_id.to_string())
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        "INSERT INTO events (project_id, kind, target_id, job_kind, status, message,
             sequence, ts)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(project_id.to_string())
    .bind(kind.to_string())
    .bind(target_id)
    .bind(job_kind)
    .bind(status)
    .bind(message)
    .bind(sequence)
    .bind(now_millis())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct EventStore {
    db: AnyPool,
}

impl EventStore {
    pub fn new(db: AnyPool) -> Self {
        Self { db }
    }

    /// Rows after the global cursor, oldest first. The poller's tail query.
    pub async fn list_after(&self, after_id: i64, limit: i64) -> Result<Vec<EventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLS} FROM events WHERE id > $1 ORDER BY id LIMIT $2"
        ))
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }

    /// Replay rows for one project after a given event id (SSE `after=`).
    pub async fn list_project_after(
        &self,
        project_id: ProjectId,
        after_id: i64,
    ) -> Result<Vec<EventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLS} FROM events
             WHERE project_id = $1 AND id > $2 ORDER BY sequence"
        ))
        .bind(project_id.to_string())
        .bind(after_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }

    /// Replay rows for one project at or after a wall-clock time
    /// (SSE `since=`).
    pub async fn list_project_since(
        &self,
        project_id: ProjectId,
        since_ts: i64,
    ) -> Result<Vec<EventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLS} FROM events
             WHERE project_id = $1 AND ts >= $2 ORDER BY sequence"
        ))
        .bind(project_id.to_string())
        .bind(since_ts)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }

    /// Last event id the poller has forwarded, 0 if never set.
    pub async fn poller_cursor(&self) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_event_id FROM poller_cursor WHERE id = 0")
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|(v,)| v).unwrap_or(0))
    }

    /// Persist the poller cursor so restarts replay only unseen rows.
    pub async fn set_poller_cursor(&self, last_event_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO poller_cursor (id, last_event_id) VALUES (0, $1)
             ON CONFLICT (id) DO UPDATE SET last_event_id = $1",
        )
        .bind(last_event_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}
