//! Durable job-queue primitives.
//!
//! The claim is the only cross-row lock in the system: a single
//! `UPDATE … WHERE id = (SELECT oldest eligible …) RETURNING …` statement, so
//! concurrent dispatcher workers can never double-claim a job or hold two
//! jobs with the same `fifo_key`. Under Postgres READ COMMITTED the re-checked
//! `status = 'queued'` predicate turns a lost race into zero rows; SQLite
//! serialises writers outright.

use berth_core::{
    now_millis, Error, EventKind, Job, JobId, JobKind, JobStatus, ProjectId, Result,
};
use sqlx::AnyPool;
use sqlx::Connection;
use uuid::Uuid;

use crate::events::append_tx;
use crate::row::{job_from_row, JobRow, JOB_COLS};

/// Result of [`JobStore::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was written.
    Enqueued(JobId),
    /// A non-terminal job for the same `(fifo_key, kind)` already exists;
    /// the call was a no-op.
    AlreadyPending,
}

#[derive(Clone)]
pub struct JobStore {
    db: AnyPool,
}

impl JobStore {
    pub fn new(db: AnyPool) -> Self {
        Self { db }
    }

    /// Durably enqueue a job, deduplicated per `(fifo_key, kind)` while a
    /// non-terminal twin exists. The `idx_jobs_pending_dedup` partial unique
    /// index backstops the rare concurrent-insert race.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        fifo_key: &str,
        payload: &str,
        max_attempts: i32,
    ) -> Result<EnqueueOutcome> {
        let id = Uuid::new_v4();
        let now = now_millis();

        let result = sqlx::query(
            "INSERT INTO jobs (id, kind, fifo_key, payload, status, attempt, max_attempts,
                 not_before, created_at, updated_at)
             SELECT $1, $2, $3, $4, $5, 0, $6, $7, $8, $9
             WHERE NOT EXISTS (
                 SELECT 1 FROM jobs
                 WHERE fifo_key = $10 AND kind = $11 AND status IN ($12, $13)
             )",
        )
        .bind(id.to_string())
        .bind(kind.to_string())
        .bind(fifo_key)
        .bind(payload)
        .bind(JobStatus::Queued.to_string())
        .bind(max_attempts as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(fifo_key)
        .bind(kind.to_string())
        .bind(JobStatus::Queued.to_string())
        .bind(JobStatus::Leased.to_string())
        .execute(&self.db)
        .await;

        match result {
            Ok(done) if done.rows_affected() > 0 => Ok(EnqueueOutcome::Enqueued(id)),
            Ok(_) => Ok(EnqueueOutcome::AlreadyPending),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(EnqueueOutcome::AlreadyPending)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claim the oldest ready job whose `fifo_key` has no other
    /// leased or queued-ahead job. Returns `None` when nothing is ready.
    pub async fn claim_ready(&self, owner: &str, lease_ms: i64) -> Result<Option<Job>> {
        let now = now_millis();

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET status = $1, lease_owner = $2, lease_expires_at = $3,
                 updated_at = $4
             WHERE id = (
                 SELECT j.id FROM jobs j
                 WHERE j.status = $5 AND j.not_before <= $6
                   AND NOT EXISTS (
                       SELECT 1 FROM jobs x
                       WHERE x.fifo_key = j.fifo_key
                         AND (x.status = $7
                              OR (x.status = $8 AND x.seq < j.seq))
                   )
                 ORDER BY j.seq
                 LIMIT 1
             )
             AND status = $9
             RETURNING {JOB_COLS}"
        ))
        .bind(JobStatus::Leased.to_string())
        .bind(owner)
        .bind(now + lease_ms)
        .bind(now)
        .bind(JobStatus::Queued.to_string())
        .bind(now)
        .bind(JobStatus::Leased.to_string())
        .bind(JobStatus::Queued.to_string())
        .bind(JobStatus::Queued.to_string())
        .fetch_optional(&self.db)
        .await?;

        row.map(job_from_row).transpose()
    }

    /// Extend a held lease. Returns `false` when the job is no longer leased
    /// (stolen or completed elsewhere) — the holder must stop working on it.
    pub async fn heartbeat(&self, id: JobId, extension_ms: i64) -> Result<bool> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = $1, updated_at = $2
             WHERE id = $3 AND status = $4",
        )
        .bind(now + extension_ms)
        .bind(now)
        .bind(id.to_string())
        .bind(JobStatus::Leased.to_string())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finish a leased job with a terminal status and emit the single
    /// `job_completed` event in the same transaction.
    pub async fn complete(
        &self,
        id: JobId,
        final_status: JobStatus,
        error: Option<&str>,
        project_id: ProjectId,
        kind: JobKind,
        target_id: &str,
    ) -> Result<()> {
        debug_assert!(final_status.is_terminal());

        let mut conn = self.db.acquire().await?;
        let mut tx = conn.begin().await?;

        let result = sqlx::query(
            "UPDATE jobs SET status = $1, last_error = $2, lease_owner = NULL,
                 lease_expires_at = NULL, updated_at = $3
             WHERE id = $4 AND status = $5",
        )
        .bind(final_status.to_string())
        .bind(error)
        .bind(now_millis())
        .bind(id.to_string())
        .bind(JobStatus::Leased.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!(
                "job {id} is not leased; refusing to finalise"
            )));
        }

        append_tx(
            &mut tx,
            project_id,
            EventKind::JobCompleted,
            target_id,
            Some(&kind.to_string()),
            Some(&final_status.to_string()),
            error,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Send a failed attempt back to the queue with a delay.
    pub async fn retry(&self, id: JobId, not_before: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = $1, attempt = attempt + 1, not_before = $2,
                 last_error = $3, lease_owner = NULL, lease_expires_at = NULL, updated_at = $4
             WHERE id = $5 AND status = $6",
        )
        .bind(JobStatus::Queued.to_string())
        .bind(not_before)
        .bind(error)
        .bind(now_millis())
        .bind(id.to_string())
        .bind(JobStatus::Leased.to_string())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!("job {id} is not leased")));
        }
        Ok(())
    }

    /// Return a cancelled job to the queue without charging an attempt.
    pub async fn release(&self, id: JobId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = $1, lease_owner = NULL, lease_expires_at = NULL,
                 updated_at = $2
             WHERE id = $3 AND status = $4",
        )
        .bind(JobStatus::Queued.to_string())
        .bind(now_millis())
        .bind(id.to_string())
        .bind(JobStatus::Leased.to_string())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!("job {id} is not leased")));
        }
        Ok(())
    }

    /// Reset leases that expired before `cutoff_ms` back to queued. Returns
    /// how many jobs were stolen.
    pub async fn steal_expired(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = $1, lease_owner = NULL, lease_expires_at = NULL,
                 updated_at = $2
             WHERE status = $3 AND lease_expires_at < $4",
        )
        .bind(JobStatus::Queued.to_string())
        .bind(now_millis())
        .bind(JobStatus::Leased.to_string())
        .bind(cutoff_ms)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLS} FROM jobs WHERE id = $1"))
                .bind(id.to_string())
                .fetch_optional(&self.db)
                .await?;

        row.map(job_from_row).transpose()
    }
}
