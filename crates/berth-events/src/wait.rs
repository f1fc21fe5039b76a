use std::time::Duration;

use berth_core::{Error, EventKind, EventRecord, JobKind, JobStatus, Result};
use tokio::sync::broadcast;
use tracing::warn;

/// Outcome of a finished job, as carried by its `job_completed` event.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub error: Option<String>,
}

/// Wait on an already-open subscription for the next `job_completed` event
/// matching `(kind, target_id)`.
///
/// Subscribe **before** enqueueing so the completion of a fast job cannot
/// slip past. A lagged receiver logs and keeps reading — if the matching
/// event was among the dropped ones the call ends in a timeout, and the
/// caller re-reads entity state from the store.
pub async fn wait_for_job_completion(
    rx: &mut broadcast::Receiver<EventRecord>,
    kind: JobKind,
    target_id: &str,
    timeout: Duration,
) -> Result<JobCompletion> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::Transient(format!(
                "timed out waiting for {kind} completion on {target_id}"
            )));
        }

        let event = match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                warn!(lagged = n, "job completion subscriber lagged");
                continue;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                return Err(Error::Internal("event broker closed".into()));
            }
            Err(_) => {
                return Err(Error::Transient(format!(
                    "timed out waiting for {kind} completion on {target_id}"
                )));
            }
        };

        let kind_name = kind.to_string();
        if event.kind != EventKind::JobCompleted
            || event.job_kind.as_deref() != Some(kind_name.as_str())
            || event.target_id != target_id
        {
            continue;
        }

        let status: JobStatus = event
            .status
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(|e| Error::Internal(format!("bad job_completed status: {e}")))?;

        return Ok(JobCompletion {
            status,
            error: event.message,
        });
    }
}
