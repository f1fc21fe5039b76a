use async_trait::async_trait;
use berth_core::{Error, Job, JobKind, Result};
use serde::de::DeserializeOwned;

/// What a running executor sees of its job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Job,
    /// Which attempt this is, zero-based (mirrors `job.attempt`).
    pub attempt: i32,
}

/// Deserialize a job payload. A payload that doesn't parse is a permanent
/// defect, not a retry candidate.
pub fn parse_payload<T: DeserializeOwned>(job: &Job) -> Result<T> {
    serde_json::from_str(&job.payload)
        .map_err(|e| Error::Fatal(format!("malformed {} payload: {e}", job.kind)))
}

/// One registered handler for a job kind. Executors are invoked by the
/// dispatcher only — handlers never run this work synchronously.
///
/// Returned errors are classified via [`Error::class`]: transient errors
/// retry with backoff up to `max_attempts`, everything else fails the job.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    fn kind(&self) -> JobKind;

    async fn execute(&self, ctx: JobContext) -> Result<()>;
}
