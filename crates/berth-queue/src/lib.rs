//! Durable job dispatcher.
//!
//! The only component that executes long-running work on sessions and
//! workspaces. Handlers enqueue and wait on the event broker; workers here
//! claim jobs through the store's atomic FIFO-key-exclusive statement, hold
//! a heartbeat while the executor runs, and translate executor errors into
//! retry-or-fail using the error classification, never message text.

mod backoff;
mod dispatcher;
mod executor;

pub use backoff::retry_backoff;
pub use dispatcher::{Dispatcher, DispatcherConfig, QueueClient};
pub use executor::{parse_payload, JobContext, JobExecutor};
