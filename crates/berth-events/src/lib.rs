//! Event broker + poller: turns database state changes into a live,
//! per-project event stream.
//!
//! The store writes event rows inside the transactions that change state;
//! the [`Poller`] tails those rows after a persisted cursor and hands them
//! to the [`Broker`], which fans out over per-project broadcast channels.
//! SSE handlers and [`wait_for_job_completion`] are both plain subscribers.

mod broker;
mod poller;
mod sse;
mod wait;

pub use broker::Broker;
pub use poller::{Poller, PollerConfig};
pub use sse::{connected_frame, event_frame, event_payload, parse_cursor, ReplayCursor};
pub use wait::{wait_for_job_completion, JobCompletion};
