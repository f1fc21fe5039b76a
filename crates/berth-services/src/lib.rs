//! Service layer: the executors the dispatcher runs, the sandbox
//! gatekeeper, and the reconciliation loops.
//!
//! Handlers call the synchronous helpers here (create, request-commit,
//! delete); everything long-running is enqueued and executed by the
//! dispatcher, serialised per entity by its FIFO key.

mod activity;
mod client;
mod sandbox_service;
mod session;
mod source;
mod workspace;

pub use activity::ActivityTracker;
pub use client::{sidecar_for, SessionClient};
pub use sandbox_service::SandboxService;
pub use session::{
    SessionCommitExecutor, SessionDeleteExecutor, SessionInitExecutor, SessionService,
};
pub use source::StoreWorkspaceSource;
pub use workspace::{WorkspaceInitExecutor, WorkspaceService};

use std::time::Duration;

/// Knobs shared by the session and sandbox services. Assembled by the
/// binary; library code never reads the environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Sandbox idle timeout, forwarded to the provider as a resource limit
    /// and used by the idle-eviction loop.
    pub idle_timeout: Duration,
    /// Grace period for sandbox stop before hard kill.
    pub stop_grace: Duration,
    /// How long the gatekeeper waits for an enqueued init to finish.
    pub wait_timeout: Duration,
    /// Poll cadence while a session is mid-init.
    pub ready_poll_interval: Duration,
    /// How long to poll an intermediate state before forcing an init.
    pub ready_max_wait: Duration,
    /// Slash-command namespace for agent prompts (`/<ns>-commit <sha>`).
    pub prompt_namespace: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            stop_grace: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(60),
            ready_poll_interval: Duration::from_millis(500),
            ready_max_wait: Duration::from_secs(30),
            prompt_namespace: "berth".to_string(),
        }
    }
}
