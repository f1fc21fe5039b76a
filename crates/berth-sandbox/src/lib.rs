//! Sandbox provider: abstract CRUD over container-like compute units.
//!
//! A sandbox is keyed by its session id and carries the agent image, a host
//! port mapping for the in-sandbox agent (container port 3002), a shared
//! secret authenticating the sidecar API, labels, and resource limits.
//!
//! Two backends: [`MockSandboxProvider`] for tests (scriptable failures,
//! call recording) and [`DockerSandboxProvider`] shelling out to the docker
//! CLI the same way the git provider shells out to git.

mod docker;
mod mock;
mod types;

pub use docker::DockerSandboxProvider;
pub use mock::MockSandboxProvider;
pub use types::{
    AttachOpts, CreateOpts, ExecOutput, Resources, SandboxInfo, SandboxStatus, VolumePolicy,
    AGENT_PORT,
};

use async_trait::async_trait;
use berth_core::{Result, SessionId};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Bidirectional byte stream into a sandbox (port forwarding, SFTP
/// subsystem). Thin adapters sit on top; the provider only hands out the
/// pipe.
pub trait SandboxStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SandboxStream for T {}

/// An attached interactive terminal.
#[async_trait]
pub trait SandboxPty: Send {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    async fn write(&mut self, data: &[u8]) -> Result<()>;
    async fn resize(&mut self, rows: u16, cols: u16) -> Result<()>;
    /// Wait for the attached process to exit; returns its exit code.
    async fn wait(&mut self) -> Result<i32>;
    async fn close(&mut self) -> Result<()>;
}

/// Abstract CRUD over sandboxes.
///
/// Failure policy: `remove` of a missing sandbox returns `NotFound`, which
/// idempotent callers swallow; every other error surfaces verbatim.
#[async_trait]
pub trait SandboxProvider: Send + Sync + 'static {
    /// Create (but do not start) a sandbox. Fails with a conflict when a
    /// sandbox already exists under this session id.
    async fn create(&self, session_id: SessionId, opts: CreateOpts) -> Result<()>;

    /// `created|stopped → running`. On failure the sandbox is left `failed`
    /// and the error is returned; volumes are preserved.
    async fn start(&self, session_id: SessionId) -> Result<()>;

    /// Graceful shutdown, hard-kill after `grace`. Idempotent once stopped.
    async fn stop(&self, session_id: SessionId, grace: Duration) -> Result<()>;

    /// Remove the sandbox. `NotFound` when absent. The volume policy is the
    /// caller's choice: preserve for image upgrades and orphan cleanup,
    /// delete only on explicit session deletion.
    async fn remove(&self, session_id: SessionId, volumes: VolumePolicy) -> Result<()>;

    async fn get(&self, session_id: SessionId) -> Result<SandboxInfo>;

    /// All sandboxes known to this process.
    async fn list(&self) -> Result<Vec<SandboxInfo>>;

    /// One-shot non-interactive exec.
    async fn exec(&self, session_id: SessionId, cmd: &[String]) -> Result<ExecOutput>;

    /// Bidirectional stream exec (socat port forwarding, SFTP subsystem).
    async fn exec_stream(
        &self,
        session_id: SessionId,
        cmd: &[String],
    ) -> Result<Box<dyn SandboxStream>>;

    /// Attach an interactive terminal. An empty `user` means the container
    /// default.
    async fn attach(&self, session_id: SessionId, opts: AttachOpts) -> Result<Box<dyn SandboxPty>>;

    /// Raw shared secret for sidecar calls.
    async fn get_secret(&self, session_id: SessionId) -> Result<String>;

    /// The globally configured expected image, used by reconciliation.
    fn image(&self) -> &str;
}
