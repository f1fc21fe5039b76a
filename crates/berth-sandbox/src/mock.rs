//! In-memory sandbox backend for tests.
//!
//! Keeps a DashMap registry, assigns deterministic agent ports, records
//! every call, and exposes knobs to script failures and pre-existing
//! sandboxes (orphans, outdated images) for reconciliation tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{Error, Result, SessionId};
use dashmap::DashMap;

use crate::types::{
    AttachOpts, CreateOpts, ExecOutput, SandboxInfo, SandboxStatus, VolumePolicy,
};
use crate::{SandboxProvider, SandboxPty, SandboxStream};

struct MockSandbox {
    status: SandboxStatus,
    image: String,
    secret: String,
    agent_port: Option<u16>,
    labels: HashMap<String, String>,
    error: Option<String>,
}

pub struct MockSandboxProvider {
    expected_image: String,
    sandboxes: DashMap<SessionId, MockSandbox>,
    next_port: AtomicU16,
    fail_next_create: AtomicBool,
    fail_next_start: AtomicBool,
    calls: Mutex<Vec<String>>,
    removals: Mutex<Vec<(SessionId, VolumePolicy)>>,
    exec_script: Mutex<Vec<ExecOutput>>,
}

impl MockSandboxProvider {
    pub fn new(expected_image: impl Into<String>) -> Self {
        Self {
            expected_image: expected_image.into(),
            sandboxes: DashMap::new(),
            next_port: AtomicU16::new(42000),
            fail_next_create: AtomicBool::new(false),
            fail_next_start: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            removals: Mutex::new(Vec::new()),
            exec_script: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    /// Calls made so far, e.g. `"create 7f…"`, `"start 7f…"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Removals with the volume policy the caller chose.
    pub fn removals(&self) -> Vec<(SessionId, VolumePolicy)> {
        self.removals.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    /// Queue a scripted response for the next `exec` call.
    pub fn push_exec_output(&self, output: ExecOutput) {
        self.exec_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(output);
    }

    /// Register a sandbox as if it pre-existed this process: an orphan or a
    /// survivor of a previous run with a (possibly outdated) image.
    pub fn insert_existing(
        &self,
        session_id: SessionId,
        image: &str,
        status: SandboxStatus,
        secret: &str,
    ) {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        self.sandboxes.insert(
            session_id,
            MockSandbox {
                status,
                image: image.to_string(),
                secret: secret.to_string(),
                agent_port: matches!(status, SandboxStatus::Running).then_some(port),
                labels: HashMap::new(),
                error: None,
            },
        );
    }

    /// Force a status, simulating out-of-band container death.
    pub fn set_status(&self, session_id: SessionId, status: SandboxStatus) {
        if let Some(mut sandbox) = self.sandboxes.get_mut(&session_id) {
            sandbox.status = status;
        }
    }

    /// Point a sandbox's agent port somewhere specific (tests aim it at a
    /// scripted sidecar server).
    pub fn set_agent_port(&self, session_id: SessionId, port: u16) {
        if let Some(mut sandbox) = self.sandboxes.get_mut(&session_id) {
            sandbox.agent_port = Some(port);
        }
    }

    fn info(&self, session_id: SessionId, sandbox: &MockSandbox) -> SandboxInfo {
        SandboxInfo {
            session_id,
            status: sandbox.status,
            image: sandbox.image.clone(),
            agent_port: sandbox.agent_port,
            labels: sandbox.labels.clone(),
            error: sandbox.error.clone(),
        }
    }
}

#[async_trait]
impl SandboxProvider for MockSandboxProvider {
    async fn create(&self, session_id: SessionId, opts: CreateOpts) -> Result<()> {
        self.record(format!("create {session_id}"));

        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(Error::Sandbox("scripted create failure".into()));
        }
        if self.sandboxes.contains_key(&session_id) {
            return Err(Error::Conflict(format!(
                "sandbox already exists for session {session_id}"
            )));
        }

        self.sandboxes.insert(
            session_id,
            MockSandbox {
                status: SandboxStatus::Created,
                image: self.expected_image.clone(),
                secret: opts.shared_secret,
                agent_port: None,
                labels: opts.labels,
                error: None,
            },
        );
        Ok(())
    }

    async fn start(&self, session_id: SessionId) -> Result<()> {
        self.record(format!("start {session_id}"));

        let mut sandbox = self
            .sandboxes
            .get_mut(&session_id)
            .ok_or_else(|| Error::NotFound(format!("sandbox {session_id}")))?;

        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            sandbox.status = SandboxStatus::Failed;
            sandbox.error = Some("scripted start failure".into());
            return Err(Error::Sandbox("scripted start failure".into()));
        }

        match sandbox.status {
            SandboxStatus::Created | SandboxStatus::Stopped => {
                sandbox.status = SandboxStatus::Running;
                if sandbox.agent_port.is_none() {
                    sandbox.agent_port =
                        Some(self.next_port.fetch_add(1, Ordering::SeqCst));
                }
                Ok(())
            }
            SandboxStatus::Running => Ok(()),
            SandboxStatus::Failed => Err(Error::Sandbox(format!(
                "sandbox {session_id} is failed; remove and recreate"
            ))),
        }
    }

    async fn stop(&self, session_id: SessionId, _grace: Duration) -> Result<()> {
        self.record(format!("stop {session_id}"));

        let mut sandbox = self
            .sandboxes
            .get_mut(&session_id)
            .ok_or_else(|| Error::NotFound(format!("sandbox {session_id}")))?;
        sandbox.status = SandboxStatus::Stopped;
        Ok(())
    }

    async fn remove(&self, session_id: SessionId, volumes: VolumePolicy) -> Result<()> {
        self.record(format!("remove {session_id}"));

        if self.sandboxes.remove(&session_id).is_none() {
            return Err(Error::NotFound(format!("sandbox {session_id}")));
        }
        self.removals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((session_id, volumes));
        Ok(())
    }

    async fn get(&self, session_id: SessionId) -> Result<SandboxInfo> {
        let sandbox = self
            .sandboxes
            .get(&session_id)
            .ok_or_else(|| Error::NotFound(format!("sandbox {session_id}")))?;
        Ok(self.info(session_id, &sandbox))
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>> {
        Ok(self
            .sandboxes
            .iter()
            .map(|entry| self.info(*entry.key(), entry.value()))
            .collect())
    }

    async fn exec(&self, session_id: SessionId, cmd: &[String]) -> Result<ExecOutput> {
        self.record(format!("exec {session_id} {}", cmd.join(" ")));

        if !self.sandboxes.contains_key(&session_id) {
            return Err(Error::NotFound(format!("sandbox {session_id}")));
        }

        let scripted = self
            .exec_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        Ok(scripted.unwrap_or(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }

    async fn exec_stream(
        &self,
        session_id: SessionId,
        _cmd: &[String],
    ) -> Result<Box<dyn SandboxStream>> {
        if !self.sandboxes.contains_key(&session_id) {
            return Err(Error::NotFound(format!("sandbox {session_id}")));
        }

        // Loopback stream: everything written comes back out.
        let (client, server) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            let (mut rx, mut tx) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut rx, &mut tx).await;
        });
        Ok(Box::new(client))
    }

    async fn attach(
        &self,
        session_id: SessionId,
        _opts: AttachOpts,
    ) -> Result<Box<dyn SandboxPty>> {
        if !self.sandboxes.contains_key(&session_id) {
            return Err(Error::NotFound(format!("sandbox {session_id}")));
        }
        Ok(Box::new(MockPty::default()))
    }

    async fn get_secret(&self, session_id: SessionId) -> Result<String> {
        let sandbox = self
            .sandboxes
            .get(&session_id)
            .ok_or_else(|| Error::NotFound(format!("sandbox {session_id}")))?;
        Ok(sandbox.secret.clone())
    }

    fn image(&self) -> &str {
        &self.expected_image
    }
}

/// Echo terminal: reads return whatever was last written.
#[derive(Default)]
struct MockPty {
    buffer: Vec<u8>,
    closed: bool,
}

#[async_trait]
impl SandboxPty for MockPty {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.buffer.len().min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Sandbox("pty is closed".into()));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn resize(&mut self, _rows: u16, _cols: u16) -> Result<()> {
        Ok(())
    }

    async fn wait(&mut self) -> Result<i32> {
        Ok(0)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
