use std::sync::Arc;

use berth_core::{Error, Result, SessionId};
use berth_sandbox::{SandboxProvider, SandboxStatus};
use berth_sidecar::{
    Answer, ChatMessage, ChatStatus, ChatStream, CommitsResponse, DiffFormat, FileEntry,
    HealthInfo, HookStatus, ModelDescriptor, PostChatRequest, Question, ServiceInfo,
    SidecarClient, UserInfo,
};

use crate::activity::ActivityTracker;

/// Build a raw sidecar client for a session's sandbox.
///
/// Requires the sandbox to be running with a mapped agent port; callers
/// that need a *guaranteed* running sandbox go through
/// [`SandboxService::get_client`](crate::SandboxService::get_client).
pub async fn sidecar_for(
    provider: &dyn SandboxProvider,
    session_id: SessionId,
) -> Result<SidecarClient> {
    let info = provider.get(session_id).await?;
    if info.status != SandboxStatus::Running {
        return Err(Error::Transient(format!(
            "sandbox for session {session_id} is {} (not running)",
            info.status
        )));
    }
    let port = info.agent_port.ok_or_else(|| {
        Error::Sandbox(format!("sandbox for session {session_id} has no agent port"))
    })?;
    let secret = provider.get_secret(session_id).await?;

    SidecarClient::new(format!("http://127.0.0.1:{port}"), secret)
}

/// The per-session client the gatekeeper hands out: a sidecar client that
/// records activity on every successful call. Create one per call site —
/// it is cheap, and sidecar addresses change whenever a sandbox is
/// recreated.
pub struct SessionClient {
    session_id: SessionId,
    inner: SidecarClient,
    tracker: Arc<ActivityTracker>,
}

impl SessionClient {
    pub fn new(
        session_id: SessionId,
        inner: SidecarClient,
        tracker: Arc<ActivityTracker>,
    ) -> Self {
        Self {
            session_id,
            inner,
            tracker,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_ok() {
            self.tracker.touch(self.session_id);
        }
        result
    }

    pub async fn get_health(&self) -> Result<HealthInfo> {
        let r = self.inner.get_health().await;
        self.track(r)
    }

    pub async fn get_user(&self) -> Result<UserInfo> {
        let r = self.inner.get_user().await;
        self.track(r)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        let r = self.inner.list_models().await;
        self.track(r)
    }

    pub async fn get_messages(&self) -> Result<Vec<ChatMessage>> {
        let r = self.inner.get_messages().await;
        self.track(r)
    }

    pub async fn post_chat(&self, request: &PostChatRequest) -> Result<()> {
        let r = self.inner.post_chat(request).await;
        self.track(r)
    }

    pub async fn stream_chat(&self) -> Result<ChatStream> {
        let r = self.inner.stream_chat().await;
        self.track(r)
    }

    pub async fn clear_chat(&self) -> Result<()> {
        let r = self.inner.clear_chat().await;
        self.track(r)
    }

    pub async fn get_chat_status(&self) -> Result<ChatStatus> {
        let r = self.inner.get_chat_status().await;
        self.track(r)
    }

    pub async fn get_question(&self) -> Result<Option<Question>> {
        let r = self.inner.get_question().await;
        self.track(r)
    }

    pub async fn answer_question(&self, answer: &Answer) -> Result<()> {
        let r = self.inner.answer_question(answer).await;
        self.track(r)
    }

    pub async fn get_commits(&self, parent: &str) -> Result<CommitsResponse> {
        let r = self.inner.get_commits(parent).await;
        self.track(r)
    }

    pub async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>> {
        let r = self.inner.list_files(path).await;
        self.track(r)
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let r = self.inner.read_file(path).await;
        self.track(r)
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let r = self.inner.write_file(path, content).await;
        self.track(r)
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let r = self.inner.delete_file(path).await;
        self.track(r)
    }

    pub async fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let r = self.inner.rename_file(from, to).await;
        self.track(r)
    }

    pub async fn get_diff(&self, path: Option<&str>, format: DiffFormat) -> Result<String> {
        let r = self.inner.get_diff(path, format).await;
        self.track(r)
    }

    pub async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        let r = self.inner.list_services().await;
        self.track(r)
    }

    pub async fn start_service(&self, id: &str) -> Result<()> {
        let r = self.inner.start_service(id).await;
        self.track(r)
    }

    pub async fn stop_service(&self, id: &str) -> Result<()> {
        let r = self.inner.stop_service(id).await;
        self.track(r)
    }

    pub async fn stream_service_output(&self, id: &str) -> Result<ChatStream> {
        let r = self.inner.stream_service_output(id).await;
        self.track(r)
    }

    pub async fn get_hooks_status(&self) -> Result<Vec<HookStatus>> {
        let r = self.inner.get_hooks_status().await;
        self.track(r)
    }

    pub async fn get_hook_output(&self, id: &str) -> Result<String> {
        let r = self.inner.get_hook_output(id).await;
        self.track(r)
    }

    pub async fn rerun_hook(&self, id: &str) -> Result<()> {
        let r = self.inner.rerun_hook(id).await;
        self.track(r)
    }
}
