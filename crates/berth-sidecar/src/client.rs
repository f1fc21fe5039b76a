use std::time::Duration;

use berth_core::{Error, Result};
use futures_util::StreamExt;
use reqwest::{Response, StatusCode};
use serde_json::json;
use tracing::debug;

use crate::sse::{SseEvent, SseParser};
use crate::types::*;

/// Client for one sandbox's sidecar, bound to its mapped port and shared
/// secret. Construct per call site via the sandbox service — sidecar
/// addresses change whenever a sandbox is recreated.
#[derive(Clone)]
pub struct SidecarClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

impl SidecarClient {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Sidecar(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(&self.secret)
    }

    /// Map HTTP-level failures onto the error taxonomy. 4xx bodies keep
    /// their message so callers can surface them.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED => Err(Error::Unauthorized),
            StatusCode::FORBIDDEN => Err(Error::Forbidden),
            StatusCode::NOT_FOUND => Err(Error::NotFound(body)),
            s if s.is_client_error() => Err(Error::Sidecar(format!("{s}: {body}"))),
            s => Err(Error::Transient(format!("sidecar returned {s}: {body}"))),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Sidecar(format!("bad sidecar response for {path}: {e}")))
    }

    // ── Health & identity ──

    pub async fn get_health(&self) -> Result<HealthInfo> {
        self.get_json("/health").await
    }

    pub async fn get_user(&self) -> Result<UserInfo> {
        self.get_json("/user").await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.get_json("/models").await
    }

    // ── Chat ──

    pub async fn get_messages(&self) -> Result<Vec<ChatMessage>> {
        self.get_json("/chat").await
    }

    /// Start a completion. The sidecar answers 202; the stream is read
    /// separately via [`stream_chat`](Self::stream_chat).
    pub async fn post_chat(&self, request: &PostChatRequest) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/chat")
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    /// Attach to the ongoing completion stream.
    pub async fn stream_chat(&self) -> Result<ChatStream> {
        let response = self
            .request(reqwest::Method::GET, "/chat")
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        let response = Self::check(response).await?;
        Ok(ChatStream::new(response))
    }

    pub async fn clear_chat(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, "/chat")
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn get_chat_status(&self) -> Result<ChatStatus> {
        self.get_json("/chat/status").await
    }

    pub async fn get_question(&self) -> Result<Option<Question>> {
        self.get_json("/chat/question").await
    }

    pub async fn answer_question(&self, answer: &Answer) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/chat/answer")
            .json(answer)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    // ── Commits ──

    /// Fetch the agent's staged commits as an mbox, parented at `parent`.
    ///
    /// `no_commits` is folded into a zero-count success; `parent_mismatch`
    /// surfaces as [`Error::ParentMismatch`] for the caller to re-prompt;
    /// `invalid_parent` and `not_git_repo` are fatal.
    pub async fn get_commits(&self, parent: &str) -> Result<CommitsResponse> {
        let path = format!("/commits?parent={parent}");
        let response = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| Error::Sidecar(format!("bad commits response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: SidecarErrorBody = serde_json::from_str(&body)
            .unwrap_or(SidecarErrorBody {
                error: format!("http {status}"),
                message: Some(body.clone()),
            });
        let detail = parsed.message.unwrap_or_default();

        match parsed.error.as_str() {
            "no_commits" => Ok(CommitsResponse {
                patches: String::new(),
                commit_count: 0,
            }),
            "parent_mismatch" => Err(Error::ParentMismatch(detail)),
            "invalid_parent" => Err(Error::Fatal(format!("invalid parent commit: {detail}"))),
            "not_git_repo" => Err(Error::Fatal(format!(
                "sandbox workspace is not a git repository: {detail}"
            ))),
            other => Err(Error::Sidecar(format!("commits failed: {other}: {detail}"))),
        }
    }

    // ── Files ──

    pub async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>> {
        self.get_json(&format!("/files?path={path}")).await
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let response = self
            .request(reqwest::Method::GET, &format!("/files/read?path={path}"))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response)
            .await?
            .text()
            .await
            .map_err(|e| Error::Sidecar(format!("bad file response: {e}")))
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/files/write")
            .json(&json!({ "path": path, "content": content }))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/files/delete")
            .json(&json!({ "path": path }))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/files/rename")
            .json(&json!({ "from": from, "to": to }))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    // ── Diff ──

    /// Full diff, file list, or a single file's diff.
    pub async fn get_diff(&self, path: Option<&str>, format: DiffFormat) -> Result<String> {
        let query = match (path, format) {
            (Some(p), _) => format!("/diff?path={p}"),
            (None, DiffFormat::Files) => "/diff?format=files".to_string(),
            (None, DiffFormat::Full) => "/diff".to_string(),
        };
        let response = self
            .request(reqwest::Method::GET, &query)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response)
            .await?
            .text()
            .await
            .map_err(|e| Error::Sidecar(format!("bad diff response: {e}")))
    }

    // ── Services & hooks ──

    pub async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        self.get_json("/services").await
    }

    pub async fn start_service(&self, id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/services/{id}/start"))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn stop_service(&self, id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/services/{id}/stop"))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn stream_service_output(&self, id: &str) -> Result<ChatStream> {
        let response = self
            .request(reqwest::Method::GET, &format!("/services/{id}/output"))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        let response = Self::check(response).await?;
        Ok(ChatStream::new(response))
    }

    pub async fn get_hooks_status(&self) -> Result<Vec<HookStatus>> {
        self.get_json("/hooks/status").await
    }

    pub async fn get_hook_output(&self, id: &str) -> Result<String> {
        let response = self
            .request(reqwest::Method::GET, &format!("/hooks/{id}/output"))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response)
            .await?
            .text()
            .await
            .map_err(|e| Error::Sidecar(format!("bad hook output: {e}")))
    }

    pub async fn rerun_hook(&self, id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/hooks/{id}/rerun"))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("sidecar unreachable: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }
}

/// A live SSE stream from the sidecar. Dropping it closes the connection,
/// which is how request cancellation reaches the sidecar.
pub struct ChatStream {
    body: std::pin::Pin<
        Box<dyn futures_util::Stream<Item = reqwest::Result<Vec<u8>>> + Send>,
    >,
    parser: SseParser,
    pending: std::collections::VecDeque<SseEvent>,
}

impl ChatStream {
    fn new(response: Response) -> Self {
        Self {
            body: Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec()))),
            parser: SseParser::new(),
            pending: std::collections::VecDeque::new(),
        }
    }

    /// Next frame, or `None` when the stream ends (the completion is done).
    pub async fn next_event(&mut self) -> Result<Option<SseEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            match self.body.next().await {
                Some(Ok(chunk)) => {
                    self.pending.extend(self.parser.feed(&chunk));
                }
                Some(Err(e)) => {
                    return Err(Error::Transient(format!("sidecar stream broke: {e}")));
                }
                None => return Ok(None),
            }
        }
    }

    /// Drain the stream to completion. The commit pipeline uses this to
    /// wait for a prompted completion to finish; an `error` frame fails
    /// the wait.
    pub async fn drain(&mut self) -> Result<()> {
        while let Some(event) = self.next_event().await? {
            if event.event == "error" {
                return Err(Error::Sidecar(format!("agent stream error: {}", event.data)));
            }
            debug!(event = %event.event, "chat stream frame");
        }
        Ok(())
    }
}
