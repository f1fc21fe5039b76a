use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthInfo {
    pub healthy: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

// ── Chat ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl PostChatRequest {
    /// A single user-text prompt, the shape the commit pipeline sends.
    pub fn user_prompt(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage {
                role: "user".into(),
                content: serde_json::Value::String(text.into()),
            }],
            model: None,
            reasoning: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStatus {
    pub is_running: bool,
    #[serde(default)]
    pub completion_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub id: String,
    pub answer: String,
}

// ── Commits ──

/// Successful `GET /commits` body. `no_commits` from the sidecar is folded
/// into `commit_count == 0` so callers branch on one shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitsResponse {
    /// Patches in mbox format, ready for `git am`.
    #[serde(default)]
    pub patches: String,
    pub commit_count: u64,
}

/// Error body the sidecar returns with 4xx statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct SidecarErrorBody {
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
}

// ── Files ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffFormat {
    /// Full unified diff.
    Full,
    /// Changed-file list only.
    Files,
}

// ── Services & hooks ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookStatus {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_status_uses_camel_case_wire_names() {
        let status: ChatStatus = serde_json::from_str(
            r#"{"isRunning": true, "completionId": "c1", "startedAt": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(status.is_running);
        assert_eq!(status.completion_id.as_deref(), Some("c1"));
        assert!(status.error.is_none());
    }

    #[test]
    fn chat_status_tolerates_minimal_body() {
        let status: ChatStatus = serde_json::from_str(r#"{"isRunning": false}"#).unwrap();
        assert!(!status.is_running);
        assert!(status.completion_id.is_none());
    }

    #[test]
    fn commits_response_wire_shape() {
        let response: CommitsResponse = serde_json::from_str(
            r#"{"patches": "From abc123...", "commitCount": 2}"#,
        )
        .unwrap();
        assert_eq!(response.commit_count, 2);
        assert!(response.patches.starts_with("From "));

        // patches may be omitted entirely on empty responses.
        let empty: CommitsResponse = serde_json::from_str(r#"{"commitCount": 0}"#).unwrap();
        assert_eq!(empty.commit_count, 0);
        assert!(empty.patches.is_empty());
    }

    #[test]
    fn user_prompt_builds_a_single_user_message() {
        let request = PostChatRequest::user_prompt("/berth-commit abc123");
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, "user");
        assert_eq!(
            request.messages[0].content,
            serde_json::Value::String("/berth-commit abc123".into())
        );
        // Optional fields stay off the wire.
        let encoded = serde_json::to_string(&request).unwrap();
        assert!(!encoded.contains("model"));
        assert!(!encoded.contains("reasoning"));
    }

    #[test]
    fn sidecar_error_body_parses_with_and_without_message() {
        let with: SidecarErrorBody =
            serde_json::from_str(r#"{"error": "parent_mismatch", "message": "expected abc"}"#)
                .unwrap();
        assert_eq!(with.error, "parent_mismatch");
        assert_eq!(with.message.as_deref(), Some("expected abc"));

        let without: SidecarErrorBody = serde_json::from_str(r#"{"error": "no_commits"}"#).unwrap();
        assert!(without.message.is_none());
    }
}
