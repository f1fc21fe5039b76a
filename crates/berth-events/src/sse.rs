//! SSE frame shaping and reconnect-cursor parsing.
//!
//! The HTTP route is a thin adapter: it parses the cursor from query
//! params, replays stored rows, then forwards the live tail. Everything
//! about the wire shape lives here so it can be tested without a server.

use berth_core::{EventKind, EventRecord, ProjectId};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

/// Where a reconnecting subscriber wants replay to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCursor {
    /// `since=<rfc3339>` — rows at or after this unix-millis instant.
    SinceMillis(i64),
    /// `after=<eventID>` — rows with a greater event id.
    AfterId(i64),
    /// No (or malformed) cursor: live from now.
    Live,
}

/// Parse `since`/`after` query params. Malformed or missing values mean
/// "live from now" — reconnect cursors are best-effort, never an error.
pub fn parse_cursor(since: Option<&str>, after: Option<&str>) -> ReplayCursor {
    if let Some(raw) = after {
        if let Ok(id) = raw.parse::<i64>() {
            return ReplayCursor::AfterId(id);
        }
        return ReplayCursor::Live;
    }
    if let Some(raw) = since {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return ReplayCursor::SinceMillis(ts.timestamp_millis());
        }
        return ReplayCursor::Live;
    }
    ReplayCursor::Live
}

/// The initial frame every subscriber receives.
pub fn connected_frame(project_id: ProjectId) -> String {
    let data = json!({ "projectId": project_id.to_string() });
    format!("event: connected\ndata: {data}\n\n")
}

/// The `(event name, json payload)` pair for one event row. HTTP adapters
/// feed this into their own SSE writer; [`event_frame`] renders the raw
/// wire form.
pub fn event_payload(event: &EventRecord) -> (String, serde_json::Value) {
    let timestamp = DateTime::<Utc>::from_timestamp_millis(event.ts)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true);

    let data = match event.kind {
        EventKind::SessionUpdated => json!({
            "id": event.id.to_string(),
            "timestamp": timestamp,
            "data": {
                "sessionId": event.target_id,
                "status": event.status,
                "errorMessage": event.message,
            },
        }),
        EventKind::WorkspaceUpdated => json!({
            "id": event.id.to_string(),
            "timestamp": timestamp,
            "data": {
                "workspaceId": event.target_id,
                "status": event.status,
                "errorMessage": event.message,
            },
        }),
        EventKind::JobCompleted => json!({
            "id": event.id.to_string(),
            "timestamp": timestamp,
            "data": {
                "kind": event.job_kind,
                "targetId": event.target_id,
                "status": event.status,
                "error": event.message,
            },
        }),
    };

    (event.kind.to_string(), data)
}

/// Render one event row as a raw SSE frame.
pub fn event_frame(event: &EventRecord) -> String {
    let (name, data) = event_payload(event);
    format!("event: {name}\ndata: {data}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn cursor_prefers_after_over_since() {
        assert_eq!(
            parse_cursor(Some("2026-01-01T00:00:00Z"), Some("17")),
            ReplayCursor::AfterId(17)
        );
    }

    #[test]
    fn malformed_cursors_fall_back_to_live() {
        assert_eq!(parse_cursor(Some("yesterday-ish"), None), ReplayCursor::Live);
        assert_eq!(parse_cursor(None, Some("not-a-number")), ReplayCursor::Live);
        assert_eq!(parse_cursor(None, None), ReplayCursor::Live);
    }

    #[test]
    fn since_parses_rfc3339_to_millis() {
        let cursor = parse_cursor(Some("1970-01-01T00:00:01Z"), None);
        assert_eq!(cursor, ReplayCursor::SinceMillis(1000));
    }

    #[test]
    fn connected_frame_names_the_project() {
        let project = Uuid::new_v4();
        let frame = connected_frame(project);
        assert!(frame.starts_with("event: connected\n"));
        assert!(frame.contains(&project.to_string()));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn session_updated_frame_shape() {
        let event = EventRecord {
            id: 9,
            project_id: Uuid::new_v4(),
            kind: EventKind::SessionUpdated,
            target_id: "abc".into(),
            job_kind: None,
            status: Some("ready".into()),
            message: None,
            sequence: 3,
            ts: 1_700_000_000_000,
        };

        let frame = event_frame(&event);
        assert!(frame.starts_with("event: session_updated\n"));

        let data_line = frame.lines().nth(1).unwrap().strip_prefix("data: ").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(data_line).unwrap();
        assert_eq!(parsed["data"]["sessionId"], "abc");
        assert_eq!(parsed["data"]["status"], "ready");
        assert_eq!(parsed["id"], "9");
    }
}
