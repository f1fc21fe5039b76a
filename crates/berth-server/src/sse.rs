//! The project event stream route: replay from a cursor, then the live
//! tail. Everything interesting (cursor parsing, frame payloads) lives in
//! `berth-events`; this is the axum adapter.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use berth_core::ProjectId;
use berth_events::{event_payload, Broker, ReplayCursor};
use berth_store::Store;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub broker: Broker,
}

fn to_sse_event(record: &berth_core::EventRecord) -> Event {
    let (name, data) = event_payload(record);
    Event::default().event(name).data(data.to_string())
}

pub async fn project_events(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
    Query(params): Query<HashMap<String, String>>,
) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    // Subscribe before reading the replay range so nothing written between
    // the two is lost; duplicates are filtered by event id below.
    let mut live = state.broker.subscribe(project_id);

    let cursor = berth_events::parse_cursor(
        params.get("since").map(String::as_str),
        params.get("after").map(String::as_str),
    );

    let replay = match cursor {
        ReplayCursor::SinceMillis(ts) => state
            .store
            .events()
            .list_project_since(project_id, ts)
            .await
            .unwrap_or_default(),
        ReplayCursor::AfterId(id) => state
            .store
            .events()
            .list_project_after(project_id, id)
            .await
            .unwrap_or_default(),
        ReplayCursor::Live => Vec::new(),
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        let connected = Event::default().event("connected").data(
            serde_json::json!({ "projectId": project_id.to_string() }).to_string(),
        );
        if tx.send(Ok(connected)).await.is_err() {
            return;
        }

        let mut last_id = 0;
        for record in &replay {
            last_id = record.id;
            if tx.send(Ok(to_sse_event(record))).await.is_err() {
                return;
            }
        }

        loop {
            match live.recv().await {
                Ok(record) => {
                    if record.id <= last_id {
                        continue; // already replayed
                    }
                    last_id = record.id;
                    if tx.send(Ok(to_sse_event(&record))).await.is_err() {
                        return; // subscriber went away
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(project = %project_id, lagged = n, "sse subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}
