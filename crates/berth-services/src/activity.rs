use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use berth_core::SessionId;

/// Per-session last-activity timestamps, written on every successful
/// sidecar call and read by the idle-eviction loop. One mutex; writes are
/// tiny and serialised per the concurrency model.
#[derive(Default)]
pub struct ActivityTracker {
    last_activity: Mutex<HashMap<SessionId, Instant>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, session_id: SessionId) {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, Instant::now());
    }

    pub fn last_activity(&self, session_id: SessionId) -> Option<Instant> {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .copied()
    }

    /// Sessions whose last activity is older than `idle_after`. Sessions
    /// never touched are not reported — they haven't been used through the
    /// gatekeeper yet.
    pub fn idle_sessions(&self, idle_after: Duration) -> Vec<SessionId> {
        let map = self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        map.iter()
            .filter(|(_, at)| at.elapsed() >= idle_after)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Forget a session (deleted or evicted).
    pub fn forget(&self, session_id: SessionId) {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session_id);
    }
}
