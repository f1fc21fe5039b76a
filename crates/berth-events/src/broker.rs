use berth_core::{EventRecord, ProjectId};
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Default broadcast capacity per project.
const CHANNEL_CAPACITY: usize = 256;

/// Per-project fan-out of event rows.
///
/// Channels are lazily created on first publish or subscribe. Slow
/// consumers that fall behind the channel capacity receive
/// `RecvError::Lagged` and skip missed events rather than blocking the
/// publisher; reconnecting with a cursor replays what they missed.
#[derive(Clone, Default)]
pub struct Broker {
    channels: std::sync::Arc<DashMap<ProjectId, broadcast::Sender<EventRecord>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish to all subscribers of the event's project. With no
    /// subscribers the event is dropped; the rows remain in the store for
    /// replay.
    pub fn publish(&self, event: EventRecord) {
        let sender = self.sender(event.project_id);
        let _ = sender.send(event);
    }

    /// Subscribe to a project's live tail. The receiver sees events
    /// published after this call.
    pub fn subscribe(&self, project_id: ProjectId) -> broadcast::Receiver<EventRecord> {
        self.sender(project_id).subscribe()
    }

    pub fn subscriber_count(&self, project_id: ProjectId) -> usize {
        self.channels
            .get(&project_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Drop channels nobody listens to.
    pub fn prune_idle_channels(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    fn sender(&self, project_id: ProjectId) -> broadcast::Sender<EventRecord> {
        self.channels
            .entry(project_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::EventKind;
    use uuid::Uuid;

    fn event(project_id: ProjectId, sequence: i64) -> EventRecord {
        EventRecord {
            id: sequence,
            project_id,
            kind: EventKind::SessionUpdated,
            target_id: Uuid::new_v4().to_string(),
            job_kind: None,
            status: Some("ready".into()),
            message: None,
            sequence,
            ts: 0,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_their_project_only() {
        let broker = Broker::new();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();

        let mut rx1 = broker.subscribe(p1);
        let mut rx2 = broker.subscribe(p2);

        broker.publish(event(p1, 1));
        broker.publish(event(p2, 1));
        broker.publish(event(p1, 2));

        assert_eq!(rx1.recv().await.unwrap().sequence, 1);
        assert_eq!(rx1.recv().await.unwrap().sequence, 2);
        assert_eq!(rx2.recv().await.unwrap().project_id, p2);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let broker = Broker::new();
        broker.publish(event(Uuid::new_v4(), 1));
    }

    #[test]
    fn prune_drops_idle_channels() {
        let broker = Broker::new();
        let project = Uuid::new_v4();
        {
            let _rx = broker.subscribe(project);
            assert_eq!(broker.subscriber_count(project), 1);
        }
        broker.prune_idle_channels();
        assert_eq!(broker.subscriber_count(project), 0);
    }
}
