use std::time::Duration;

use berth_core::{now_millis, EventKind, Project, Session, SessionStatus, User, Workspace};
use berth_events::{Broker, Poller, PollerConfig};
use berth_store::{Driver, Store};
use uuid::Uuid;

async fn test_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let dsn = format!("sqlite://{}?mode=rwc", dir.path().join("berth.db").display());
    let store = Store::connect(&dsn, Driver::Sqlite).await.unwrap();
    (store, dir)
}

async fn seed_session(store: &Store) -> Session {
    let now = now_millis();
    let user = User {
        id: Uuid::new_v4(),
        email: format!("{}@example.com", Uuid::new_v4()),
        display_name: None,
        created_at: now,
    };
    store.accounts().create_user(&user).await.unwrap();
    let project = Project {
        id: Uuid::new_v4(),
        owner_id: user.id,
        name: "demo".into(),
        created_at: now,
    };
    store.accounts().create_project(&project).await.unwrap();
    let workspace = Workspace {
        id: Uuid::new_v4(),
        project_id: project.id,
        path: None,
        source_type: berth_core::SourceType::Git,
        source: "https://example.com/repo.git".into(),
        display_name: None,
        status: berth_core::WorkspaceStatus::Initializing,
        commit: None,
        branches: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };
    store.workspaces().create(&workspace).await.unwrap();
    let session = Session {
        id: Uuid::new_v4(),
        project_id: project.id,
        workspace_id: workspace.id,
        agent_id: None,
        name: "s".into(),
        display_name: None,
        status: SessionStatus::Initializing,
        workspace_path: None,
        workspace_commit: None,
        base_commit: None,
        applied_commit: None,
        commit_status: berth_core::CommitStatus::None,
        commit_error: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };
    store.sessions().create(&session).await.unwrap();
    session
}

#[tokio::test]
async fn poller_forwards_rows_and_advances_cursor() {
    let (store, _dir) = test_store().await;
    let session = seed_session(&store).await;

    let broker = Broker::new();
    let mut rx = broker.subscribe(session.project_id);
    let poller = Poller::new(
        store.clone(),
        broker.clone(),
        PollerConfig {
            interval: Duration::from_millis(10),
            batch_size: 2,
        },
    );

    store
        .sessions()
        .update_status(session.id, SessionStatus::Cloning, None)
        .await
        .unwrap();
    store
        .sessions()
        .update_status(session.id, SessionStatus::PullingImage, None)
        .await
        .unwrap();
    store
        .sessions()
        .update_status(session.id, SessionStatus::Ready, None)
        .await
        .unwrap();

    // Batch size 2 forces multiple tail reads in one poll.
    let published = poller.poll_once().await.unwrap();
    assert_eq!(published, 3);

    let statuses: Vec<String> = [rx.recv().await, rx.recv().await, rx.recv().await]
        .into_iter()
        .map(|e| e.unwrap().status.unwrap())
        .collect();
    assert_eq!(statuses, vec!["cloning", "pulling_image", "ready"]);

    // Nothing new: the cursor stuck.
    assert_eq!(poller.poll_once().await.unwrap(), 0);

    // New rows resume after the cursor.
    store
        .sessions()
        .update_status(session.id, SessionStatus::Stopped, None)
        .await
        .unwrap();
    assert_eq!(poller.poll_once().await.unwrap(), 1);
    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::SessionUpdated);
    assert_eq!(event.status.as_deref(), Some("stopped"));
}

#[tokio::test]
async fn restarted_poller_resumes_from_persisted_cursor() {
    let (store, _dir) = test_store().await;
    let session = seed_session(&store).await;
    let broker = Broker::new();

    store
        .sessions()
        .update_status(session.id, SessionStatus::Cloning, None)
        .await
        .unwrap();

    let poller = Poller::new(store.clone(), broker.clone(), PollerConfig::default());
    assert_eq!(poller.poll_once().await.unwrap(), 1);
    drop(poller);

    store
        .sessions()
        .update_status(session.id, SessionStatus::Ready, None)
        .await
        .unwrap();

    // A fresh poller (same store) sees only the unforwarded row.
    let mut rx = broker.subscribe(session.project_id);
    let restarted = Poller::new(store.clone(), broker.clone(), PollerConfig::default());
    assert_eq!(restarted.poll_once().await.unwrap(), 1);
    assert_eq!(rx.recv().await.unwrap().status.as_deref(), Some("ready"));
}
