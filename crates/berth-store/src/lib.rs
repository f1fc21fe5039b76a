//! Persistence layer for berth.
//!
//! One relational schema served by SQLite (embedded) or PostgreSQL
//! (production) through sqlx's `Any` driver. All timestamps are i64 unix
//! milliseconds and all UUIDs are TEXT so a single query text works on both
//! backends; only the DDL is per-driver (see [`migrate`]).
//!
//! Every transactional boundary here is a single statement or a short
//! `BEGIN/COMMIT` block — callers never hold a transaction across their own
//! await points.

pub mod accounts;
pub mod agents;
pub mod events;
pub mod jobs;
pub mod migrate;
pub mod sessions;
pub mod workspaces;

mod row;

use berth_core::{Error, Result};
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

pub use agents::AgentStore;
pub use accounts::AccountStore;
pub use events::EventStore;
pub use jobs::{EnqueueOutcome, JobStore};
pub use sessions::SessionStore;
pub use workspaces::WorkspaceStore;

/// Which backend a DSN points at. Controls the DDL dialect only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Sqlite,
    Postgres,
}

impl Driver {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(Error::Internal(format!("unknown database driver: {other}"))),
        }
    }
}

/// The single owner of all persisted entities.
///
/// Cheap to clone; every sub-store holds a clone of the pool (the same
/// shape the per-concern stores in the engine take).
#[derive(Clone)]
pub struct Store {
    db: AnyPool,
    driver: Driver,
    workspaces: WorkspaceStore,
    sessions: SessionStore,
    agents: AgentStore,
    jobs: JobStore,
    events: EventStore,
    accounts: AccountStore,
}

impl Store {
    /// Connect to the database named by `dsn` and run pending migrations.
    pub async fn connect(dsn: &str, driver: Driver) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let db = AnyPoolOptions::new()
            .max_connections(16)
            .connect(dsn)
            .await?;

        migrate::run(&db, driver).await?;
        Ok(Self::new(db, driver))
    }

    /// Wrap an already-connected pool. Does not migrate.
    pub fn new(db: AnyPool, driver: Driver) -> Self {
        Self {
            workspaces: WorkspaceStore::new(db.clone()),
            sessions: SessionStore::new(db.clone()),
            agents: AgentStore::new(db.clone()),
            jobs: JobStore::new(db.clone()),
            events: EventStore::new(db.clone()),
            accounts: AccountStore::new(db.clone()),
            db,
            driver,
        }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.db
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    pub fn workspaces(&self) -> &WorkspaceStore {
        &self.workspaces
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn agents(&self) -> &AgentStore {
        &self.agents
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }
}
