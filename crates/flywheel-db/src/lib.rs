//! Database layer for Flywheel CI/CD: the build-event log, cross-process
//! notifications, live event tailing, and the worker cache.
//!
//! Many independent front-end processes share one database. Builds append
//! ordered, typed events to a per-build log; any process can tail that log
//! live while a different process is writing it, woken by the database's
//! LISTEN/NOTIFY primitive instead of polling. The same bus carries
//! being-watched marks and the worker/container trigger events that keep
//! each process's scheduling cache warm.

pub mod build;
pub mod bus;
pub mod error;
pub mod event_source;
pub mod event_store;
pub mod notifier;
pub mod sequence;
pub mod watcher;
pub mod worker_cache;

pub use build::{BuildCompletion, PgBuildCompletion, build_abort_channel, build_events_channel};
pub use bus::{BusListener, Listener, Notification, NotificationsBus, QueueMode};
pub use error::{DbError, DbResult};
pub use event_source::{BuildEventSource, EventFetcher};
pub use event_store::{BuildEventStore, Cursor};
pub use notifier::{ConditionNotifier, abort_notifier};
pub use watcher::{BuildBeingWatchedMarker, mark_build_as_being_watched};
pub use worker_cache::{Worker, WorkerCache};

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};

use bus::PgBusListener;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// The process's database handle: the shared pool plus its notification
/// bus (one dedicated LISTEN connection per process).
pub struct Db {
    pool: PgPool,
    bus: Arc<NotificationsBus>,
}

impl Db {
    pub async fn open(database_url: &str) -> DbResult<Self> {
        let pool = create_pool(database_url).await?;
        let listener = PgListener::connect_with(&pool).await?;
        let bus = NotificationsBus::new(PgBusListener::new(listener), pool.clone());
        Ok(Self {
            pool,
            bus: Arc::new(bus),
        })
    }

    pub fn from_parts(pool: PgPool, bus: Arc<NotificationsBus>) -> Self {
        Self { pool, bus }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn bus(&self) -> &Arc<NotificationsBus> {
        &self.bus
    }

    /// Shut down the bus's drain task and close the pool.
    pub async fn close(&self) {
        self.bus.close().await;
        self.pool.close().await;
    }
}
