//! In-memory read-through cache of workers and their active build-container
//! counts.
//!
//! Scheduling evaluates the whole fleet frequently; querying per decision
//! does not scale. The cache serves snapshots from memory, kept close to
//! truth by trigger notifications on the worker and container tables, with
//! a time-boxed full refresh as the fallback against lost notifications.
//! The dual mechanism is load-bearing: neither side alone survives a bus
//! reconnect or a slow consumer drop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use sqlx::PgPool;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::Db;
use crate::bus::{BusListener, QueueMode};
use crate::error::DbResult;

/// Trigger channel for worker row changes.
pub const WORKER_EVENTS_CHANNEL: &str = "worker_events";

/// Trigger channel for container row changes.
pub const CONTAINER_EVENTS_CHANNEL: &str = "container_events";

/// Staleness bound: a read older than this triggers a synchronous full
/// refresh even if no notifications arrived.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Worker {
    pub name: String,
    pub addr: Option<String>,
    pub state: String,
    pub platform: Option<String>,
    pub team_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerOperation {
    Insert,
    Update,
    Delete,
}

/// Payload of a `worker_events` notification.
#[derive(Debug, Deserialize)]
pub struct WorkerEvent {
    pub operation: TriggerOperation,
    pub name: String,
}

/// Payload of a `container_events` notification. `build_id` is absent for
/// check containers, which never count.
#[derive(Debug, Deserialize)]
pub struct ContainerEvent {
    pub operation: TriggerOperation,
    pub worker_name: String,
    pub build_id: Option<i64>,
}

#[derive(Default)]
struct CacheData {
    workers: HashMap<String, Worker>,
    container_counts: HashMap<String, i64>,
    last_refresh: Option<Instant>,
}

impl CacheData {
    fn fresh_within(&self, interval: Duration) -> bool {
        self.last_refresh
            .is_some_and(|refreshed| refreshed.elapsed() < interval)
    }

    fn upsert_worker(&mut self, worker: Worker) {
        self.container_counts.entry(worker.name.clone()).or_insert(0);
        self.workers.insert(worker.name.clone(), worker);
    }

    fn remove_worker(&mut self, name: &str) {
        self.workers.remove(name);
        self.container_counts.remove(name);
    }

    fn apply_container_event(&mut self, event: &ContainerEvent) {
        // only containers running a build count; check containers are
        // excluded from scheduling pressure
        if event.build_id.is_none() {
            return;
        }

        let count = self
            .container_counts
            .entry(event.worker_name.clone())
            .or_insert(0);
        match event.operation {
            TriggerOperation::Insert => *count += 1,
            TriggerOperation::Delete => *count = (*count - 1).max(0),
            TriggerOperation::Update => {}
        }
    }
}

pub struct WorkerCache {
    pool: PgPool,
    data: Arc<RwLock<CacheData>>,
    refresh_interval: Duration,
    stop: watch::Sender<bool>,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerCache {
    pub async fn new(db: &Db) -> DbResult<Self> {
        Self::with_refresh_interval(db, DEFAULT_REFRESH_INTERVAL).await
    }

    pub async fn with_refresh_interval(db: &Db, refresh_interval: Duration) -> DbResult<Self> {
        let worker_listener = db.bus().listen(WORKER_EVENTS_CHANNEL, QueueMode::Queue).await?;
        let container_listener = db
            .bus()
            .listen(CONTAINER_EVENTS_CHANNEL, QueueMode::Queue)
            .await?;

        let data = Arc::new(RwLock::new(CacheData::default()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker_task = tokio::spawn(worker_events_loop(
            db.pool().clone(),
            Arc::clone(&data),
            worker_listener,
            stop_rx.clone(),
        ));
        let container_task = tokio::spawn(container_events_loop(
            Arc::clone(&data),
            container_listener,
            stop_rx,
        ));

        Ok(Self {
            pool: db.pool().clone(),
            data,
            refresh_interval,
            stop: stop_tx,
            listener_tasks: Mutex::new(vec![worker_task, container_task]),
        })
    }

    /// Point-in-time snapshot of every worker.
    pub async fn workers(&self) -> DbResult<Vec<Worker>> {
        self.refresh_if_stale().await?;
        let data = self.data.read().await;
        Ok(data.workers.values().cloned().collect())
    }

    /// Point-in-time snapshot of active build-container counts per worker.
    pub async fn worker_container_counts(&self) -> DbResult<HashMap<String, i64>> {
        self.refresh_if_stale().await?;
        let data = self.data.read().await;
        Ok(data.container_counts.clone())
    }

    async fn refresh_if_stale(&self) -> DbResult<()> {
        {
            let data = self.data.read().await;
            if data.fresh_within(self.refresh_interval) {
                return Ok(());
            }
        }

        let mut data = self.data.write().await;
        // a concurrent reader may have refreshed while we waited
        if data.fresh_within(self.refresh_interval) {
            return Ok(());
        }
        refresh_worker_data(&self.pool, &mut data).await
    }

    /// Stop the listener loops and wait for them to exit.
    pub async fn drain(&self) {
        let _ = self.stop.send(true);
        let tasks = std::mem::take(&mut *self.listener_tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
    }

    #[cfg(test)]
    async fn seed(&self, workers: Vec<Worker>, counts: &[(&str, i64)]) {
        let mut data = self.data.write().await;
        for worker in workers {
            data.upsert_worker(worker);
        }
        for (name, count) in counts {
            data.container_counts.insert(name.to_string(), *count);
        }
        data.last_refresh = Some(Instant::now());
    }

    #[cfg(test)]
    async fn refresh_stamp_cleared(&self) -> bool {
        self.data.read().await.last_refresh.is_none()
    }
}

/// Re-query everything and replace both maps atomically.
async fn refresh_worker_data(pool: &PgPool, data: &mut CacheData) -> DbResult<()> {
    let workers: Vec<Worker> =
        sqlx::query_as("SELECT name, addr, state, platform, team_id FROM workers")
            .fetch_all(pool)
            .await?;

    let counts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT worker_name, COUNT(*) FROM containers
            WHERE build_id IS NOT NULL
            GROUP BY worker_name",
    )
    .fetch_all(pool)
    .await?;

    let mut container_counts: HashMap<String, i64> =
        workers.iter().map(|w| (w.name.clone(), 0)).collect();
    container_counts.extend(counts);

    data.workers = workers.into_iter().map(|w| (w.name.clone(), w)).collect();
    data.container_counts = container_counts;
    data.last_refresh = Some(Instant::now());
    Ok(())
}

async fn worker_events_loop(
    pool: PgPool,
    data: Arc<RwLock<CacheData>>,
    mut listener: BusListener,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            notification = listener.recv() => match notification {
                Some(n) if !n.healthy => {
                    // connection churn may have eaten events; force the
                    // next read to refresh
                    data.write().await.last_refresh = None;
                }
                Some(n) => {
                    if let Err(e) = handle_worker_event(&pool, &data, &n.payload).await {
                        warn!(error = %e, payload = %n.payload, "failed to apply worker event");
                    }
                }
                None => return,
            },
        }
    }
}

async fn handle_worker_event(
    pool: &PgPool,
    data: &RwLock<CacheData>,
    payload: &str,
) -> DbResult<()> {
    let event: WorkerEvent = serde_json::from_str(payload)?;

    match event.operation {
        TriggerOperation::Delete => {
            data.write().await.remove_worker(&event.name);
        }
        TriggerOperation::Insert | TriggerOperation::Update => {
            let row: Option<Worker> = sqlx::query_as(
                "SELECT name, addr, state, platform, team_id FROM workers WHERE name = $1",
            )
            .bind(&event.name)
            .fetch_optional(pool)
            .await?;

            // the row may be gone again by the time we look; the delete
            // notification will follow
            if let Some(worker) = row {
                data.write().await.upsert_worker(worker);
            }
        }
    }

    Ok(())
}

async fn container_events_loop(
    data: Arc<RwLock<CacheData>>,
    mut listener: BusListener,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            notification = listener.recv() => match notification {
                Some(n) if !n.healthy => {
                    data.write().await.last_refresh = None;
                }
                Some(n) => match serde_json::from_str::<ContainerEvent>(&n.payload) {
                    Ok(event) => data.write().await.apply_container_event(&event),
                    Err(e) => {
                        warn!(error = %e, payload = %n.payload, "malformed container event");
                    }
                },
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::{FakeUpstream, fake_bus, lazy_pool};
    use std::sync::Arc;

    fn worker(name: &str) -> Worker {
        Worker {
            name: name.to_string(),
            addr: Some(format!("{name}:7777")),
            state: "running".to_string(),
            platform: Some("linux".to_string()),
            team_id: None,
        }
    }

    async fn cache_with_fake_bus() -> (WorkerCache, FakeUpstream) {
        let (bus, upstream) = fake_bus();
        let db = Db::from_parts(lazy_pool(), Arc::new(bus));
        let cache = WorkerCache::new(&db).await.unwrap();
        (cache, upstream)
    }

    async fn quiesce() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[test]
    fn container_events_only_count_build_containers() {
        let mut data = CacheData::default();
        data.upsert_worker(worker("w1"));

        data.apply_container_event(&ContainerEvent {
            operation: TriggerOperation::Insert,
            worker_name: "w1".to_string(),
            build_id: Some(7),
        });
        data.apply_container_event(&ContainerEvent {
            operation: TriggerOperation::Insert,
            worker_name: "w1".to_string(),
            build_id: None,
        });
        assert_eq!(data.container_counts["w1"], 1);

        data.apply_container_event(&ContainerEvent {
            operation: TriggerOperation::Delete,
            worker_name: "w1".to_string(),
            build_id: Some(7),
        });
        data.apply_container_event(&ContainerEvent {
            operation: TriggerOperation::Delete,
            worker_name: "w1".to_string(),
            build_id: None,
        });
        assert_eq!(data.container_counts["w1"], 0);
    }

    #[test]
    fn container_counts_never_go_negative() {
        let mut data = CacheData::default();

        data.apply_container_event(&ContainerEvent {
            operation: TriggerOperation::Delete,
            worker_name: "w1".to_string(),
            build_id: Some(7),
        });
        assert_eq!(data.container_counts["w1"], 0);
    }

    #[test]
    fn worker_event_payloads_use_uppercase_operation_tags() {
        let event: WorkerEvent =
            serde_json::from_str(r#"{"operation": "INSERT", "name": "w1"}"#).unwrap();
        assert_eq!(event.operation, TriggerOperation::Insert);
        assert_eq!(event.name, "w1");

        let event: ContainerEvent = serde_json::from_str(
            r#"{"operation": "DELETE", "worker_name": "w2", "build_id": 42}"#,
        )
        .unwrap();
        assert_eq!(event.operation, TriggerOperation::Delete);
        assert_eq!(event.build_id, Some(42));

        assert!(serde_json::from_str::<WorkerEvent>(r#"{"operation": "insert"}"#).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_notifications_drop_the_worker_from_both_maps() {
        let (cache, upstream) = cache_with_fake_bus().await;
        cache
            .seed(vec![worker("w1"), worker("w2")], &[("w1", 3), ("w2", 1)])
            .await;

        upstream
            .notify(
                WORKER_EVENTS_CHANNEL,
                r#"{"operation": "DELETE", "name": "w1"}"#,
            )
            .await;
        quiesce().await;

        let workers = cache.workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].name, "w2");
        assert_eq!(
            cache.worker_container_counts().await.unwrap(),
            HashMap::from([("w2".to_string(), 1)])
        );

        cache.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn container_notifications_adjust_counts() {
        let (cache, upstream) = cache_with_fake_bus().await;
        cache.seed(vec![worker("w1")], &[("w1", 0)]).await;

        for _ in 0..3 {
            upstream
                .notify(
                    CONTAINER_EVENTS_CHANNEL,
                    r#"{"operation": "INSERT", "worker_name": "w1", "build_id": 9}"#,
                )
                .await;
        }
        upstream
            .notify(
                CONTAINER_EVENTS_CHANNEL,
                r#"{"operation": "INSERT", "worker_name": "w1", "build_id": null}"#,
            )
            .await;
        quiesce().await;

        assert_eq!(cache.worker_container_counts().await.unwrap()["w1"], 3);

        cache.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payloads_do_not_kill_the_listener() {
        let (cache, upstream) = cache_with_fake_bus().await;
        cache.seed(vec![worker("w1")], &[("w1", 0)]).await;

        upstream.notify(WORKER_EVENTS_CHANNEL, "not json").await;
        upstream.notify(CONTAINER_EVENTS_CHANNEL, "also not json").await;
        upstream
            .notify(
                WORKER_EVENTS_CHANNEL,
                r#"{"operation": "DELETE", "name": "w1"}"#,
            )
            .await;
        quiesce().await;

        assert!(cache.workers().await.unwrap().is_empty());

        cache.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_notification_forces_the_next_read_to_refresh() {
        let (cache, upstream) = cache_with_fake_bus().await;
        cache.seed(vec![worker("w1")], &[]).await;
        assert!(!cache.refresh_stamp_cleared().await);

        upstream.disconnect().await;
        quiesce().await;

        assert!(cache.refresh_stamp_cleared().await);

        cache.drain().await;
    }
}
