//! Live tailing of a single build's event log.
//!
//! A [`BuildEventSource`] streams one build's events to one consumer, from
//! an arbitrary start point through to completion or cancellation, without
//! polling on a timer: when it runs out of buffered events it blocks on the
//! build's notification channel and re-reads on wake. The bus subscription
//! is established before the first fetch, so a notification that fired
//! during construction can never be missed; the completion flag is
//! re-checked on every pass rather than trusted from any notification.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flywheel_core::{BuildRef, Envelope};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::Db;
use crate::build::{BuildCompletion, PgBuildCompletion, build_events_channel};
use crate::bus::{BusListener, NotificationsBus, QueueMode};
use crate::error::{DbError, DbResult};
use crate::event_store::{BuildEventStore, Cursor};

/// Events fetched per pass.
const BATCH_SIZE: usize = 2000;

/// Events buffered between the collector and `next()` before the collector
/// blocks on backpressure.
const BUFFER_DEPTH: usize = 20;

/// The collector's view of the build: its completion flag and a paginated
/// read of its event log.
#[async_trait]
pub trait EventFetcher: Send + Sync + 'static {
    async fn completed(&self) -> DbResult<bool>;
    async fn fetch(&self, requested: usize, cursor: &mut Cursor) -> DbResult<Vec<Envelope>>;
}

pub struct PgEventFetcher {
    store: BuildEventStore,
    completion: PgBuildCompletion,
    build: BuildRef,
}

impl PgEventFetcher {
    pub fn new(db: &Db, build: BuildRef) -> Self {
        Self {
            store: BuildEventStore::new(db.pool().clone(), db.bus().clone()),
            completion: PgBuildCompletion::new(db.pool().clone()),
            build,
        }
    }
}

#[async_trait]
impl EventFetcher for PgEventFetcher {
    async fn completed(&self) -> DbResult<bool> {
        self.completion
            .lookup(self.build.id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", self.build.id)))
    }

    async fn fetch(&self, requested: usize, cursor: &mut Cursor) -> DbResult<Vec<Envelope>> {
        self.store.get(&self.build, requested, cursor).await
    }
}

enum Terminal {
    End,
    Closed,
    Failed(Option<DbError>),
}

/// Per-(build, consumer) live-tail session.
pub struct BuildEventSource {
    events: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    stop: watch::Sender<bool>,
    collector: Mutex<Option<JoinHandle<()>>>,
    terminal: Arc<Mutex<Option<Terminal>>>,
}

impl BuildEventSource {
    /// Start tailing `build` from `from`. Fails if the notification bus
    /// subscription cannot be established.
    pub async fn new(db: &Db, build: BuildRef, from: Cursor) -> DbResult<Self> {
        let fetcher = PgEventFetcher::new(db, build);
        Self::with_fetcher(fetcher, Arc::clone(db.bus()), build.id, from).await
    }

    /// As [`BuildEventSource::new`], with the database access behind
    /// `fetcher`.
    pub async fn with_fetcher(
        fetcher: impl EventFetcher,
        bus: Arc<NotificationsBus>,
        build_id: i32,
        from: Cursor,
    ) -> DbResult<Self> {
        // subscribe before the first fetch so a notification racing
        // construction cannot be missed
        let listener = bus
            .listen(&build_events_channel(build_id), QueueMode::DontQueue)
            .await?;

        let (tx, rx) = mpsc::channel(BUFFER_DEPTH);
        let (stop_tx, stop_rx) = watch::channel(false);
        let terminal: Arc<Mutex<Option<Terminal>>> = Arc::new(Mutex::new(None));

        let collector = tokio::spawn(collect(
            fetcher,
            bus,
            listener,
            from,
            tx,
            stop_rx,
            Arc::clone(&terminal),
        ));

        Ok(Self {
            events: tokio::sync::Mutex::new(rx),
            stop: stop_tx,
            collector: Mutex::new(Some(collector)),
            terminal,
        })
    }

    /// The next event in order. Terminates with
    /// [`DbError::EndOfBuildEventStream`] once the build has completed and
    /// every event has been delivered, or
    /// [`DbError::BuildEventStreamClosed`] after [`BuildEventSource::close`].
    pub async fn next(&self) -> DbResult<Envelope> {
        let mut events = self.events.lock().await;
        match events.recv().await {
            Some(envelope) => Ok(envelope),
            None => {
                let mut terminal = self.terminal.lock().unwrap();
                match terminal.as_mut() {
                    Some(Terminal::End) => Err(DbError::EndOfBuildEventStream),
                    Some(Terminal::Failed(err)) => {
                        // delivered once; afterwards the stream is just dead
                        Err(err.take().unwrap_or(DbError::BuildEventStreamClosed))
                    }
                    Some(Terminal::Closed) | None => Err(DbError::BuildEventStreamClosed),
                }
            }
        }
    }

    /// Stop the collector, wait for it to exit, and release the bus
    /// subscription. Idempotent; unblocks any in-flight `next()`.
    pub async fn close(&self) {
        let _ = self.stop.send(true);
        let collector = self.collector.lock().unwrap().take();
        if let Some(handle) = collector {
            let _ = handle.await;
        }
    }
}

async fn collect(
    fetcher: impl EventFetcher,
    bus: Arc<NotificationsBus>,
    mut listener: BusListener,
    mut cursor: Cursor,
    tx: mpsc::Sender<Envelope>,
    mut stop: watch::Receiver<bool>,
    terminal: Arc<Mutex<Option<Terminal>>>,
) {
    let outcome = run(&fetcher, &mut listener, &mut cursor, &tx, &mut stop).await;
    *terminal.lock().unwrap() = Some(outcome);

    if let Err(e) = bus.unlisten(listener).await {
        debug!(error = %e, "failed to release build event subscription");
    }
    // tx drops here, unblocking the consumer
}

async fn run(
    fetcher: &impl EventFetcher,
    listener: &mut BusListener,
    cursor: &mut Cursor,
    tx: &mpsc::Sender<Envelope>,
    stop: &mut watch::Receiver<bool>,
) -> Terminal {
    loop {
        // the completion check precedes the read: events appended in
        // between are picked up on the next pass, never skipped
        let completed = match fetcher.completed().await {
            Ok(completed) => completed,
            Err(e) => return Terminal::Failed(Some(e)),
        };

        let batch = match fetcher.fetch(BATCH_SIZE, cursor).await {
            Ok(batch) => batch,
            Err(e) => return Terminal::Failed(Some(e)),
        };
        let full_batch = batch.len() == BATCH_SIZE;

        for envelope in batch {
            tokio::select! {
                _ = stop.changed() => return Terminal::Closed,
                sent = tx.send(envelope) => {
                    if sent.is_err() {
                        return Terminal::Closed;
                    }
                }
            }
        }

        if full_batch {
            // more may already be buffered
            continue;
        }

        if completed {
            return Terminal::End;
        }

        tokio::select! {
            _ = stop.changed() => return Terminal::Closed,
            notification = listener.recv() => {
                // healthy or not, re-check state; None means the bus is gone
                if notification.is_none() {
                    return Terminal::Failed(Some(DbError::BusClosed));
                }
            }
        }
    }
}
