//! Cross-process notification fan-out over the database's LISTEN/NOTIFY
//! primitive.
//!
//! One dedicated connection drains upstream notifications and fans them out
//! to any number of local listeners per channel. The bus subscribes upstream
//! if and only if at least one local listener is registered for a channel,
//! and unsubscribes when the last one goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{DbError, DbResult};

/// Buffered notifications per queueing listener before the dispatcher
/// blocks.
const QUEUE_DEPTH: usize = 100;

/// What a registered listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// `false` means the underlying connection to the bus dropped and
    /// was/will be re-established. Receivers should re-check whatever state
    /// they care about rather than treat it as a specific event.
    pub healthy: bool,
    pub payload: String,
}

impl Notification {
    fn healthy(payload: String) -> Self {
        Self {
            healthy: true,
            payload,
        }
    }

    fn unhealthy() -> Self {
        Self {
            healthy: false,
            payload: String::new(),
        }
    }
}

/// A notification as the upstream transport reports it.
#[derive(Debug, Clone)]
pub struct RawNotification {
    pub channel: String,
    pub payload: String,
}

/// Upstream LISTEN/NOTIFY transport.
///
/// `recv` returning `Ok(None)` is the disconnect sentinel: the connection
/// was lost and will be re-established by the transport.
#[async_trait]
pub trait Listener: Send + 'static {
    async fn listen(&mut self, channel: &str) -> DbResult<()>;
    async fn unlisten(&mut self, channel: &str) -> DbResult<()>;
    async fn recv(&mut self) -> DbResult<Option<RawNotification>>;
}

/// Production transport over a dedicated [`PgListener`] connection.
pub struct PgBusListener {
    inner: PgListener,
}

impl PgBusListener {
    pub fn new(inner: PgListener) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Listener for PgBusListener {
    async fn listen(&mut self, channel: &str) -> DbResult<()> {
        self.inner.listen(channel).await.map_err(DbError::from)
    }

    async fn unlisten(&mut self, channel: &str) -> DbResult<()> {
        self.inner.unlisten(channel).await.map_err(DbError::from)
    }

    async fn recv(&mut self) -> DbResult<Option<RawNotification>> {
        // try_recv yields None exactly when the connection died; the next
        // call transparently reconnects.
        let notification = self.inner.try_recv().await?;
        Ok(notification.map(|n| RawNotification {
            channel: n.channel().to_string(),
            payload: n.payload().to_string(),
        }))
    }
}

/// Delivery policy for one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Deliver every notification, in order. The dispatcher blocks rather
    /// than drop when the listener's buffer is full.
    Queue,
    /// Retain at most one undelivered notification; anything more coalesces
    /// until the listener drains. The mode for "something changed, go
    /// re-check" signals where only presence matters.
    DontQueue,
}

struct Target {
    mode: QueueMode,
    tx: mpsc::Sender<Notification>,
}

type Registry = Arc<Mutex<HashMap<String, HashMap<u64, Target>>>>;

/// Receive handle returned by [`NotificationsBus::listen`].
pub struct BusListener {
    id: u64,
    channel: String,
    rx: mpsc::Receiver<Notification>,
}

impl BusListener {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Blocks until a notification arrives. `None` means the bus itself has
    /// shut down.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

enum Command {
    Listen(String, oneshot::Sender<DbResult<()>>),
    Unlisten(String, oneshot::Sender<DbResult<()>>),
}

/// Multi-subscriber fan-out over one upstream LISTEN/NOTIFY connection.
pub struct NotificationsBus {
    pool: PgPool,
    registry: Registry,
    commands: mpsc::Sender<Command>,
    next_id: AtomicU64,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationsBus {
    /// Starts the drain task that owns the upstream listener connection.
    pub fn new(listener: impl Listener, pool: PgPool) -> Self {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let drain = tokio::spawn(drain_loop(listener, Arc::clone(&registry), cmd_rx));

        Self {
            pool,
            registry,
            commands: cmd_tx,
            next_id: AtomicU64::new(0),
            drain: Mutex::new(Some(drain)),
        }
    }

    /// Fire-and-forget broadcast with an empty payload.
    pub async fn notify(&self, channel: &str) -> DbResult<()> {
        self.notify_payload(channel, "").await
    }

    /// Fire-and-forget broadcast.
    pub async fn notify_payload(&self, channel: &str, payload: &str) -> DbResult<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Register a local delivery target for `channel`. The first target on a
    /// channel triggers the upstream subscribe; later ones reuse it.
    pub async fn listen(&self, channel: &str, mode: QueueMode) -> DbResult<BusListener> {
        let capacity = match mode {
            QueueMode::Queue => QUEUE_DEPTH,
            QueueMode::DontQueue => 1,
        };
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let first = {
            let mut registry = self.registry.lock().unwrap();
            let targets = registry.entry(channel.to_string()).or_default();
            let first = targets.is_empty();
            targets.insert(id, Target { mode, tx });
            first
        };

        if first {
            if let Err(e) = self.upstream(Command::Listen, channel).await {
                let mut registry = self.registry.lock().unwrap();
                if let Some(targets) = registry.get_mut(channel) {
                    targets.remove(&id);
                    if targets.is_empty() {
                        registry.remove(channel);
                    }
                }
                return Err(e);
            }
        }

        Ok(BusListener {
            id,
            channel: channel.to_string(),
            rx,
        })
    }

    /// Remove one delivery target; issues the upstream unsubscribe when the
    /// channel's last target goes away.
    pub async fn unlisten(&self, listener: BusListener) -> DbResult<()> {
        let BusListener { id, channel, .. } = listener;

        let last = {
            let mut registry = self.registry.lock().unwrap();
            match registry.get_mut(&channel) {
                Some(targets) => {
                    targets.remove(&id);
                    if targets.is_empty() {
                        registry.remove(&channel);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last {
            self.upstream(Command::Unlisten, &channel).await?;
        }
        Ok(())
    }

    /// Shut down the drain task, closing the upstream connection.
    pub async fn close(&self) {
        let drain = self.drain.lock().unwrap().take();
        if let Some(handle) = drain {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn upstream(
        &self,
        make: fn(String, oneshot::Sender<DbResult<()>>) -> Command,
        channel: &str,
    ) -> DbResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(channel.to_string(), reply_tx))
            .await
            .map_err(|_| DbError::BusClosed)?;
        reply_rx.await.map_err(|_| DbError::BusClosed)?
    }
}

enum Step {
    Command(Option<Command>),
    Received(DbResult<Option<RawNotification>>),
}

async fn drain_loop(
    mut listener: impl Listener,
    registry: Registry,
    mut commands: mpsc::Receiver<Command>,
) {
    loop {
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            received = listener.recv() => Step::Received(received),
        };

        match step {
            Step::Command(Some(Command::Listen(channel, reply))) => {
                let _ = reply.send(listener.listen(&channel).await);
            }
            Step::Command(Some(Command::Unlisten(channel, reply))) => {
                let _ = reply.send(listener.unlisten(&channel).await);
            }
            // the bus itself was dropped
            Step::Command(None) => return,
            Step::Received(Ok(Some(raw))) => dispatch(&registry, raw).await,
            Step::Received(Ok(None)) => broadcast_unhealthy(&registry).await,
            Step::Received(Err(e)) => {
                warn!(error = %e, "notification listener receive failed");
                broadcast_unhealthy(&registry).await;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn dispatch(registry: &Registry, raw: RawNotification) {
    let targets: Vec<(QueueMode, mpsc::Sender<Notification>)> = {
        let registry = registry.lock().unwrap();
        registry
            .get(&raw.channel)
            .map(|targets| {
                targets
                    .values()
                    .map(|t| (t.mode, t.tx.clone()))
                    .collect()
            })
            .unwrap_or_default()
    };

    for (mode, tx) in targets {
        let notification = Notification::healthy(raw.payload.clone());
        match mode {
            // block on backpressure rather than drop
            QueueMode::Queue => {
                let _ = tx.send(notification).await;
            }
            // full buffer means a wake-up is already pending; coalesce
            QueueMode::DontQueue => {
                let _ = tx.try_send(notification);
            }
        }
    }
}

/// A disconnect is delivered to every target on every channel, bypassing
/// the coalescing policy: it must never be silently dropped.
async fn broadcast_unhealthy(registry: &Registry) {
    let targets: Vec<mpsc::Sender<Notification>> = {
        let registry = registry.lock().unwrap();
        registry
            .values()
            .flat_map(|targets| targets.values().map(|t| t.tx.clone()))
            .collect()
    };

    for tx in targets {
        let _ = tx.send(Notification::unhealthy()).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    pub(crate) struct FakeListener {
        incoming: mpsc::Receiver<Option<RawNotification>>,
        listened: Arc<Mutex<Vec<String>>>,
        unlistened: Arc<Mutex<Vec<String>>>,
        fail_listen: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Listener for FakeListener {
        async fn listen(&mut self, channel: &str) -> DbResult<()> {
            if self.fail_listen.load(Ordering::SeqCst) {
                return Err(DbError::NotFound("nope".to_string()));
            }
            self.listened.lock().unwrap().push(channel.to_string());
            Ok(())
        }

        async fn unlisten(&mut self, channel: &str) -> DbResult<()> {
            self.unlistened.lock().unwrap().push(channel.to_string());
            Ok(())
        }

        async fn recv(&mut self) -> DbResult<Option<RawNotification>> {
            match self.incoming.recv().await {
                Some(n) => Ok(n),
                // upstream closed for good; park forever instead of spinning
                None => std::future::pending().await,
            }
        }
    }

    pub(crate) struct FakeUpstream {
        pub tx: mpsc::Sender<Option<RawNotification>>,
        pub listened: Arc<Mutex<Vec<String>>>,
        pub unlistened: Arc<Mutex<Vec<String>>>,
        pub fail_listen: Arc<AtomicBool>,
    }

    impl FakeUpstream {
        pub async fn notify(&self, channel: &str, payload: &str) {
            self.tx
                .send(Some(RawNotification {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                }))
                .await
                .unwrap();
        }

        pub async fn disconnect(&self) {
            self.tx.send(None).await.unwrap();
        }
    }

    pub(crate) fn lazy_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/flywheel_test")
            .unwrap()
    }

    pub(crate) fn fake_bus() -> (NotificationsBus, FakeUpstream) {
        let (tx, rx) = mpsc::channel(256);
        let listened = Arc::new(Mutex::new(Vec::new()));
        let unlistened = Arc::new(Mutex::new(Vec::new()));
        let fail_listen = Arc::new(AtomicBool::new(false));

        let listener = FakeListener {
            incoming: rx,
            listened: Arc::clone(&listened),
            unlistened: Arc::clone(&unlistened),
            fail_listen: Arc::clone(&fail_listen),
        };

        let bus = NotificationsBus::new(listener, lazy_pool());
        (
            bus,
            FakeUpstream {
                tx,
                listened,
                unlistened,
                fail_listen,
            },
        )
    }

    /// With the clock paused, sleeping only completes once every other task
    /// is idle, i.e. once the bus has processed everything it will.
    async fn quiesce() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_to_all_listeners_on_the_channel() {
        let (bus, upstream) = fake_bus();
        let mut a = bus.listen("some-channel", QueueMode::Queue).await.unwrap();
        let mut b = bus.listen("some-channel", QueueMode::Queue).await.unwrap();

        upstream.notify("some-channel", "").await;

        assert_eq!(a.recv().await.unwrap(), Notification::healthy(String::new()));
        assert_eq!(b.recv().await.unwrap(), Notification::healthy(String::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_only_to_the_notified_channel() {
        let (bus, upstream) = fake_bus();
        let mut a = bus.listen("some-channel", QueueMode::Queue).await.unwrap();
        let mut b = bus
            .listen("some-other-channel", QueueMode::Queue)
            .await
            .unwrap();

        upstream.notify("some-channel", "").await;
        quiesce().await;

        assert!(a.try_recv().is_some());
        assert!(b.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn passes_the_payload_through() {
        let (bus, upstream) = fake_bus();
        let mut a = bus.listen("some-channel", QueueMode::Queue).await.unwrap();

        upstream.notify("some-channel", "hello!").await;

        assert_eq!(
            a.recv().await.unwrap(),
            Notification::healthy("hello!".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_reaches_every_listener_on_every_channel() {
        let (bus, upstream) = fake_bus();
        let mut a = bus.listen("some-channel", QueueMode::Queue).await.unwrap();
        let mut b = bus
            .listen("some-other-channel", QueueMode::DontQueue)
            .await
            .unwrap();

        upstream.disconnect().await;

        assert_eq!(a.recv().await.unwrap(), Notification::unhealthy());
        assert_eq!(b.recv().await.unwrap(), Notification::unhealthy());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_not_coalesced_away() {
        let (bus, upstream) = fake_bus();
        let mut a = bus
            .listen("some-channel", QueueMode::DontQueue)
            .await
            .unwrap();

        // fill the single pending slot, then disconnect
        upstream.notify("some-channel", "").await;
        upstream.disconnect().await;
        quiesce().await;

        assert_eq!(a.recv().await.unwrap(), Notification::healthy(String::new()));
        assert_eq!(a.recv().await.unwrap(), Notification::unhealthy());
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_when_not_queueing() {
        let (bus, upstream) = fake_bus();
        let mut a = bus
            .listen("some-channel", QueueMode::DontQueue)
            .await
            .unwrap();

        for _ in 0..100 {
            upstream.notify("some-channel", "").await;
        }
        quiesce().await;

        assert!(a.try_recv().is_some());
        assert!(a.try_recv().is_none());

        // drains, then receives again
        upstream.notify("some-channel", "").await;
        assert!(a.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn queueing_listeners_get_every_notification_in_order() {
        let (bus, upstream) = fake_bus();
        let mut a = bus.listen("some-channel", QueueMode::Queue).await.unwrap();

        for i in 0..100 {
            upstream.notify("some-channel", &i.to_string()).await;
        }

        for i in 0..100 {
            assert_eq!(a.recv().await.unwrap().payload, i.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn listens_upstream_only_once_per_channel() {
        let (bus, upstream) = fake_bus();
        let _a = bus.listen("some-channel", QueueMode::Queue).await.unwrap();
        let _b = bus.listen("some-channel", QueueMode::Queue).await.unwrap();

        assert_eq!(
            *upstream.listened.lock().unwrap(),
            vec!["some-channel".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unlistens_upstream_only_when_the_last_target_leaves() {
        let (bus, upstream) = fake_bus();
        let a = bus.listen("some-channel", QueueMode::Queue).await.unwrap();
        let mut b = bus.listen("some-channel", QueueMode::Queue).await.unwrap();

        bus.unlisten(a).await.unwrap();
        assert!(upstream.unlistened.lock().unwrap().is_empty());

        // the remaining listener still receives
        upstream.notify("some-channel", "").await;
        assert!(b.recv().await.is_some());

        bus.unlisten(b).await.unwrap();
        assert_eq!(
            *upstream.unlistened.lock().unwrap(),
            vec!["some-channel".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn listen_failure_surfaces_and_rolls_back() {
        let (bus, upstream) = fake_bus();
        upstream.fail_listen.store(true, Ordering::SeqCst);

        assert!(bus.listen("some-channel", QueueMode::Queue).await.is_err());

        // registration was rolled back, so the next listen subscribes again
        upstream.fail_listen.store(false, Ordering::SeqCst);
        let _a = bus.listen("some-channel", QueueMode::Queue).await.unwrap();
        assert_eq!(
            *upstream.listened.lock().unwrap(),
            vec!["some-channel".to_string()]
        );
    }
}
