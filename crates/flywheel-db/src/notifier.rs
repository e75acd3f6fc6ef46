//! Wait for a database-backed condition, with bus wake-ups.
//!
//! Used to observe state that flips exactly once and is announced on a
//! channel, such as a build being marked aborted. The condition is checked
//! immediately on registration (the announcement may have fired before the
//! subscription existed) and again on every wake, so the notification
//! payload is never trusted on its own.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::Db;
use crate::build::build_abort_channel;
use crate::bus::{NotificationsBus, QueueMode};
use crate::error::DbResult;

type Check = Box<dyn Fn() -> BoxFuture<'static, DbResult<bool>> + Send + Sync>;

pub struct ConditionNotifier {
    fired: tokio::sync::Mutex<mpsc::Receiver<()>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConditionNotifier {
    pub async fn new<F, Fut>(
        bus: Arc<NotificationsBus>,
        channel: &str,
        check: F,
    ) -> DbResult<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<bool>> + Send + 'static,
    {
        let check: Check = Box::new(move || Box::pin(check()));

        // a single pending wake is enough; the condition is re-read anyway
        let mut listener = bus.listen(channel, QueueMode::DontQueue).await?;
        let (fired_tx, fired_rx) = mpsc::channel(1);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                match check().await {
                    Ok(true) => {
                        let _ = fired_tx.try_send(());
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "condition check failed"),
                }

                tokio::select! {
                    _ = stop_rx.changed() => break,
                    notification = listener.recv() => {
                        if notification.is_none() {
                            break;
                        }
                    }
                }
            }

            if let Err(e) = bus.unlisten(listener).await {
                debug!(error = %e, "failed to release condition subscription");
            }
        });

        Ok(Self {
            fired: tokio::sync::Mutex::new(fired_rx),
            stop: stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Block until the condition has been observed true.
    pub async fn wait(&self) -> DbResult<()> {
        let mut fired = self.fired.lock().await;
        fired.recv().await.ok_or(crate::DbError::BusClosed)?;
        Ok(())
    }

    /// Stop watching; idempotent.
    pub async fn close(&self) {
        let _ = self.stop.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
    }
}

/// Resolves when the build is marked aborted.
pub async fn abort_notifier(db: &Db, build_id: i32) -> DbResult<ConditionNotifier> {
    let pool: PgPool = db.pool().clone();
    ConditionNotifier::new(
        Arc::clone(db.bus()),
        &build_abort_channel(build_id),
        move || {
            let pool = pool.clone();
            async move {
                let aborted: Option<bool> =
                    sqlx::query_scalar("SELECT aborted FROM builds WHERE id = $1")
                        .bind(build_id)
                        .fetch_optional(&pool)
                        .await?;
                Ok(aborted.unwrap_or(false))
            }
        },
    )
    .await
}
