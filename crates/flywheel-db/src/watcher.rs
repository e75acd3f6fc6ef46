//! Best-effort tracking of which builds currently have live log viewers.
//!
//! There is no reliable cross-process signal for "viewer disconnected" (the
//! viewer may be on a different node than the build), so presence is
//! approximated: viewers re-mark the build's channel while tailing, and a
//! sweeper removes entries that are both past a retention window and belong
//! to a build that has completed or cannot be resolved. Watching is a
//! process-wide fact; construct one marker per process and share it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::build::{BuildCompletion, build_id_from_events_channel};
use crate::bus::{NotificationsBus, QueueMode};
use crate::error::DbResult;

/// Shared channel carrying "this build's event channel has a viewer" marks.
pub const BUILD_BEING_WATCHED_CHANNEL: &str = "build_being_watched";

/// How long a mark keeps an entry alive regardless of build state. Bounds
/// the completion-query rate for busy channels.
pub const DEFAULT_WATCH_RETENTION: Duration = Duration::from_secs(2 * 60 * 60);

/// Announce that someone started tailing the build's events. Any process
/// may call this; every process's marker observes it.
pub async fn mark_build_as_being_watched(
    bus: &NotificationsBus,
    events_channel: &str,
) -> DbResult<()> {
    bus.notify_payload(BUILD_BEING_WATCHED_CHANNEL, events_channel)
        .await
}

pub struct BuildBeingWatchedMarker {
    watched: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    completion: Arc<dyn BuildCompletion>,
    retention: chrono::Duration,
    stop: watch::Sender<bool>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl BuildBeingWatchedMarker {
    pub async fn new(
        bus: Arc<NotificationsBus>,
        completion: Arc<dyn BuildCompletion>,
    ) -> DbResult<Self> {
        Self::with_retention(bus, completion, DEFAULT_WATCH_RETENTION).await
    }

    pub async fn with_retention(
        bus: Arc<NotificationsBus>,
        completion: Arc<dyn BuildCompletion>,
        retention: Duration,
    ) -> DbResult<Self> {
        // queued: marks carry distinct payloads and must not coalesce
        let mut listener = bus
            .listen(BUILD_BEING_WATCHED_CHANNEL, QueueMode::Queue)
            .await?;

        let watched: Arc<Mutex<HashMap<String, DateTime<Utc>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let listener_task = {
            let watched = Arc::clone(&watched);
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        notification = listener.recv() => match notification {
                            Some(n) if n.healthy && !n.payload.is_empty() => {
                                watched.lock().unwrap().insert(n.payload, Utc::now());
                            }
                            // reconnects carry nothing to re-check; marks
                            // are best-effort by design
                            Some(_) => {}
                            None => break,
                        },
                    }
                }

                if let Err(e) = bus.unlisten(listener).await {
                    debug!(error = %e, "failed to release being-watched subscription");
                }
            })
        };

        Ok(Self {
            watched,
            completion,
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
            stop: stop_tx,
            listener_task: Mutex::new(Some(listener_task)),
        })
    }

    /// True iff the channel was marked and has not been swept.
    pub fn being_watched(&self, events_channel: &str) -> bool {
        self.watched.lock().unwrap().contains_key(events_channel)
    }

    /// Sweep entries past the retention window whose build is completed or
    /// unresolvable (an unresolvable id is assumed to belong to a
    /// short-lived check build that already finished). Entries within the
    /// window are never swept, whatever the build's state.
    pub async fn run(&self) -> DbResult<()> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let watched = self.watched.lock().unwrap();
            watched
                .iter()
                .filter(|(_, marked_at)| now - **marked_at > self.retention)
                .map(|(channel, _)| channel.clone())
                .collect()
        };

        for channel in expired {
            let gone = match build_id_from_events_channel(&channel) {
                Some(build_id) => self.completion.lookup(build_id).await?.unwrap_or(true),
                None => {
                    debug!(channel, "sweeping unparseable being-watched channel");
                    true
                }
            };

            if gone {
                self.watched.lock().unwrap().remove(&channel);
            }
        }

        Ok(())
    }

    /// Stop the listener task and wait for it to exit.
    pub async fn drain(&self) {
        let _ = self.stop.send(true);
        let task = self.listener_task.lock().unwrap().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
    }
}
