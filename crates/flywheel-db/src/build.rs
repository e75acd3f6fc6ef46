//! Build-facing glue: notification channel names and completion lookup.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::DbResult;

pub const BUILD_EVENT_CHANNEL_PREFIX: &str = "build_events_";

/// Channel notified whenever new events land for the given build.
pub fn build_events_channel(build_id: i32) -> String {
    format!("{BUILD_EVENT_CHANNEL_PREFIX}{build_id}")
}

/// Channel notified when the given build is marked as aborted.
pub fn build_abort_channel(build_id: i32) -> String {
    format!("build_abort_{build_id}")
}

/// Inverse of [`build_events_channel`].
pub(crate) fn build_id_from_events_channel(channel: &str) -> Option<i32> {
    channel.strip_prefix(BUILD_EVENT_CHANNEL_PREFIX)?.parse().ok()
}

/// Read a build's completion flag.
#[async_trait]
pub trait BuildCompletion: Send + Sync {
    /// `Ok(None)` when the build cannot be resolved.
    async fn lookup(&self, build_id: i32) -> DbResult<Option<bool>>;
}

pub struct PgBuildCompletion {
    pool: PgPool,
}

impl PgBuildCompletion {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildCompletion for PgBuildCompletion {
    async fn lookup(&self, build_id: i32) -> DbResult<Option<bool>> {
        let completed: Option<bool> =
            sqlx::query_scalar("SELECT completed FROM builds WHERE id = $1")
                .bind(build_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_channel_names_round_trip() {
        assert_eq!(build_events_channel(42), "build_events_42");
        assert_eq!(build_id_from_events_channel("build_events_42"), Some(42));
        assert_eq!(build_id_from_events_channel("build_events_x"), None);
        assert_eq!(build_id_from_events_channel("other_channel"), None);
    }
}
