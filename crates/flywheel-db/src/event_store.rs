//! Durable, ordered, per-build event log with offset-based paginated reads.
//!
//! Events live in one physical partition per pipeline (or per team, for
//! one-off builds), all inheriting from a logical `build_events` table. A
//! build's partition is fixed for its entire lifetime. Event ids come from
//! the build's own sequence: unique and strictly increasing within the
//! build, but not necessarily contiguous.

use std::collections::HashMap;
use std::sync::Arc;

use flywheel_core::{Build, BuildRef, Envelope, EventType};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::build::build_events_channel;
use crate::bus::NotificationsBus;
use crate::error::DbResult;
use crate::sequence;

/// Opaque position into a build's event stream.
///
/// Internally a zero-based offset of the last returned event, re-validated
/// on every read; only [`BuildEventStore::get`] ever advances it. The
/// default cursor means "start of stream."
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(Option<u64>);

impl Cursor {
    /// Offset of the next event to read.
    fn next_offset(&self) -> u64 {
        match self.0 {
            Some(last) => last + 1,
            None => 0,
        }
    }

    fn advance(&mut self, returned: usize) {
        if returned > 0 {
            self.0 = Some(self.next_offset() + returned as u64 - 1);
        }
    }
}

/// The physical partition holding the build's events.
pub(crate) fn events_table(build: &impl Build) -> String {
    match build.pipeline_id() {
        Some(pipeline_id) => format!("pipeline_build_events_{pipeline_id}"),
        None => format!("team_build_events_{}", build.team_id()),
    }
}

pub struct BuildEventStore {
    pool: PgPool,
    bus: Arc<NotificationsBus>,
}

impl BuildEventStore {
    pub fn new(pool: PgPool, bus: Arc<NotificationsBus>) -> Self {
        Self { pool, bus }
    }

    /// Idempotently ensure the logical table and indexes backing all events
    /// exist. Safe to call from multiple processes at startup.
    pub async fn setup(&self) -> DbResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS build_events (
                build_id integer,
                type varchar NOT NULL,
                payload text NOT NULL,
                event_id integer NOT NULL,
                version text NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS build_events_build_id_idx
                ON build_events (build_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS build_events_build_id_event_id
                ON build_events (build_id, event_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Provision the build's partition (shared with sibling builds, so
    /// idempotent) and its event-id sequence (per build, so not).
    pub async fn initialize(&self, build: &impl Build) -> DbResult<()> {
        let table = events_table(build);

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} () INHERITS (build_events)"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_build_id ON {table} (build_id)"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {table}_build_id_event_id
                ON {table} (build_id, event_id)"
        ))
        .execute(&self.pool)
        .await?;

        sequence::initialize(&self.pool, build.id()).await
    }

    /// Drop the build's sequence. The partition persists for sibling builds.
    pub async fn finalize(&self, build: &impl Build) -> DbResult<()> {
        sequence::finalize(&self.pool, build.id()).await
    }

    /// Append a batch atomically, in input order, then wake anyone tailing
    /// the build's event channel.
    pub async fn put(
        &self,
        build: &impl Build,
        events: &[flywheel_core::BuildEvent],
    ) -> DbResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let table = events_table(build);
        let mut tx = self.pool.begin().await?;

        let ids = sequence::allocate(&mut *tx, build.id(), events.len()).await?;

        let mut insert = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {table} (event_id, build_id, type, version, payload) "
        ));
        insert.push_values(ids.zip(events.iter()), |mut b, (event_id, event)| {
            b.push_bind(event_id)
                .push_bind(build.id())
                .push_bind(event.event_type().as_str().to_string())
                .push_bind(event.version())
                .push_bind(event.data().to_string());
        });
        insert.build().execute(&mut *tx).await?;

        tx.commit().await?;

        self.bus.notify(&build_events_channel(build.id())).await
    }

    /// Read up to `requested` events strictly after the cursor, in event-id
    /// order, advancing the cursor in place. A short page means the stream
    /// is exhausted at that position (for now).
    pub async fn get(
        &self,
        build: &impl Build,
        requested: usize,
        cursor: &mut Cursor,
    ) -> DbResult<Vec<Envelope>> {
        let table = events_table(build);

        let rows: Vec<(String, String, String)> = sqlx::query_as(&format!(
            "SELECT type, version, payload FROM {table}
                WHERE build_id = $1
                ORDER BY event_id ASC
                OFFSET $2 LIMIT $3"
        ))
        .bind(build.id())
        .bind(cursor.next_offset() as i64)
        .bind(requested as i64)
        .fetch_all(&self.pool)
        .await?;

        let events = rows
            .into_iter()
            .map(|(event_type, version, payload)| {
                Ok(Envelope {
                    event: EventType::new(event_type),
                    version,
                    data: serde_json::from_str(&payload)?,
                })
            })
            .collect::<DbResult<Vec<Envelope>>>()?;

        cursor.advance(events.len());
        Ok(events)
    }

    /// Bulk-remove all events for the given builds. No-op on empty input.
    pub async fn delete(&self, builds: &[BuildRef]) -> DbResult<()> {
        if builds.is_empty() {
            return Ok(());
        }

        let mut by_table: HashMap<String, Vec<i32>> = HashMap::new();
        for build in builds {
            by_table
                .entry(events_table(build))
                .or_default()
                .push(build.id());
        }

        for (table, build_ids) in by_table {
            sqlx::query(&format!("DELETE FROM {table} WHERE build_id = ANY($1)"))
                .bind(build_ids)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    /// Drop the partition for all builds ever owned by the pipeline.
    /// Irreversible; only for cascading deletion of the pipeline itself.
    pub async fn delete_pipeline(&self, pipeline_id: i32) -> DbResult<()> {
        sqlx::query(&format!(
            "DROP TABLE IF EXISTS pipeline_build_events_{pipeline_id}"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop the team's one-off partition and the partitions of every
    /// pipeline the team owns.
    pub async fn delete_team(&self, team_id: i32) -> DbResult<()> {
        let pipeline_ids: Vec<i32> =
            sqlx::query_scalar("SELECT id FROM pipelines WHERE team_id = $1")
                .bind(team_id)
                .fetch_all(&self.pool)
                .await?;

        for pipeline_id in pipeline_ids {
            self.delete_pipeline(pipeline_id).await?;
        }

        sqlx::query(&format!("DROP TABLE IF EXISTS team_build_events_{team_id}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
