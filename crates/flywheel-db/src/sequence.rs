//! Per-build event-id allocation.
//!
//! Each active build owns one database sequence, created at event-store
//! initialization and dropped at finalization. Allocation pulls a batch of
//! values in a single round trip; because the sequence only ever moves
//! forward, concurrent allocators on different connections are guaranteed
//! non-overlapping, strictly increasing ranges without any locking.

use sqlx::PgExecutor;

use crate::error::DbResult;

fn sequence_name(build_id: i32) -> String {
    format!("build_event_id_seq_{build_id}")
}

/// A batch of freshly allocated event ids. Yields each value exactly once,
/// in increasing order.
#[derive(Debug)]
pub struct IdBlock {
    ids: std::vec::IntoIter<i32>,
}

impl IdBlock {
    fn empty() -> Self {
        Self {
            ids: Vec::new().into_iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.len() == 0
    }
}

impl Iterator for IdBlock {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        self.ids.next()
    }
}

/// Create the build's sequence. Event ids are zero-based. Calling this twice
/// for the same build is an error and surfaces as one.
pub async fn initialize<'e>(executor: impl PgExecutor<'e>, build_id: i32) -> DbResult<()> {
    sqlx::query(&format!(
        "CREATE SEQUENCE {} MINVALUE 0 START WITH 0",
        sequence_name(build_id)
    ))
    .execute(executor)
    .await?;
    Ok(())
}

/// Drop the build's sequence. Fails if it was never initialized.
pub async fn finalize<'e>(executor: impl PgExecutor<'e>, build_id: i32) -> DbResult<()> {
    sqlx::query(&format!("DROP SEQUENCE {}", sequence_name(build_id)))
        .execute(executor)
        .await?;
    Ok(())
}

/// Allocate `count` sequential values. A zero count is a no-op returning an
/// empty block without touching the database.
pub async fn allocate<'e>(
    executor: impl PgExecutor<'e>,
    build_id: i32,
    count: usize,
) -> DbResult<IdBlock> {
    if count == 0 {
        return Ok(IdBlock::empty());
    }

    let ids: Vec<i64> = sqlx::query_scalar(&format!(
        "SELECT nextval('{}') FROM generate_series(1, $1)",
        sequence_name(build_id)
    ))
    .bind(count as i64)
    .fetch_all(executor)
    .await?;

    Ok(IdBlock {
        ids: ids
            .into_iter()
            .map(|id| id as i32)
            .collect::<Vec<_>>()
            .into_iter(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::lazy_pool;

    #[tokio::test]
    async fn zero_count_allocation_is_a_no_op() {
        // the lazy pool never connects; a zero allocation must not query
        let pool = lazy_pool();
        let block = allocate(&pool, 1, 0).await.unwrap();
        assert!(block.is_empty());
        assert_eq!(block.count(), 0);
    }

    #[test]
    fn id_block_yields_each_value_once_in_order() {
        let mut block = IdBlock {
            ids: vec![3, 4, 7].into_iter(),
        };

        assert_eq!(block.len(), 3);
        assert_eq!(block.next(), Some(3));
        assert_eq!(block.next(), Some(4));
        assert_eq!(block.next(), Some(7));
        assert_eq!(block.next(), None);
        assert_eq!(block.next(), None);
    }
}
