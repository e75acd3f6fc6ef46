//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("notification bus closed")]
    BusClosed,

    /// The build completed and every event has been delivered. Expected
    /// stream terminator, not a failure.
    #[error("end of build event stream")]
    EndOfBuildEventStream,

    /// The consumer closed the stream.
    #[error("build event stream closed")]
    BuildEventStreamClosed,
}

pub type DbResult<T> = std::result::Result<T, DbError>;
