use mailpipe_core::status::EmailStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-concurrency failure: the row's status was not the expected
    /// one. Carries the status actually observed.
    #[error("conflict: status is '{current}', expected '{expected}'")]
    Conflict { expected: EmailStatus, current: EmailStatus },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: EmailStatus, to: EmailStatus },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn from_sqlx(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::InvalidData(e.to_string()),
        }
    }
}

/// Transient errors are retried inside the store with bounded backoff.
pub fn is_transient(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}
