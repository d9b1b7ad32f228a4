use thiserror::Error;

/// Errors surfaced by the durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The addressed row does not exist (or is soft-deleted for live reads).
    #[error("not found")]
    NotFound,

    /// A unique name constraint was violated.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// Hard delete attempted while finalizers remain or the resource was
    /// never soft-deleted.
    #[error("finalizers present or resource not marked for deletion")]
    FinalizersPresent,

    /// A state-based guard rejected the mutation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Connection or query failure; safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// A stored row could not be decoded into its model type.
    #[error("corrupt row: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether the caller may retry the operation unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            if db_err.code() == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION {
                return StoreError::Conflict(db_err.message().to_string());
            }
        }
        StoreError::Transient(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        StoreError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(StoreError::Transient("connection reset".into()).is_transient());
        assert!(!StoreError::NotFound.is_transient());
        assert!(!StoreError::FinalizersPresent.is_transient());
        assert!(!StoreError::DuplicateName("r1".into()).is_transient());
    }
}
