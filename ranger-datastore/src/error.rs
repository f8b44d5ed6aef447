use ranger_proto::Subject;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatastoreError>;

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("subject not found: {0}")]
    SubjectNotFound(Subject),

    #[error("transaction on {0} lost to a concurrent committer")]
    TransactionConflict(Subject),

    #[error("a transaction is already held on {0}")]
    TransactionAlreadyHeld(Subject),

    #[error("backend error: {0}")]
    Backend(String),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
