//! Error types for the persistence layer.

/// A failure reported by a [`DocumentStore`](crate::DocumentStore).
///
/// The split drives retry: transient errors are retried with backoff, fatal
/// ones are returned immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The store is unreachable, timed out, or returned a retryable error.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// The store rejected the request or returned unreadable data.
    /// Retrying won't help.
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

/// A persistence operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
    /// Every attempt in the retry budget failed.
    #[error("{operation} gave up after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: StorageError,
    },

    /// The store returned a non-retryable error.
    #[error("{operation} failed: {source}")]
    Fatal {
        operation: &'static str,
        #[source]
        source: StorageError,
    },
}
