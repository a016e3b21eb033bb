//! Error types for the distribution queue.

use thiserror::Error;

/// Result type alias for distribution queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the distribution queue.
///
/// Variants are `Clone` so that shared cleanup futures can hand the same
/// failure to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A destination storage server was removed while keys were moving.
    /// The relocator retries team selection after a delay.
    #[error("move targeted a removed server")]
    MoveToRemovedServer,

    /// No destination team could be found for a restored data move.
    #[error("destination team not found for data move")]
    DataMoveDestTeamNotFound,

    /// The underlying data move was cancelled externally.
    #[error("data move cancelled")]
    DataMoveCancelled,

    /// The task driving an operation was cancelled. Normal control flow,
    /// never surfaced through the queue error channel.
    #[error("operation cancelled")]
    Cancelled,

    /// A peer shut down while we were waiting on its reply. Fatal for the
    /// queue actor.
    #[error("peer dropped its reply promise")]
    BrokenPromise,

    /// A concurrent distributor mutated the move-keys metadata. Fatal.
    #[error("conflicting move-keys transaction")]
    MoveKeysConflict,

    /// Cluster metadata transaction failed.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Team collection request failed.
    #[error("team collection error: {0}")]
    Team(String),

    /// Metrics oracle request failed.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the error kinds that are swallowed silently rather than
    /// surfaced through the queue-wide error channel.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DataMoveCancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_kinds() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::DataMoveCancelled.is_cancellation());
        assert!(!Error::MoveToRemovedServer.is_cancellation());
        assert!(!Error::BrokenPromise.is_cancellation());
        assert!(!Error::DataMoveDestTeamNotFound.is_cancellation());
    }

    #[test]
    fn test_display() {
        let err = Error::Metadata("lost lease".to_string());
        assert_eq!(err.to_string(), "metadata error: lost lease");
    }
}
