//! Error types for the console core.
//!
//! - [`StoreError`]: failures reported by a [`DocumentStore`](crate::store::DocumentStore).
//! - [`ConsoleError`]: everything a caller of the console can see.
//!
//! Both expose `as_label()` for logs and HTTP error bodies.

use thiserror::Error;

/// Errors raised by a document store implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// A document exists but its contents could not be interpreted.
    #[error("malformed document at {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "store_unavailable",
            StoreError::Malformed(_) => "store_malformed",
        }
    }
}

/// # Errors surfaced by console operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConsoleError {
    /// Registration fields missing or malformed; nothing was written.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A source with this name is already registered.
    #[error("source already registered: {0}")]
    DuplicateSource(String),

    /// The referenced source is not part of the current registry.
    #[error("source not found: {0}")]
    NotFound(String),

    /// The ingest URL has too few segments to derive a playback URL.
    #[error("cannot derive playback url from {0:?}")]
    InvalidStreamUrl(String),

    /// The document store failed. Transient unless raised while bootstrapping.
    #[error("store operation failed: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// One or more steps of a cascading removal failed.
    #[error("removal of {source_id} incomplete; failed steps: {failed:?}")]
    PartialCascadeFailure {
        source_id: String,
        failed: Vec<String>,
    },

    /// The analysis worker rejected the request or could not be reached.
    #[error("analysis control endpoint failed: {0}")]
    ControlEndpointFailure(String),

    /// The video player could not be created.
    #[error("player failed: {0}")]
    PlayerFailure(String),
}

impl ConsoleError {
    /// Returns a short stable label (snake_case) for logs and API responses.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConsoleError::InvalidInput(_) => "invalid_input",
            ConsoleError::DuplicateSource(_) => "duplicate_source",
            ConsoleError::NotFound(_) => "not_found",
            ConsoleError::InvalidStreamUrl(_) => "invalid_stream_url",
            ConsoleError::StoreUnavailable(_) => "store_unavailable",
            ConsoleError::PartialCascadeFailure { .. } => "partial_cascade_failure",
            ConsoleError::ControlEndpointFailure(_) => "control_endpoint_failure",
            ConsoleError::PlayerFailure(_) => "player_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts_to_store_unavailable() {
        let err: ConsoleError = StoreError::Unavailable("offline".into()).into();
        assert_eq!(err.as_label(), "store_unavailable");
        assert_eq!(err.to_string(), "store operation failed: unavailable: offline");
    }

    #[test]
    fn test_partial_cascade_message_lists_steps() {
        let err = ConsoleError::PartialCascadeFailure {
            source_id: "cam1".into(),
            failed: vec!["fire_detection".into()],
        };
        assert_eq!(err.as_label(), "partial_cascade_failure");
        assert!(err.to_string().contains("fire_detection"));
    }
}
