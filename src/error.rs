//! Crate-level error type.

use std::time::Duration;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::keyword::KeywordError;
use crate::protocol::ProtocolError;

/// Result type for fabric operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the client, dispatcher, and broker APIs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed frames.
    #[error("Parse error: {0}")]
    Parse(#[from] ProtocolError),

    /// The broker could not route a request.
    #[error("Routing error: {0}")]
    Routing(String),

    /// A dispatcher (or the broker on its behalf) answered with an error.
    #[error("Dispatcher error: {0}")]
    Dispatcher(String),

    /// The catalog assigns this keyword to another dispatcher.
    #[error("Keyword {keyword} belongs to dispatcher '{expected}', not '{actual}'")]
    WrongDispatcher {
        keyword: String,
        expected: String,
        actual: String,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Keyword not found: {0}")]
    KeyNotFound(String),

    /// No broker, or no dispatcher, could be reached for a service.
    #[error("Cannot locate service '{service}': {reason}")]
    Locate { service: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] tmq::TmqError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Keyword(#[from] KeywordError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Backend selection conflict.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The owning service is shutting down.
    #[error("Service is shut down")]
    Shutdown,

    /// A background task did not stop within the join timeout.
    #[error("Task '{0}' did not stop within the join timeout")]
    Join(&'static str),
}
