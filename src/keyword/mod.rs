//! Typed keyword model shared by dispatchers and clients.
//!
//! - [`KeywordType`]: translate/check/cast for each wire type
//! - [`History`]: bounded value history
//! - [`CallbackSet`]: weak-aware callback container

mod callback;
mod history;
mod types;

pub use callback::{BoxError, CallbackHandle, CallbackResult, CallbackSet};
pub use history::{History, HistoryEntry, HISTORY_CAPACITY};
pub use types::{Enumerators, KeywordType, Value};

/// Errors raised by the keyword layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeywordError {
    /// Unknown or malformed type tag.
    #[error("Type error: {0}")]
    Type(String),

    /// Value failed translation or validation.
    #[error("{0}")]
    Invalid(String),

    #[error("Keyword {0} is read-only")]
    ReadOnly(String),

    #[error("Keyword {0} is write-only")]
    WriteOnly(String),

    /// Raised by a prewrite hook to skip a write that would change nothing.
    #[error("No write necessary")]
    NoWriteNecessary,

    /// An authoritative read/write hook failed.
    #[error("{0}")]
    Hook(String),

    #[error("Keyword {0} has no value")]
    NoValue(String),
}
