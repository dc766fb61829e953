//! Engine error types
//!
//! Lookup failures are non-fatal at runtime: the effects log the typed
//! error and skip the affected transition. The same types come back
//! directly from the fallible entry points (registry lookups, the engine
//! drivers).

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown event type: {group}.{name}")]
    UnknownEventType { group: String, name: String },

    #[error("unknown value type: {group}.{name}")]
    UnknownValueType { group: String, name: String },

    #[error("chain not found: {0}")]
    MissingChain(String),

    #[error("live event not found: {0}")]
    MissingLiveEvent(String),

    #[error("no elapsed-time path for live event: {0}")]
    MissingElapsedTime(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
