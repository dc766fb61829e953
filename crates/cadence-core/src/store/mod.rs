//! Store module
//!
//! The state-store seam: chains, live events, and arbitrary host items live
//! behind the [`StateStore`] trait. Every write is diffed against the
//! previous record and journaled as a [`StateChange`], which is what the
//! runtime's effects react to.
//!
//! Note: Implementations are in the cadence-stores crate

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{Chain, ChainId, LiveEvent, LiveId, RunMode};

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Location of one host-owned field: `item_type.item_id.prop`.
///
/// The elapsed-time signal the engine watches lives at such a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, String, String)", into = "(String, String, String)")]
pub struct ItemPath {
    pub item_type: String,
    pub item_id: String,
    pub prop: String,
}

impl ItemPath {
    /// Create a new item path
    pub fn new(
        item_type: impl Into<String>,
        item_id: impl Into<String>,
        prop: impl Into<String>,
    ) -> Self {
        Self {
            item_type: item_type.into(),
            item_id: item_id.into(),
            prop: prop.into(),
        }
    }
}

impl From<(String, String, String)> for ItemPath {
    fn from((item_type, item_id, prop): (String, String, String)) -> Self {
        Self {
            item_type,
            item_id,
            prop,
        }
    }
}

impl From<ItemPath> for (String, String, String) {
    fn from(path: ItemPath) -> Self {
        (path.item_type, path.item_id, path.prop)
    }
}

impl std::fmt::Display for ItemPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.item_type, self.item_id, self.prop)
    }
}

/// A state mutation observed by the runtime's effects.
#[derive(Debug, Clone)]
pub enum StateChange {
    ChainAdded {
        chain_id: ChainId,
    },
    ChainQueueChanged {
        chain_id: ChainId,
    },
    ChainAutoActivateChanged {
        chain_id: ChainId,
    },
    ChainRemoved {
        chain_id: ChainId,
    },
    LiveEventAdded {
        live_id: LiveId,
    },
    RunModeChanged {
        live_id: LiveId,
        prev: Option<RunMode>,
        mode: RunMode,
    },
    LiveEventRemoved {
        live_id: LiveId,
        chain_id: ChainId,
    },
    ItemChanged {
        path: ItemPath,
    },
}

/// StateStore trait - the narrow contract the engine needs from its backing
/// reactive store.
///
/// Puts replace whole records; the implementation diffs against the previous
/// record and journals the resulting [`StateChange`]s in write order.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put_chain(&self, chain: Chain) -> Result<(), StoreError>;
    async fn chain(&self, id: &str) -> Result<Option<Chain>, StoreError>;
    async fn remove_chain(&self, id: &str) -> Result<bool, StoreError>;
    async fn chain_ids(&self) -> Result<Vec<ChainId>, StoreError>;

    async fn put_live_event(&self, live: LiveEvent) -> Result<(), StoreError>;
    async fn live_event(&self, id: &str) -> Result<Option<LiveEvent>, StoreError>;
    async fn remove_live_event(&self, id: &str) -> Result<bool, StoreError>;
    async fn live_event_ids(&self) -> Result<Vec<LiveId>, StoreError>;

    async fn set_item(&self, path: &ItemPath, value: Value) -> Result<(), StoreError>;
    async fn item(&self, path: &ItemPath) -> Result<Option<Value>, StoreError>;

    /// Take the journaled changes accumulated since the last drain
    async fn drain_changes(&self) -> Result<Vec<StateChange>, StoreError>;

    /// Subscribe to realtime change fan-out
    fn subscribe(&self) -> broadcast::Receiver<StateChange>;
}
