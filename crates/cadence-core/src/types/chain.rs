//! Chain type definitions
//!
//! A chain is an ordered queue of live-event IDs plus the metadata the
//! scheduler and variable store need. A chain whose ID equals a live event's
//! ID is a sub-chain of that event.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::block::EventBlock;

/// Type alias for chain IDs
pub type ChainId = String;

/// An ordered queue of live events with chain-scoped state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    /// Unique identifier; equals a live-event ID for sub-chains
    pub id: ChainId,
    /// Queue of live-event IDs, head first
    #[serde(default)]
    pub live_event_ids: Vec<String>,
    /// Parent chain for variable-scope fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_chain_id: Option<ChainId>,
    /// Whether the scheduler may activate this chain's head.
    /// Sub-chains stay gated until their parent live event leaves `add`.
    #[serde(default = "default_true")]
    pub can_auto_activate: bool,
    /// Blocks parked because their live ID collided with an existing record,
    /// re-added once the old record is removed
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub duplicate_events_to_add: HashMap<String, EventBlock>,
    /// Chain-scoped variables
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables_by_name: HashMap<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Chain {
    /// Create a new empty chain
    pub fn new(id: impl Into<ChainId>) -> Self {
        Self {
            id: id.into(),
            live_event_ids: Vec::new(),
            parent_chain_id: None,
            can_auto_activate: true,
            duplicate_events_to_add: HashMap::new(),
            variables_by_name: HashMap::new(),
        }
    }

    /// Set the parent chain link
    pub fn with_parent(mut self, parent_chain_id: impl Into<ChainId>) -> Self {
        self.parent_chain_id = Some(parent_chain_id.into());
        self
    }

    /// Set the activation gate
    pub fn with_auto_activate(mut self, can_auto_activate: bool) -> Self {
        self.can_auto_activate = can_auto_activate;
        self
    }

    /// Position of a live event in the queue
    pub fn position_of(&self, live_id: &str) -> Option<usize> {
        self.live_event_ids.iter().position(|id| id == live_id)
    }

    /// Check if the queue is empty
    pub fn is_drained(&self) -> bool {
        self.live_event_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chain_defaults_on_deserialize() {
        let chain: Chain = serde_json::from_value(json!({"id": "c1"})).unwrap();
        assert!(chain.can_auto_activate);
        assert!(chain.live_event_ids.is_empty());
        assert!(chain.is_drained());
    }

    #[test]
    fn test_chain_position_lookup() {
        let mut chain = Chain::new("c1");
        chain.live_event_ids = vec!["a".into(), "b".into()];
        assert_eq!(chain.position_of("b"), Some(1));
        assert_eq!(chain.position_of("c"), None);
    }
}
