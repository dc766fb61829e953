//! In-memory StateStore implementation.
//!
//! Whole-record puts are diffed against the previous record and journaled
//! as `StateChange`s in write order; the same changes fan out on the bus.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use cadence_core::store::{ItemPath, StateChange, StateStore, StoreError};
use cadence_core::types::{Chain, ChainId, LiveEvent, LiveId};

use crate::bus::ChangeBus;

/// In-memory implementation for the engine's backing state.
pub struct InMemoryStateStore {
    chains: RwLock<HashMap<ChainId, Chain>>,
    live_events: RwLock<HashMap<LiveId, LiveEvent>>,
    items: RwLock<HashMap<ItemPath, Value>>,
    journal: Mutex<Vec<StateChange>>,
    bus: ChangeBus,
}

impl InMemoryStateStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            live_events: RwLock::new(HashMap::new()),
            items: RwLock::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
            bus: ChangeBus::default(),
        }
    }

    fn record(&self, change: StateChange) -> Result<(), StoreError> {
        let mut journal = self
            .journal
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        self.bus.publish(change.clone());
        journal.push(change);
        Ok(())
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put_chain(&self, chain: Chain) -> Result<(), StoreError> {
        let changes = {
            let mut chains = self
                .chains
                .write()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            let mut changes = Vec::new();
            match chains.get(&chain.id) {
                None => changes.push(StateChange::ChainAdded {
                    chain_id: chain.id.clone(),
                }),
                Some(prev) => {
                    if prev.live_event_ids != chain.live_event_ids {
                        changes.push(StateChange::ChainQueueChanged {
                            chain_id: chain.id.clone(),
                        });
                    }
                    if prev.can_auto_activate != chain.can_auto_activate {
                        changes.push(StateChange::ChainAutoActivateChanged {
                            chain_id: chain.id.clone(),
                        });
                    }
                }
            }
            chains.insert(chain.id.clone(), chain);
            changes
        };
        for change in changes {
            self.record(change)?;
        }
        Ok(())
    }

    async fn chain(&self, id: &str) -> Result<Option<Chain>, StoreError> {
        let chains = self
            .chains
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(chains.get(id).cloned())
    }

    async fn remove_chain(&self, id: &str) -> Result<bool, StoreError> {
        let removed = {
            let mut chains = self
                .chains
                .write()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            chains.remove(id).is_some()
        };
        if removed {
            self.record(StateChange::ChainRemoved {
                chain_id: id.to_string(),
            })?;
        }
        Ok(removed)
    }

    async fn chain_ids(&self) -> Result<Vec<ChainId>, StoreError> {
        let chains = self
            .chains
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(chains.keys().cloned().collect())
    }

    async fn put_live_event(&self, live: LiveEvent) -> Result<(), StoreError> {
        let change = {
            let mut lives = self
                .live_events
                .write()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            let change = match lives.get(&live.id) {
                None => Some(StateChange::LiveEventAdded {
                    live_id: live.id.clone(),
                }),
                Some(prev) if prev.now_run_mode != live.now_run_mode => {
                    Some(StateChange::RunModeChanged {
                        live_id: live.id.clone(),
                        prev: Some(prev.now_run_mode),
                        mode: live.now_run_mode,
                    })
                }
                Some(_) => None,
            };
            lives.insert(live.id.clone(), live);
            change
        };
        if let Some(change) = change {
            self.record(change)?;
        }
        Ok(())
    }

    async fn live_event(&self, id: &str) -> Result<Option<LiveEvent>, StoreError> {
        let lives = self
            .live_events
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(lives.get(id).cloned())
    }

    async fn remove_live_event(&self, id: &str) -> Result<bool, StoreError> {
        let removed = {
            let mut lives = self
                .live_events
                .write()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            lives.remove(id)
        };
        match removed {
            Some(live) => {
                self.record(StateChange::LiveEventRemoved {
                    live_id: id.to_string(),
                    chain_id: live.chain_id,
                })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn live_event_ids(&self) -> Result<Vec<LiveId>, StoreError> {
        let lives = self
            .live_events
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(lives.keys().cloned().collect())
    }

    async fn set_item(&self, path: &ItemPath, value: Value) -> Result<(), StoreError> {
        let changed = {
            let mut items = self
                .items
                .write()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            let changed = items.get(path) != Some(&value);
            items.insert(path.clone(), value);
            changed
        };
        if changed {
            self.record(StateChange::ItemChanged { path: path.clone() })?;
        }
        Ok(())
    }

    async fn item(&self, path: &ItemPath) -> Result<Option<Value>, StoreError> {
        let items = self
            .items
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(items.get(path).cloned())
    }

    async fn drain_changes(&self) -> Result<Vec<StateChange>, StoreError> {
        let mut journal = self
            .journal
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(std::mem::take(&mut *journal))
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::{EventBlock, RunMode};

    fn sample_live(id: &str, chain_id: &str) -> LiveEvent {
        LiveEvent::new(id, chain_id, EventBlock::new("game", "wait"), 0)
    }

    #[test]
    fn test_put_chain_journals_add_then_queue_change() {
        tokio_test::block_on(async {
            let store = InMemoryStateStore::new();
            let mut chain = Chain::new("c1");
            store.put_chain(chain.clone()).await.unwrap();

            chain.live_event_ids.push("L1".to_string());
            store.put_chain(chain).await.unwrap();

            let changes = store.drain_changes().await.unwrap();
            assert!(matches!(changes[0], StateChange::ChainAdded { .. }));
            assert!(matches!(changes[1], StateChange::ChainQueueChanged { .. }));
            assert_eq!(changes.len(), 2);
        });
    }

    #[test]
    fn test_put_live_event_journals_run_mode_transitions() {
        tokio_test::block_on(async {
            let store = InMemoryStateStore::new();
            let mut live = sample_live("L1", "c1");
            store.put_live_event(live.clone()).await.unwrap();

            live.now_run_mode = RunMode::Start;
            store.put_live_event(live.clone()).await.unwrap();

            // same mode again is not a transition
            store.put_live_event(live).await.unwrap();

            let changes = store.drain_changes().await.unwrap();
            assert_eq!(changes.len(), 2);
            assert!(matches!(changes[0], StateChange::LiveEventAdded { .. }));
            match &changes[1] {
                StateChange::RunModeChanged { prev, mode, .. } => {
                    assert_eq!(*prev, Some(RunMode::Add));
                    assert_eq!(*mode, RunMode::Start);
                }
                other => panic!("expected run mode change, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_item_writes_journal_only_real_changes() {
        tokio_test::block_on(async {
            let store = InMemoryStateStore::new();
            let path = ItemPath::new("clock", "main", "elapsed");
            store.set_item(&path, serde_json::json!(100.0)).await.unwrap();
            store.set_item(&path, serde_json::json!(100.0)).await.unwrap();
            store.set_item(&path, serde_json::json!(200.0)).await.unwrap();

            let changes = store.drain_changes().await.unwrap();
            assert_eq!(changes.len(), 2);
            assert_eq!(
                store.item(&path).await.unwrap(),
                Some(serde_json::json!(200.0))
            );
        });
    }

    #[test]
    fn test_remove_live_event_reports_owning_chain() {
        tokio_test::block_on(async {
            let store = InMemoryStateStore::new();
            store.put_live_event(sample_live("L1", "c9")).await.unwrap();
            store.drain_changes().await.unwrap();

            assert!(store.remove_live_event("L1").await.unwrap());
            assert!(!store.remove_live_event("L1").await.unwrap());

            let changes = store.drain_changes().await.unwrap();
            match &changes[0] {
                StateChange::LiveEventRemoved { live_id, chain_id } => {
                    assert_eq!(live_id, "L1");
                    assert_eq!(chain_id, "c9");
                }
                other => panic!("expected removal, got {:?}", other),
            }
        });
    }
}
