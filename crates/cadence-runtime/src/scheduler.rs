//! Chain scheduler.
//!
//! Reacts to queue and activation-gate changes: removes drained chains
//! (resolving any value resolver waiting on them and ending a waiting
//! parent event), and walks the queue head to pick the next activation
//! burst. Queue membership itself is written only by the lifecycle's
//! finalize step; the scheduler just reads it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use cadence_core::error::EngineError;
use cadence_core::types::{Chain, LiveEvent, LiveId, RunMode};

use crate::command::Command;
use crate::engine::EngineShared;
use crate::lifecycle;

/// Walk the queue from the head and collect the IDs to activate.
///
/// The head is activatable only while in `add`. A non-parallel head is a
/// burst of one. A parallel head extends the burst across every following
/// parallel event still in `add`, stopping before a parallel event in any
/// other mode, and stopping at (but including) the first non-parallel event
/// still in `add`.
pub(crate) fn select_activatable(
    chain: &Chain,
    lives: &HashMap<LiveId, LiveEvent>,
) -> Vec<LiveId> {
    let mut selected = Vec::new();
    let Some(first_id) = chain.live_event_ids.first() else {
        return selected;
    };
    let Some(first) = lives.get(first_id) else {
        return selected;
    };
    if first.now_run_mode != RunMode::Add {
        return selected;
    }
    selected.push(first_id.clone());
    if !first.is_parallel {
        return selected;
    }

    for id in &chain.live_event_ids[1..] {
        match lives.get(id) {
            None => break,
            Some(live) if !live.is_parallel => {
                if live.now_run_mode == RunMode::Add {
                    selected.push(id.clone());
                }
                break;
            }
            Some(live) if live.now_run_mode != RunMode::Add => break,
            Some(_) => selected.push(id.clone()),
        }
    }
    selected
}

/// Length of the active prefix: the leading run of events that have left
/// `add`. Priority insertions land right after it.
pub(crate) fn active_prefix_len(chain: &Chain, lives: &HashMap<LiveId, LiveEvent>) -> usize {
    chain
        .live_event_ids
        .iter()
        .take_while(|id| {
            lives
                .get(*id)
                .map(|live| live.now_run_mode != RunMode::Add)
                .unwrap_or(true)
        })
        .count()
}

/// Load the live records of a chain's members.
pub(crate) async fn chain_members(
    shared: &Arc<EngineShared>,
    chain: &Chain,
) -> HashMap<LiveId, LiveEvent> {
    let mut lives = HashMap::new();
    for id in &chain.live_event_ids {
        match shared.store.live_event(id).await {
            Ok(Some(live)) => {
                lives.insert(id.clone(), live);
            }
            Ok(None) => {
                tracing::warn!(
                    chain_id = %chain.id,
                    error = %EngineError::MissingLiveEvent(id.clone()),
                    "queued live event missing"
                );
            }
            Err(err) => {
                tracing::warn!(live_id = %id, error = %err, "live event lookup failed");
            }
        }
    }
    lives
}

/// Check whether a live event is part of its chain's current activation
/// burst (used to decide between applying and parking a skip).
pub(crate) async fn is_activatable_now(shared: &Arc<EngineShared>, live: &LiveEvent) -> bool {
    let Ok(Some(chain)) = shared.store.chain(&live.chain_id).await else {
        return false;
    };
    if !chain.can_auto_activate {
        return false;
    }
    let lives = chain_members(shared, &chain).await;
    select_activatable(&chain, &lives)
        .iter()
        .any(|id| id == &live.id)
}

/// React to a queue or gate change on one chain.
pub(crate) async fn on_chain_changed(shared: &Arc<EngineShared>, chain_id: &str) {
    let chain = match shared.store.chain(chain_id).await {
        Ok(Some(chain)) => chain,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(chain_id = %chain_id, error = %err, "chain lookup failed");
            return;
        }
    };

    if chain.is_drained() {
        if !chain.duplicate_events_to_add.is_empty() {
            // a parked duplicate is about to be re-admitted
            return;
        }
        drain_chain(shared, chain).await;
        return;
    }
    if !chain.can_auto_activate {
        return;
    }
    activate(shared, &chain).await;
}

/// Activate the current burst: apply a parked mode when one is waiting,
/// otherwise write `start`.
async fn activate(shared: &Arc<EngineShared>, chain: &Chain) {
    let lives = chain_members(shared, chain).await;
    for id in select_activatable(chain, &lives) {
        let Some(live) = lives.get(&id) else { continue };
        let mut live = live.clone();
        if live.now_run_mode != RunMode::Add {
            continue;
        }
        match live.run_mode_options_when_ready.take() {
            Some(pending) => {
                tracing::debug!(live_id = %id, mode = %pending.mode, "applying parked run mode");
                if pending.run_by.is_some() {
                    live.run_by = pending.run_by;
                }
                live.now_run_mode = pending.mode;
            }
            None => {
                live.now_run_mode = RunMode::Start;
            }
        }
        if let Err(err) = shared.store.put_live_event(live).await {
            tracing::warn!(live_id = %id, error = %err, "activation write failed");
        }
    }
}

/// Remove a drained chain, resolve a value resolver waiting on it, and end
/// the parent event a sub-chain was holding open.
async fn drain_chain(shared: &Arc<EngineShared>, chain: Chain) {
    tracing::debug!(chain_id = %chain.id, "removing drained chain");
    if let Err(err) = shared.store.remove_chain(&chain.id).await {
        tracing::warn!(chain_id = %chain.id, error = %err, "chain removal failed");
    }

    // a sub-chain run for a value that never hit returnValue resolves to null
    lifecycle::resolve_value(shared, &chain.id, Value::Null);

    match shared.store.live_event(&chain.id).await {
        Ok(Some(mut parent)) if parent.has_started() && !parent.is_finalized() => {
            parent.goal_end_time = Some(0.0);
            if let Err(err) = shared.store.put_live_event(parent).await {
                tracing::warn!(live_id = %chain.id, error = %err, "parent goal reset failed");
            }
            shared.enqueue(Command::CheckEnd {
                live_id: chain.id.clone(),
            });
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(chain_id = %chain.id, error = %err, "parent lookup failed");
        }
    }
}
