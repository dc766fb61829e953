//! Fast in-process pipeline.
//!
//! An alternative execution mode that allocates no live-event records and
//! bypasses the state store entirely: events run sequentially, in-process,
//! against an ephemeral chain-info map that mirrors parent links for
//! variable scoping. Cancellation marks the chain and its descendants and
//! the loop checks the flag between events. Duration-based waiting does not
//! exist here; the pipeline is meant for synchronous value work.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use cadence_core::ctl::{LiveInfo, ValueRunInfo};
use cadence_core::types::{EventBlock, ParamMap, RunMode, ValueBlock};
use cadence_core::value::{child_value_id, merge_defaults, ValueOutcome};

use crate::engine::EngineShared;
use crate::evaluate::EvalInfo;

/// Ephemeral record of one running fast chain.
#[derive(Debug, Default)]
pub(crate) struct FastChainInfo {
    pub parent_chain_id: Option<String>,
    pub variables: HashMap<String, Value>,
    pub is_canceled: bool,
    pub child_fast_chain_id: Option<String>,
    /// Set on chains run for a pending value; `return_value` fills the slot
    pub wants_return_value: bool,
    pub found_return_value: Option<Value>,
}

/// Run a block list as a fast chain. The caller owns the chain-info record
/// when `wants_return_value` is set (so it can read the slot afterwards);
/// otherwise the record is dropped on completion.
pub(crate) fn run_fast<'a>(
    shared: &'a Arc<EngineShared>,
    blocks: Vec<EventBlock>,
    chain_id: String,
    parent_chain_id: Option<String>,
    added_by: Option<String>,
    run_by: Option<String>,
    wants_return_value: bool,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        {
            let mut fast_chains = shared.lock_fast_chains();
            if let Some(parent_id) = &parent_chain_id {
                if let Some(parent) = fast_chains.get_mut(parent_id) {
                    parent.child_fast_chain_id = Some(chain_id.clone());
                }
            }
            fast_chains.insert(
                chain_id.clone(),
                FastChainInfo {
                    parent_chain_id: parent_chain_id.clone(),
                    wants_return_value,
                    ..FastChainInfo::default()
                },
            );
        }
        tracing::debug!(chain_id = %chain_id, count = blocks.len(), "fast chain started");

        for block in blocks {
            let canceled = {
                let fast_chains = shared.lock_fast_chains();
                fast_chains
                    .get(&chain_id)
                    .map(|info| info.is_canceled)
                    .unwrap_or(true)
            };
            if canceled {
                tracing::debug!(chain_id = %chain_id, "fast chain canceled");
                break;
            }

            let def = match shared.registry.event_def(&block.group, &block.name) {
                Ok(def) => def.clone(),
                Err(err) => {
                    tracing::warn!(chain_id = %chain_id, error = %err, "fast event skipped");
                    continue;
                }
            };
            let live_id = block
                .options
                .live_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let merged = merge_defaults(&def.default_params, block.params.clone());
            let info = EvalInfo {
                parent_chain_id: Some(chain_id.clone()),
                run_by: run_by.clone(),
                added_by: added_by.clone(),
                is_fast: true,
            };
            let params = eval_fast(shared, &merged, &live_id, &info).await;
            let live_info = fast_live_info(
                &live_id,
                &chain_id,
                parent_chain_id.clone(),
                run_by.clone(),
                added_by.clone(),
            );
            def.handler.run(params, live_info, shared.ctl()).await;
        }

        {
            let mut fast_chains = shared.lock_fast_chains();
            if let Some(parent_id) = &parent_chain_id {
                if let Some(parent) = fast_chains.get_mut(parent_id) {
                    if parent.child_fast_chain_id.as_deref() == Some(chain_id.as_str()) {
                        parent.child_fast_chain_id = None;
                    }
                }
            }
            if !wants_return_value {
                fast_chains.remove(&chain_id);
            }
        }
        tracing::debug!(chain_id = %chain_id, "fast chain finished");
    })
}

/// Evaluate a parameter map in fast mode. Pending values run their
/// sub-chain inline and read the return slot, so the result never has
/// holes.
pub(crate) async fn eval_fast(
    shared: &Arc<EngineShared>,
    params: &ParamMap,
    prefix: &str,
    info: &EvalInfo,
) -> ParamMap {
    let mut out = ParamMap::new();
    for (key, raw) in params {
        let value_id = child_value_id(prefix, key);
        out.insert(
            key.clone(),
            eval_fast_value(shared, raw, value_id, info).await,
        );
    }
    out
}

fn eval_fast_value<'a>(
    shared: &'a Arc<EngineShared>,
    raw: &'a Value,
    value_id: String,
    info: &'a EvalInfo,
) -> Pin<Box<dyn Future<Output = Value> + Send + 'a>> {
    Box::pin(async move {
        let Some(block) = ValueBlock::from_value(raw) else {
            return raw.clone();
        };
        let def = match shared.registry.value_def(&block.group, &block.name) {
            Ok(def) => def.clone(),
            Err(err) => {
                tracing::warn!(value_id = %value_id, error = %err, "fast value skipped");
                return Value::Null;
            }
        };

        let merged = merge_defaults(&def.default_params, block.params);
        let mut inner = ParamMap::new();
        for (key, nested) in &merged {
            let child_id = child_value_id(&value_id, key);
            inner.insert(
                key.clone(),
                eval_fast_value(shared, nested, child_id, info).await,
            );
        }

        let run_info = ValueRunInfo {
            value_id: value_id.clone(),
            parent_chain_id: info.parent_chain_id.clone(),
            run_by: info.run_by.clone(),
            added_by: info.added_by.clone(),
            is_fast: true,
        };
        match def.handler.run(inner, run_info, shared.ctl()).await {
            ValueOutcome::Ready(value) => value,
            ValueOutcome::Pending { events } => {
                run_fast(
                    shared,
                    events,
                    value_id.clone(),
                    info.parent_chain_id.clone(),
                    info.added_by.clone(),
                    info.run_by.clone(),
                    true,
                )
                .await;
                let mut fast_chains = shared.lock_fast_chains();
                fast_chains
                    .remove(&value_id)
                    .and_then(|info| info.found_return_value)
                    .unwrap_or(Value::Null)
            }
        }
    })
}

/// Walk up from a fast chain to the nearest one waiting on a return value,
/// fill its slot, and cancel it together with its descendants. Returns
/// false when no ancestor was waiting.
pub(crate) fn handle_fast_return(shared: &EngineShared, from_chain_id: &str, value: Value) -> bool {
    let mut fast_chains = shared.lock_fast_chains();

    let mut target = None;
    let mut current = Some(from_chain_id.to_string());
    while let Some(chain_id) = current {
        match fast_chains.get(&chain_id) {
            None => break,
            Some(info) if info.wants_return_value => {
                target = Some(chain_id);
                break;
            }
            Some(info) => current = info.parent_chain_id.clone(),
        }
    }

    let Some(target) = target else {
        return false;
    };
    if let Some(info) = fast_chains.get_mut(&target) {
        info.found_return_value = Some(value);
    }
    cancel_tree(&mut fast_chains, &target);
    true
}

/// Mark a fast chain and its descendants canceled. Returns false when the
/// chain is unknown (e.g. already finished).
pub(crate) fn cancel_fast_chain(shared: &EngineShared, chain_id: &str) -> bool {
    let mut fast_chains = shared.lock_fast_chains();
    if !fast_chains.contains_key(chain_id) {
        return false;
    }
    cancel_tree(&mut fast_chains, chain_id);
    true
}

fn cancel_tree(fast_chains: &mut HashMap<String, FastChainInfo>, root: &str) {
    let mut current = Some(root.to_string());
    while let Some(chain_id) = current {
        match fast_chains.get_mut(&chain_id) {
            Some(info) => {
                info.is_canceled = true;
                current = info.child_fast_chain_id.clone();
            }
            None => break,
        }
    }
}

fn fast_live_info(
    live_id: &str,
    chain_id: &str,
    parent_chain_id: Option<String>,
    run_by: Option<String>,
    added_by: Option<String>,
) -> LiveInfo {
    let now = Utc::now().timestamp_millis();
    LiveInfo {
        live_id: live_id.to_string(),
        chain_id: chain_id.to_string(),
        parent_chain_id,
        run_mode: RunMode::Start,
        run_by,
        added_by,
        is_fast: true,
        elapsed_time: 0.0,
        remaining_time: None,
        goal_end_time: None,
        add_time: now,
        start_time: Some(now),
        pause_time: None,
        unpause_time: None,
        suspend_time: None,
        unsuspend_time: None,
        is_unpausing: false,
        is_unsuspending: false,
        is_first_add: true,
        is_first_start: true,
        is_first_pause: true,
        is_first_suspend: true,
    }
}
