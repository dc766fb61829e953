//! Recursive parameter evaluation.
//!
//! Walks a parameter map and replaces every value block with its evaluated
//! raw value. A handler answering [`ValueOutcome::Pending`] leaves a hole:
//! the request is surfaced to the lifecycle, which runs the sub-chain and
//! re-evaluates with the resolution map once it produces a value. Already
//! resolved value IDs short-circuit, so impure values never run twice.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use cadence_core::ctl::ValueRunInfo;
use cadence_core::types::{ChainId, EventBlock, ParamMap, ValueBlock};
use cadence_core::value::{child_value_id, merge_defaults, ValueOutcome};

use crate::engine::EngineShared;

/// Provenance shared by every value evaluated for one live event.
#[derive(Debug, Clone)]
pub(crate) struct EvalInfo {
    pub parent_chain_id: Option<ChainId>,
    pub run_by: Option<String>,
    pub added_by: Option<String>,
    pub is_fast: bool,
}

/// A value awaiting a sub-chain run.
#[derive(Debug)]
pub(crate) struct PendingValueRequest {
    pub value_id: String,
    pub events: Vec<EventBlock>,
}

/// Evaluation result: the map with holes where values are still pending.
#[derive(Debug, Default)]
pub(crate) struct EvalOutput {
    pub params: ParamMap,
    pub pending: Vec<PendingValueRequest>,
}

/// Evaluate every parameter of a map. `prefix` is the owning live event's
/// ID; `resolved` carries sub-chain values produced by earlier rounds.
pub(crate) async fn evaluate_params(
    shared: &Arc<EngineShared>,
    params: &ParamMap,
    prefix: &str,
    info: &EvalInfo,
    resolved: &HashMap<String, Value>,
) -> EvalOutput {
    let mut output = EvalOutput::default();
    for (key, raw) in params {
        let value_id = child_value_id(prefix, key);
        match eval_value(shared, raw, value_id, info, resolved, &mut output.pending).await {
            Some(value) => {
                output.params.insert(key.clone(), value);
            }
            None => {
                // hole; filled on a later round once the sub-chain resolves
            }
        }
    }
    output
}

fn eval_value<'a>(
    shared: &'a Arc<EngineShared>,
    raw: &'a Value,
    value_id: String,
    info: &'a EvalInfo,
    resolved: &'a HashMap<String, Value>,
    pending: &'a mut Vec<PendingValueRequest>,
) -> Pin<Box<dyn Future<Output = Option<Value>> + Send + 'a>> {
    Box::pin(async move {
        let Some(block) = ValueBlock::from_value(raw) else {
            return Some(raw.clone());
        };

        if let Some(value) = resolved.get(&value_id) {
            return Some(value.clone());
        }

        let def = match shared.registry.value_def(&block.group, &block.name) {
            Ok(def) => def,
            Err(err) => {
                tracing::warn!(value_id = %value_id, error = %err, "value evaluation skipped");
                return Some(Value::Null);
            }
        };

        let merged = merge_defaults(&def.default_params, block.params);
        let mut inner = ParamMap::new();
        let mut has_hole = false;
        for (key, nested) in &merged {
            let child_id = child_value_id(&value_id, key);
            match eval_value(shared, nested, child_id, info, resolved, pending).await {
                Some(value) => {
                    inner.insert(key.clone(), value);
                }
                None => has_hole = true,
            }
        }
        if has_hole {
            // a nested value is still pending; this one runs next round
            return None;
        }

        let run_info = ValueRunInfo {
            value_id: value_id.clone(),
            parent_chain_id: info.parent_chain_id.clone(),
            run_by: info.run_by.clone(),
            added_by: info.added_by.clone(),
            is_fast: info.is_fast,
        };
        let handler = def.handler.clone();
        match handler.run(inner, run_info, shared.ctl()).await {
            ValueOutcome::Ready(value) => Some(value),
            ValueOutcome::Pending { events } => {
                tracing::debug!(value_id = %value_id, "value pending on sub-chain");
                pending.push(PendingValueRequest { value_id, events });
                None
            }
        }
    })
}
