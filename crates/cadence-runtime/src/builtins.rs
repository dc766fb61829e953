//! Built-in event and value types.
//!
//! Installed under the `basic` group at engine construction, skipping any
//! name the host registered itself:
//! - events: `returnValue` (resolve the nearest pending sub-chain value),
//!   `wait` (hold the event open for a duration of elapsed time)
//! - values: `combine`, `string`, `getVariable`, `getMyChainId`,
//!   `getEventValue`

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use cadence_core::ctl::{EngineCtl, LiveInfo, ValueRunInfo};
use cadence_core::registry::{
    EventHandler, EventTypeDef, TypeRegistry, ValueHandler, ValueTypeDef,
};
use cadence_core::types::{EventBlock, ParamMap, RunMode};
use cadence_core::value::{param_f64, ValueOutcome};

const BASIC_GROUP: &str = "basic";

/// Register the built-in types, leaving host-registered names untouched.
pub fn install_builtins(registry: &mut TypeRegistry) {
    let mut events: Vec<(&str, EventTypeDef)> = Vec::new();
    if !registry.has_event(BASIC_GROUP, "returnValue") {
        events.push(("returnValue", EventTypeDef::new(Arc::new(ReturnValue))));
    }
    if !registry.has_event(BASIC_GROUP, "wait") {
        events.push(("wait", EventTypeDef::new(Arc::new(Wait))));
    }
    if !events.is_empty() {
        registry.register_event_group(BASIC_GROUP, events);
    }

    let mut values: Vec<(&str, ValueTypeDef)> = Vec::new();
    if !registry.has_value(BASIC_GROUP, "combine") {
        values.push(("combine", ValueTypeDef::new(Arc::new(Combine))));
    }
    if !registry.has_value(BASIC_GROUP, "string") {
        values.push(("string", ValueTypeDef::new(Arc::new(StringValue))));
    }
    if !registry.has_value(BASIC_GROUP, "getVariable") {
        values.push(("getVariable", ValueTypeDef::new(Arc::new(GetVariable))));
    }
    if !registry.has_value(BASIC_GROUP, "getMyChainId") {
        values.push(("getMyChainId", ValueTypeDef::new(Arc::new(GetMyChainId))));
    }
    if !registry.has_value(BASIC_GROUP, "getEventValue") {
        values.push(("getEventValue", ValueTypeDef::new(Arc::new(GetEventValue))));
    }
    if !values.is_empty() {
        registry.register_value_group(BASIC_GROUP, values);
    }
}

/// Resolves the nearest pending sub-chain value above this event's chain
/// with its `value` parameter, then the remainder of that chain is
/// cancelled.
struct ReturnValue;

#[async_trait]
impl EventHandler for ReturnValue {
    async fn run(&self, params: ParamMap, info: LiveInfo, ctl: Arc<dyn EngineCtl>) {
        if info.run_mode != RunMode::Start || info.is_unfreezing() {
            return;
        }
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        ctl.resolve_event_value(&info.chain_id, value).await;
    }
}

/// Holds its live event open until `duration` units of elapsed time pass.
struct Wait;

#[async_trait]
impl EventHandler for Wait {
    async fn run(&self, params: ParamMap, info: LiveInfo, ctl: Arc<dyn EngineCtl>) {
        if info.run_mode != RunMode::Start || info.is_unfreezing() {
            return;
        }
        if info.is_fast {
            tracing::warn!(live_id = %info.live_id, "wait is a no-op in fast mode");
            return;
        }
        if let Some(duration) = param_f64(&params, "duration") {
            ctl.set_goal_end_time(&info.live_id, info.elapsed_time + duration)
                .await;
        }
    }
}

/// `a + b`: numeric addition when both sides are numbers, string
/// concatenation otherwise.
struct Combine;

fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ValueHandler for Combine {
    async fn run(
        &self,
        params: ParamMap,
        _info: ValueRunInfo,
        _ctl: Arc<dyn EngineCtl>,
    ) -> ValueOutcome {
        let a = params.get("a").cloned().unwrap_or(Value::Null);
        let b = params.get("b").cloned().unwrap_or(Value::Null);
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => ValueOutcome::Ready(Value::from(x + y)),
            _ => ValueOutcome::Ready(Value::String(format!(
                "{}{}",
                coerce_string(&a),
                coerce_string(&b)
            ))),
        }
    }
}

/// Identity: passes its `value` parameter through (evaluating any nested
/// value block on the way).
struct StringValue;

#[async_trait]
impl ValueHandler for StringValue {
    async fn run(
        &self,
        params: ParamMap,
        _info: ValueRunInfo,
        _ctl: Arc<dyn EngineCtl>,
    ) -> ValueOutcome {
        ValueOutcome::Ready(params.get("value").cloned().unwrap_or(Value::Null))
    }
}

/// Reads a scoped variable; the scope defaults to the evaluating event's
/// own chain.
struct GetVariable;

#[async_trait]
impl ValueHandler for GetVariable {
    async fn run(
        &self,
        params: ParamMap,
        info: ValueRunInfo,
        ctl: Arc<dyn EngineCtl>,
    ) -> ValueOutcome {
        let Some(name) = params.get("name").and_then(|v| v.as_str()) else {
            tracing::warn!(value_id = %info.value_id, "getVariable without a name");
            return ValueOutcome::Ready(Value::Null);
        };
        let scope_param = params.get("scope").and_then(|v| v.as_str());
        let scope = scope_param.or(info.parent_chain_id.as_deref());
        let value = ctl.get_variable(name, scope, info.is_fast).await;
        ValueOutcome::Ready(value.unwrap_or(Value::Null))
    }
}

/// The chain the evaluating event belongs to.
struct GetMyChainId;

#[async_trait]
impl ValueHandler for GetMyChainId {
    async fn run(
        &self,
        _params: ParamMap,
        info: ValueRunInfo,
        _ctl: Arc<dyn EngineCtl>,
    ) -> ValueOutcome {
        ValueOutcome::Ready(
            info.parent_chain_id
                .map(Value::String)
                .unwrap_or(Value::Null),
        )
    }
}

/// Runs its `events` as a sub-chain and yields whatever a descendant
/// `returnValue` produces (`null` when the sub-chain drains without one).
struct GetEventValue;

#[async_trait]
impl ValueHandler for GetEventValue {
    async fn run(
        &self,
        params: ParamMap,
        info: ValueRunInfo,
        _ctl: Arc<dyn EngineCtl>,
    ) -> ValueOutcome {
        let Some(raw) = params.get("events") else {
            tracing::warn!(value_id = %info.value_id, "getEventValue without events");
            return ValueOutcome::Ready(Value::Null);
        };
        match serde_json::from_value::<Vec<EventBlock>>(raw.clone()) {
            Ok(events) => ValueOutcome::Pending { events },
            Err(err) => {
                tracing::warn!(value_id = %info.value_id, error = %err, "getEventValue events malformed");
                ValueOutcome::Ready(Value::Null)
            }
        }
    }
}
