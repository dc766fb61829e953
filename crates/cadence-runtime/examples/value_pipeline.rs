//! Value pipeline example for Cadence
//!
//! This example demonstrates:
//! - Nested value blocks evaluated at event start
//! - `getEventValue`: a sub-chain whose `returnValue` feeds a parameter
//! - Chain-scoped variables
//! - The fast in-process pipeline for pure value work

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use cadence_core::prelude::*;
use cadence_core::value::param_f64;
use cadence_runtime::{Engine, EngineConfig};

/// Writes `sum = a + b` into its own chain scope.
struct AddNumbers;

#[async_trait]
impl EventHandler for AddNumbers {
    async fn run(&self, params: ParamMap, info: LiveInfo, ctl: Arc<dyn EngineCtl>) {
        if info.run_mode != RunMode::Start || info.is_unfreezing() {
            return;
        }
        if let (Some(a), Some(b)) = (param_f64(&params, "a"), param_f64(&params, "b")) {
            ctl.set_variable("sum", json!(a + b), Some(&info.chain_id), info.is_fast)
                .await;
        }
    }
}

/// Prints the `amount` parameter it received.
struct ApplyDamage;

#[async_trait]
impl EventHandler for ApplyDamage {
    async fn run(&self, params: ParamMap, info: LiveInfo, _ctl: Arc<dyn EngineCtl>) {
        if info.run_mode != RunMode::Start {
            return;
        }
        println!(
            "applyDamage received amount = {}{}",
            params.get("amount").cloned().unwrap_or(serde_json::Value::Null),
            if info.is_fast { " (fast)" } else { "" },
        );
    }
}

fn damage_block() -> EventBlock {
    let amount = ValueBlock::new("basic", "getEventValue")
        .with_params(json!({
            "events": [
                serde_json::to_value(
                    EventBlock::new("game", "add").with_params(json!({"a": 10, "b": 5}))
                )
                .unwrap(),
                serde_json::to_value(EventBlock::new("basic", "returnValue").with_params(json!({
                    "value": ValueBlock::new("basic", "getVariable")
                        .with_params(json!({"name": "sum"}))
                        .into_value()
                })))
                .unwrap(),
            ]
        }))
        .into_value();
    EventBlock::new("game", "applyDamage").with_params(json!({ "amount": amount }))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Cadence Value Pipeline Example ===\n");

    let mut registry = TypeRegistry::new();
    registry.register_event_group(
        "gameEvents",
        vec![
            ("add", EventTypeDef::new(Arc::new(AddNumbers))),
            ("applyDamage", EventTypeDef::new(Arc::new(ApplyDamage))),
        ],
    );

    let config =
        EngineConfig::default().with_elapsed_time_path(ItemPath::new("clock", "main", "elapsed"));
    let engine = Engine::new(registry, config);
    engine.set_elapsed_time(0.0).await?;

    // normal mode: the sub-chain runs as real live events
    engine.run_event(damage_block(), RunOptions::default()).await;
    engine.settle().await?;

    // fast mode: same pipeline, no live-event records allocated
    engine
        .run_events(vec![damage_block()], RunOptions::default().fast())
        .await;
    engine.settle().await?;

    assert!(engine.live_event_ids().await?.is_empty());
    println!("\n=== Example Complete ===");
    Ok(())
}
