//! Basic usage example for Cadence
//!
//! This example demonstrates:
//! - Registering event types with handlers
//! - Running an ordered chain of events
//! - Driving the engine with an elapsed-time signal
//! - Pausing and resuming a chain without losing remaining time

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use cadence_core::prelude::*;
use cadence_core::value::param_f64;
use cadence_runtime::{Engine, EngineConfig};

/// Holds its event open for `duration` units of elapsed time.
struct Wait;

#[async_trait]
impl EventHandler for Wait {
    async fn run(&self, params: ParamMap, info: LiveInfo, ctl: Arc<dyn EngineCtl>) {
        if info.run_mode != RunMode::Start || info.is_unfreezing() {
            return;
        }
        if let Some(duration) = param_f64(&params, "duration") {
            ctl.set_goal_end_time(&info.live_id, info.elapsed_time + duration)
                .await;
        }
    }
}

/// Prints its message when started.
struct Announce;

#[async_trait]
impl EventHandler for Announce {
    async fn run(&self, params: ParamMap, info: LiveInfo, _ctl: Arc<dyn EngineCtl>) {
        if info.run_mode != RunMode::Start {
            return;
        }
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        println!("[t={}] {}", info.elapsed_time, message);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Cadence Basic Usage Example ===\n");

    let mut registry = TypeRegistry::new();
    registry.register_event_group(
        "demoEvents",
        vec![
            ("wait", EventTypeDef::new(Arc::new(Wait))),
            ("announce", EventTypeDef::new(Arc::new(Announce))),
        ],
    );

    let config =
        EngineConfig::default().with_elapsed_time_path(ItemPath::new("clock", "main", "elapsed"));
    let engine = Engine::new(registry, config);
    engine.set_elapsed_time(0.0).await?;

    let chain_id = engine
        .run_events(
            vec![
                EventBlock::new("demo", "announce")
                    .with_params(json!({"message": "sequence started"})),
                EventBlock::new("demo", "wait").with_params(json!({"duration": 1000.0})),
                EventBlock::new("demo", "announce")
                    .with_params(json!({"message": "one second later"})),
            ],
            RunOptions::default(),
        )
        .await;
    engine.settle().await?;

    // advance the clock; the wait ends at t=1000
    engine.set_elapsed_time(400.0).await?;
    engine.settle().await?;

    // freeze the whole chain mid-wait
    engine
        .chain_do(RunMode::Pause, &chain_id, ModeOptions::default())
        .await;
    engine.settle().await?;
    println!("paused at t=400 (600 remaining)");

    // time passing while paused has no effect
    engine.set_elapsed_time(2000.0).await?;
    engine.settle().await?;

    engine
        .chain_do(RunMode::Unpause, &chain_id, ModeOptions::default())
        .await;
    engine.settle().await?;
    println!("resumed at t=2000; wait now ends at t=2600");

    engine.set_elapsed_time(2600.0).await?;
    engine.settle().await?;

    assert!(engine.chain(&chain_id).await?.is_none());
    println!("\n=== Example Complete ===");
    Ok(())
}
