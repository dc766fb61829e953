//! Time watcher.
//!
//! One watch per live event, keyed by live ID, observing the event's
//! elapsed-time signal. When the signal reaches the goal end time the event
//! is written to `end` and the lifecycle finalizes it. Watches are dropped
//! with the live-event record.

use std::sync::Arc;

use cadence_core::store::ItemPath;
use cadence_core::types::{LiveId, RunMode};

use crate::engine::EngineShared;

/// React to one host-item change: re-check every event watching that path.
pub(crate) async fn on_item_changed(shared: &Arc<EngineShared>, path: &ItemPath) {
    let watching: Vec<LiveId> = {
        let watchers = shared.lock_watchers();
        watchers
            .iter()
            .filter(|(_, watched)| *watched == path)
            .map(|(id, _)| id.clone())
            .collect()
    };
    for live_id in watching {
        check_goal(shared, &live_id).await;
    }
}

/// End a started event whose elapsed-time signal has reached its goal.
/// Frozen, queued, and finalized events are left alone; an infinite goal
/// waits for an external transition.
pub(crate) async fn check_goal(shared: &Arc<EngineShared>, live_id: &str) {
    let live = match shared.store.live_event(live_id).await {
        Ok(Some(live)) => live,
        _ => return,
    };
    if live.now_run_mode != RunMode::Start || !live.has_started() {
        return;
    }
    let Some(goal) = live.goal_end_time else {
        return;
    };
    if !goal.is_finite() {
        return;
    }

    let elapsed = shared.elapsed_for(&live).await;
    if elapsed >= goal {
        tracing::debug!(live_id = %live_id, elapsed, goal, "goal reached, ending event");
        let mut live = live;
        live.now_run_mode = RunMode::End;
        if let Err(err) = shared.store.put_live_event(live).await {
            tracing::warn!(live_id = %live_id, error = %err, "end write failed");
        }
    }
}
