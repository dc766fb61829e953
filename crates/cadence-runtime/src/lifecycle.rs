//! Live-event lifecycle engine.
//!
//! Reacts to run-mode transitions: stamps times, evaluates parameters on
//! first start, computes goal end times, handles the pause/suspend freeze
//! math, dispatches user handlers, and finalizes completed events. The
//! transient `unpause`/`unsuspend` modes never reach user handlers; the
//! effective prior mode is re-dispatched and handlers observe it with the
//! unfreezing flags set.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use cadence_core::ctl::LiveInfo;
use cadence_core::types::{LiveEvent, ParamMap, RunMode};
use cadence_core::value::merge_defaults;

use crate::command::Command;
use crate::engine::{EngineShared, PendingStart};
use crate::evaluate::{evaluate_params, EvalInfo};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// React to one journaled run-mode transition.
pub(crate) async fn on_run_mode_changed(
    shared: &Arc<EngineShared>,
    live_id: &str,
    prev: Option<RunMode>,
    mode: RunMode,
) {
    let live = match shared.store.live_event(live_id).await {
        Ok(Some(live)) => live,
        Ok(None) => {
            tracing::debug!(live_id = %live_id, mode = %mode, "transition on missing live event ignored");
            return;
        }
        Err(err) => {
            tracing::warn!(live_id = %live_id, error = %err, "live event lookup failed");
            return;
        }
    };

    // leaving `add` opens this event's own sub-chain gate, and opens the
    // containing chain when the transition came from outside the scheduler
    if mode != RunMode::Add {
        open_gate(shared, &live.id).await;
        open_gate(shared, &live.chain_id).await;
    }

    match mode {
        RunMode::Add => {
            dispatch(shared, &live, RunMode::Add, prev).await;
        }
        RunMode::Start => {
            if prev.map(|p| p.is_unfreezing()).unwrap_or(false) || live.evaluated_params.is_some()
            {
                // resumed start; parameters were evaluated on the first one
                dispatch(shared, &live, RunMode::Start, prev).await;
                shared.enqueue(Command::CheckEnd {
                    live_id: live.id.clone(),
                });
            } else {
                try_start(shared, &live.id).await;
            }
        }
        RunMode::Pause | RunMode::Suspend => {
            freeze(shared, live, prev, mode).await;
        }
        RunMode::Unpause | RunMode::Unsuspend => {
            resume(shared, live, mode).await;
        }
        RunMode::End | RunMode::Cancel | RunMode::Skip => {
            dispatch(shared, &live, mode, prev).await;
            finalize(shared, live).await;
        }
    }
}

/// Dispatch the `add` handler for a freshly created live event.
pub(crate) async fn on_live_added(shared: &Arc<EngineShared>, live_id: &str) {
    match shared.store.live_event(live_id).await {
        Ok(Some(live)) => dispatch(shared, &live, RunMode::Add, None).await,
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(live_id = %live_id, error = %err, "live event lookup failed");
        }
    }
}

/// First start: evaluate parameters, then either finish the start or park
/// it on the pending sub-chain values. Re-entered by `AdvanceStart` each
/// time a value resolves.
pub(crate) async fn try_start(shared: &Arc<EngineShared>, live_id: &str) {
    let live = match shared.store.live_event(live_id).await {
        Ok(Some(live)) => live,
        _ => return,
    };
    if live.now_run_mode != RunMode::Start || live.evaluated_params.is_some() {
        return;
    }
    let def = match shared.registry.event_def(&live.event.group, &live.event.name) {
        Ok(def) => def.clone(),
        Err(err) => {
            tracing::warn!(live_id = %live_id, error = %err, "event start aborted");
            return;
        }
    };

    let resolved = {
        let pending = shared.lock_pending_starts();
        pending
            .get(live_id)
            .map(|p| p.resolved.clone())
            .unwrap_or_default()
    };
    let base = merge_defaults(&def.default_params, live.event.params.clone());
    let info = EvalInfo {
        parent_chain_id: Some(live.chain_id.clone()),
        run_by: live.run_by.clone(),
        added_by: live.added_by.clone(),
        is_fast: false,
    };
    let output = evaluate_params(shared, &base, &live.id, &info, &resolved).await;

    if output.pending.is_empty() {
        shared.lock_pending_starts().remove(live_id);
        finish_start(shared, live, output.params).await;
        return;
    }

    let mut to_run = Vec::new();
    {
        let mut pending_starts = shared.lock_pending_starts();
        let entry = pending_starts
            .entry(live_id.to_string())
            .or_insert_with(|| PendingStart {
                resolved,
                outstanding: HashSet::new(),
            });
        let mut resolvers = shared.lock_resolve_value_map();
        for request in output.pending {
            if entry.outstanding.insert(request.value_id.clone()) {
                resolvers.insert(request.value_id.clone(), live_id.to_string());
                to_run.push(request);
            }
        }
    }
    for request in to_run {
        tracing::debug!(live_id = %live_id, value_id = %request.value_id, "start parked on sub-chain value");
        shared.enqueue(Command::AddEvents {
            blocks: request.events,
            chain_id: request.value_id,
            parent_live_id: None,
            parent_chain_id: Some(live.chain_id.clone()),
            has_priority: false,
            added_by: live.added_by.clone(),
            run_by: live.run_by.clone(),
        });
    }
}

async fn finish_start(shared: &Arc<EngineShared>, mut live: LiveEvent, params: ParamMap) {
    let elapsed = shared.elapsed_for(&live).await;
    live.evaluated_params = Some(params);
    live.start_time = Some(now_ms());

    let waiting_on_subchain = matches!(
        shared.store.chain(&live.id).await,
        Ok(Some(ref chain)) if !chain.is_drained()
    );
    live.goal_end_time = Some(if waiting_on_subchain {
        f64::INFINITY
    } else {
        match live.duration {
            Some(duration) if duration.is_finite() => elapsed + duration,
            _ => 0.0,
        }
    });

    if let Err(err) = shared.store.put_live_event(live.clone()).await {
        tracing::warn!(live_id = %live.id, error = %err, "start write failed");
        return;
    }
    dispatch(shared, &live, RunMode::Start, None).await;
    shared.enqueue(Command::CheckEnd { live_id: live.id });
}

async fn freeze(
    shared: &Arc<EngineShared>,
    mut live: LiveEvent,
    prev: Option<RunMode>,
    mode: RunMode,
) {
    let elapsed = shared.elapsed_for(&live).await;
    let prior = prev.filter(|p| !p.is_unfreezing()).unwrap_or(RunMode::Start);

    if live.has_started() {
        if let Some(goal) = live.goal_end_time {
            if goal.is_finite() {
                live.remaining_time = Some(goal - elapsed);
            }
        }
    }
    match mode {
        RunMode::Pause => {
            live.pause_time = Some(now_ms());
            live.run_mode_before_pause = Some(prior);
        }
        RunMode::Suspend => {
            live.suspend_time = Some(now_ms());
            live.run_mode_before_suspend = Some(prior);
        }
        _ => return,
    }
    if let Err(err) = shared.store.put_live_event(live.clone()).await {
        tracing::warn!(live_id = %live.id, error = %err, "freeze write failed");
        return;
    }
    dispatch(shared, &live, mode, prev).await;
}

/// Transient resume: restore the goal from the remaining time captured at
/// freeze, then re-write the effective prior mode. The follow-up transition
/// carries `unpause`/`unsuspend` as its `prev`, which is what sets the
/// unfreezing flags on the handler's next dispatch.
async fn resume(shared: &Arc<EngineShared>, mut live: LiveEvent, mode: RunMode) {
    let elapsed = shared.elapsed_for(&live).await;
    let effective = match mode {
        RunMode::Unpause => {
            live.unpause_time = Some(now_ms());
            live.run_mode_before_pause.take().unwrap_or(RunMode::Start)
        }
        RunMode::Unsuspend => {
            live.unsuspend_time = Some(now_ms());
            live
                .run_mode_before_suspend
                .take()
                .unwrap_or(RunMode::Start)
        }
        _ => return,
    };

    if live.has_started() {
        if let Some(remaining) = live.remaining_time.take() {
            live.goal_end_time = Some(elapsed + remaining);
        }
    }
    tracing::debug!(live_id = %live.id, effective = %effective, "resuming live event");
    live.now_run_mode = effective;
    if let Err(err) = shared.store.put_live_event(live.clone()).await {
        tracing::warn!(live_id = %live.id, error = %err, "resume write failed");
    }
}

/// Run the user handler for one transition.
pub(crate) async fn dispatch(
    shared: &Arc<EngineShared>,
    live: &LiveEvent,
    effective: RunMode,
    prev: Option<RunMode>,
) {
    let def = match shared.registry.event_def(&live.event.group, &live.event.name) {
        Ok(def) => def.clone(),
        Err(err) => {
            tracing::warn!(live_id = %live.id, error = %err, "handler dispatch skipped");
            return;
        }
    };
    let params = live
        .evaluated_params
        .clone()
        .unwrap_or_else(|| merge_defaults(&def.default_params, live.event.params.clone()));
    let info = build_live_info(shared, live, effective, prev).await;
    tracing::debug!(live_id = %live.id, mode = %effective, "dispatching event handler");
    def.handler.run(params, info, shared.ctl()).await;
}

async fn build_live_info(
    shared: &Arc<EngineShared>,
    live: &LiveEvent,
    effective: RunMode,
    prev: Option<RunMode>,
) -> LiveInfo {
    let elapsed = shared.elapsed_for(live).await;
    let never_unfrozen = live.unpause_time.is_none() && live.unsuspend_time.is_none();
    LiveInfo {
        live_id: live.id.clone(),
        chain_id: live.chain_id.clone(),
        parent_chain_id: live.parent_chain_id.clone(),
        run_mode: effective,
        run_by: live.run_by.clone(),
        added_by: live.added_by.clone(),
        is_fast: false,
        elapsed_time: elapsed,
        remaining_time: live.remaining_time,
        goal_end_time: live.goal_end_time,
        add_time: live.add_time,
        start_time: live.start_time,
        pause_time: live.pause_time,
        unpause_time: live.unpause_time,
        suspend_time: live.suspend_time,
        unsuspend_time: live.unsuspend_time,
        is_unpausing: prev == Some(RunMode::Unpause),
        is_unsuspending: prev == Some(RunMode::Unsuspend),
        is_first_add: never_unfrozen,
        is_first_start: never_unfrozen,
        is_first_pause: live.unpause_time.is_none(),
        is_first_suspend: live.unsuspend_time.is_none(),
    }
}

/// Tear a finalized event down: drop it from its chain's queue now, cancel
/// anything it was waiting on, and schedule record removal for the next
/// drain.
async fn finalize(shared: &Arc<EngineShared>, live: LiveEvent) {
    tracing::debug!(live_id = %live.id, mode = %live.now_run_mode, "finalizing live event");

    match shared.store.chain(&live.chain_id).await {
        Ok(Some(mut chain)) => {
            if chain.position_of(&live.id).is_some() {
                chain.live_event_ids.retain(|id| id != &live.id);
                if let Err(err) = shared.store.put_chain(chain).await {
                    tracing::warn!(chain_id = %live.chain_id, error = %err, "queue removal failed");
                }
            }
        }
        Ok(None) => {
            tracing::debug!(chain_id = %live.chain_id, "finalized event had no chain");
        }
        Err(err) => {
            tracing::warn!(chain_id = %live.chain_id, error = %err, "chain lookup failed");
        }
    }

    // a surviving sub-chain dies with its parent
    if let Ok(Some(_)) = shared.store.chain(&live.id).await {
        shared.enqueue(Command::ChainMode {
            chain_id: live.id.clone(),
            mode: RunMode::Cancel,
            run_by: None,
        });
    }

    // value sub-chains still pending for this event are cancelled too
    let outstanding: Vec<String> = {
        let mut pending_starts = shared.lock_pending_starts();
        pending_starts
            .remove(&live.id)
            .map(|p| p.outstanding.into_iter().collect())
            .unwrap_or_default()
    };
    if !outstanding.is_empty() {
        let mut resolvers = shared.lock_resolve_value_map();
        for value_id in &outstanding {
            resolvers.remove(value_id);
        }
    }
    for value_id in outstanding {
        shared.enqueue(Command::ChainMode {
            chain_id: value_id,
            mode: RunMode::Cancel,
            run_by: None,
        });
    }

    shared.enqueue(Command::RemoveLiveEvent {
        live_id: live.id,
        chain_id: live.chain_id,
    });
}

/// Resolve one pending sub-chain value and re-attempt the parked start.
/// Returns false when nothing was waiting under that ID.
pub(crate) fn resolve_value(shared: &Arc<EngineShared>, value_id: &str, value: Value) -> bool {
    let live_id = {
        let mut resolvers = shared.lock_resolve_value_map();
        resolvers.remove(value_id)
    };
    let Some(live_id) = live_id else {
        return false;
    };
    {
        let mut pending_starts = shared.lock_pending_starts();
        if let Some(pending) = pending_starts.get_mut(&live_id) {
            pending.outstanding.remove(value_id);
            pending.resolved.insert(value_id.to_string(), value);
        }
    }
    tracing::debug!(live_id = %live_id, value_id = %value_id, "sub-chain value resolved");
    shared.enqueue(Command::AdvanceStart { live_id });
    true
}

/// Open a chain's activation gate (no-op for missing chains).
async fn open_gate(shared: &Arc<EngineShared>, chain_id: &str) {
    match shared.store.chain(chain_id).await {
        Ok(Some(mut chain)) if !chain.can_auto_activate => {
            chain.can_auto_activate = true;
            if let Err(err) = shared.store.put_chain(chain).await {
                tracing::warn!(chain_id = %chain_id, error = %err, "gate open failed");
            }
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(chain_id = %chain_id, error = %err, "chain lookup failed");
        }
    }
}
