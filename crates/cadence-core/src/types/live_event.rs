//! Live-event type definitions
//!
//! A live event is one instantiated occurrence of an event type, with its
//! own lifecycle state. Wall-clock timestamps are diagnostic only; every
//! scheduling decision reads the host's elapsed-time signal instead.

use serde::{Deserialize, Serialize};

use super::block::{EventBlock, ParamMap};
use super::chain::ChainId;
use super::run_mode::RunMode;
use crate::store::ItemPath;

/// Type alias for live-event IDs
pub type LiveId = String;

/// A run mode parked until the scheduler finds the event activatable.
///
/// Used for `skip` issued against an event that is not yet head-of-queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMode {
    pub mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_by: Option<String>,
}

/// One live occurrence of an event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveEvent {
    /// Unique identifier
    pub id: LiveId,
    /// Owning chain
    pub chain_id: ChainId,
    /// Parent chain for variable-scope fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_chain_id: Option<ChainId>,
    /// The block this event was instantiated from
    pub event: EventBlock,
    /// Parameters after value evaluation; set at most once, on first start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_params: Option<ParamMap>,
    /// Current lifecycle state
    #[serde(default)]
    pub now_run_mode: RunMode,
    /// Whether this event may run alongside its queue neighbors
    #[serde(default)]
    pub is_parallel: bool,
    /// Duration in elapsed-time units; `None` means fire-and-finish
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Elapsed-time signal location; registry default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time_path: Option<ItemPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_by: Option<String>,
    /// Wall-clock ms when the event was added
    pub add_time: i64,
    /// Wall-clock ms of the first start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// Elapsed-time value at which the event ends.
    /// `0` fires immediately; infinity waits for an external transition.
    /// Serializes to `null` at infinity; restore re-derives it from a
    /// surviving sub-chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_end_time: Option<f64>,
    /// Remaining elapsed time captured at the latest freeze
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpause_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsuspend_time: Option<i64>,
    /// Mode applied by the scheduler once the event becomes activatable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_mode_options_when_ready: Option<PendingMode>,
    /// Mode to re-dispatch after unpause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_mode_before_pause: Option<RunMode>,
    /// Mode to re-dispatch after unsuspend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_mode_before_suspend: Option<RunMode>,
}

impl LiveEvent {
    /// Create a live event in `add` mode from a block
    pub fn new(
        id: impl Into<LiveId>,
        chain_id: impl Into<ChainId>,
        event: EventBlock,
        add_time: i64,
    ) -> Self {
        Self {
            id: id.into(),
            chain_id: chain_id.into(),
            parent_chain_id: None,
            event,
            evaluated_params: None,
            now_run_mode: RunMode::Add,
            is_parallel: false,
            duration: None,
            elapsed_time_path: None,
            added_by: None,
            run_by: None,
            add_time,
            start_time: None,
            goal_end_time: None,
            remaining_time: None,
            pause_time: None,
            unpause_time: None,
            suspend_time: None,
            unsuspend_time: None,
            run_mode_options_when_ready: None,
            run_mode_before_pause: None,
            run_mode_before_suspend: None,
        }
    }

    /// Check if the event has been started at least once
    pub fn has_started(&self) -> bool {
        self.start_time.is_some()
    }

    /// Check if the event has reached a final mode
    pub fn is_finalized(&self) -> bool {
        self.now_run_mode.is_final()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LiveEvent {
        LiveEvent::new("L1", "c1", EventBlock::new("game", "wait"), 1_000)
    }

    #[test]
    fn test_live_event_starts_in_add_mode() {
        let live = sample();
        assert_eq!(live.now_run_mode, RunMode::Add);
        assert!(!live.has_started());
        assert!(!live.is_finalized());
    }

    #[test]
    fn test_live_event_json_round_trip() {
        let mut live = sample();
        live.now_run_mode = RunMode::Pause;
        live.start_time = Some(2_000);
        live.remaining_time = Some(600.0);
        live.run_mode_before_pause = Some(RunMode::Start);

        let json = serde_json::to_string(&live).unwrap();
        let back: LiveEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.now_run_mode, RunMode::Pause);
        assert_eq!(back.remaining_time, Some(600.0));
        assert_eq!(back.run_mode_before_pause, Some(RunMode::Start));
    }

    #[test]
    fn test_infinite_goal_serializes_to_null() {
        let mut live = sample();
        live.goal_end_time = Some(f64::INFINITY);
        let json = serde_json::to_value(&live).unwrap();
        assert!(json.get("goal_end_time").unwrap().is_null());
        let back: LiveEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.goal_end_time, None);
    }
}
