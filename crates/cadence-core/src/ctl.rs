//! Engine control seam
//!
//! Handlers receive an `Arc<dyn EngineCtl>` alongside their parameters and
//! can call the same surface the host uses: enqueue events, issue run-mode
//! transitions, and read or write scoped variables. Everything except the
//! documented synchronous reads defers to the engine's next tick.

use async_trait::async_trait;
use serde_json::Value;

use crate::store::ItemPath;
use crate::types::{ChainId, EventBlock, LiveId, RunMode};

/// Options for `run_event(s)` and friends.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Target chain; a fresh chain (or the configured default) when unset
    pub chain_id: Option<ChainId>,
    /// Target parent live event; the chain becomes a sub-chain of it
    pub live_id: Option<LiveId>,
    /// Recorded on each live event for handler context
    pub added_by: Option<String>,
    /// Recorded on each live event for handler context
    pub run_by: Option<String>,
    /// Insert after the active prefix instead of appending
    pub has_priority: bool,
    /// Run through the fast in-process pipeline
    pub is_fast: bool,
    /// Parent chain for variable-scope fallback
    pub parent_chain_id: Option<ChainId>,
}

impl RunOptions {
    /// Target an existing chain
    pub fn in_chain(chain_id: impl Into<ChainId>) -> Self {
        Self {
            chain_id: Some(chain_id.into()),
            ..Self::default()
        }
    }

    /// Target a parent live event (sub-chain)
    pub fn under_event(live_id: impl Into<LiveId>) -> Self {
        Self {
            live_id: Some(live_id.into()),
            ..Self::default()
        }
    }

    /// Mark as a priority insertion
    pub fn with_priority(mut self) -> Self {
        self.has_priority = true;
        self
    }

    /// Route through the fast pipeline
    pub fn fast(mut self) -> Self {
        self.is_fast = true;
        self
    }
}

/// Options for run-mode transitions issued through `*_do` calls.
#[derive(Debug, Clone, Default)]
pub struct ModeOptions {
    pub run_by: Option<String>,
}

impl ModeOptions {
    pub fn run_by(name: impl Into<String>) -> Self {
        Self {
            run_by: Some(name.into()),
        }
    }
}

/// Context handed to an event handler on every lifecycle dispatch.
#[derive(Debug, Clone)]
pub struct LiveInfo {
    pub live_id: LiveId,
    pub chain_id: ChainId,
    pub parent_chain_id: Option<ChainId>,
    /// The effective mode being dispatched; never `unpause`/`unsuspend`
    pub run_mode: RunMode,
    pub run_by: Option<String>,
    pub added_by: Option<String>,
    pub is_fast: bool,
    /// Current value of the event's elapsed-time signal
    pub elapsed_time: f64,
    pub remaining_time: Option<f64>,
    pub goal_end_time: Option<f64>,
    pub add_time: i64,
    pub start_time: Option<i64>,
    pub pause_time: Option<i64>,
    pub unpause_time: Option<i64>,
    pub suspend_time: Option<i64>,
    pub unsuspend_time: Option<i64>,
    pub is_unpausing: bool,
    pub is_unsuspending: bool,
    pub is_first_add: bool,
    pub is_first_start: bool,
    pub is_first_pause: bool,
    pub is_first_suspend: bool,
}

impl LiveInfo {
    /// Resuming from either freeze
    pub fn is_unfreezing(&self) -> bool {
        self.is_unpausing || self.is_unsuspending
    }

    /// Entering either freeze
    pub fn is_freezing(&self) -> bool {
        self.run_mode.is_frozen()
    }
}

/// Context handed to a value handler.
#[derive(Debug, Clone)]
pub struct ValueRunInfo {
    /// Unique identity of this value within its live event's parameter tree
    pub value_id: String,
    /// Chain of the live event whose parameters are being evaluated
    pub parent_chain_id: Option<ChainId>,
    pub run_by: Option<String>,
    pub added_by: Option<String>,
    pub is_fast: bool,
}

/// The engine surface available to handlers and the host.
///
/// Mutating calls enqueue a command applied on the engine's next tick; the
/// exceptions are `set_variable`/`set_state` (applied immediately so a
/// handler's writes are visible to evaluation later in the same pass) and
/// the read methods.
#[async_trait]
pub trait EngineCtl: Send + Sync {
    /// Append events to a chain; returns the chain ID used
    async fn run_events(&self, blocks: Vec<EventBlock>, options: RunOptions) -> ChainId;

    /// Add a single event; returns the live ID that will be assigned
    async fn run_event(&self, block: EventBlock, options: RunOptions) -> LiveId;

    /// `run_events` with priority insertion
    async fn run_priority_events(&self, blocks: Vec<EventBlock>, options: RunOptions) -> ChainId;

    /// Run events as a sub-chain of an existing live event
    async fn add_sub_events(
        &self,
        live_id: &str,
        blocks: Vec<EventBlock>,
        options: RunOptions,
    ) -> ChainId;

    /// Issue a run-mode transition to one live event
    async fn event_do(&self, mode: RunMode, live_id: &str, options: ModeOptions);

    /// Issue a run-mode transition to every event in a chain
    async fn chain_do(&self, mode: RunMode, chain_id: &str, options: ModeOptions);

    /// `chain_do` against the chain a live event belongs to; the membership
    /// read happens synchronously at call time
    async fn chain_with_event_do(&self, mode: RunMode, live_id: &str, options: ModeOptions);

    /// Issue a transition to every event before the given one in its chain
    async fn do_for_all_before_event(&self, mode: RunMode, live_id: &str, options: ModeOptions);

    /// Skip every event before the given one
    async fn skip_to_event(&self, live_id: &str);

    /// Cancel every event before the given one
    async fn cancel_up_to_event(&self, live_id: &str);

    /// Issue a transition to every live event of a type group
    async fn all_group_events_do(&self, group: &str, mode: RunMode, options: ModeOptions);

    /// Issue a transition to every live event
    async fn all_events_do(&self, mode: RunMode, options: ModeOptions);

    /// Write a scoped variable. Writes to the chain bucket when `scope`
    /// names an existing chain, else to the named global scope.
    async fn set_variable(&self, name: &str, value: Value, scope: Option<&str>, is_fast: bool);

    /// Read a scoped variable, walking chain ancestors before globals
    async fn get_variable(&self, name: &str, scope: Option<&str>, is_fast: bool) -> Option<Value>;

    /// Overwrite a live event's goal end time (e.g. to wait indefinitely)
    async fn set_goal_end_time(&self, live_id: &str, goal: f64);

    /// Resolve the nearest pending sub-chain value at or above `chain_id`
    /// and cancel the remainder of that sub-chain
    async fn resolve_event_value(&self, chain_id: &str, value: Value);

    /// Write a host item field
    async fn set_state(&self, path: &ItemPath, value: Value);

    /// Read a host item field
    async fn get_state(&self, path: &ItemPath) -> Option<Value>;
}
