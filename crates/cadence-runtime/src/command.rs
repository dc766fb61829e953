//! Engine command queue.
//!
//! Public API calls and handler callbacks enqueue commands; the settle loop
//! drains them in FIFO order before dispatching journaled changes. This is
//! the "next tick" of the engine: sequential calls within one pass batch
//! into the next pass's first drain.

use serde_json::Value;

use cadence_core::types::{ChainId, EventBlock, LiveId, RunMode};

#[derive(Debug)]
pub(crate) enum Command {
    /// Append (or priority-insert) events into a chain, creating it on demand
    AddEvents {
        blocks: Vec<EventBlock>,
        chain_id: ChainId,
        /// Set when the chain is a sub-chain of this live event
        parent_live_id: Option<LiveId>,
        parent_chain_id: Option<ChainId>,
        has_priority: bool,
        added_by: Option<String>,
        run_by: Option<String>,
    },
    /// Run events through the fast in-process pipeline
    RunFast {
        blocks: Vec<EventBlock>,
        chain_id: ChainId,
        parent_chain_id: Option<ChainId>,
        added_by: Option<String>,
        run_by: Option<String>,
    },
    /// Write a run mode to one live event (skip may park instead)
    SetMode {
        live_id: LiveId,
        mode: RunMode,
        run_by: Option<String>,
    },
    /// Write a run mode to every member of a chain
    ChainMode {
        chain_id: ChainId,
        mode: RunMode,
        run_by: Option<String>,
    },
    /// Write a run mode to every event before the given one in its chain
    ForAllBefore {
        live_id: LiveId,
        mode: RunMode,
        run_by: Option<String>,
    },
    /// Write a run mode to every live event, optionally filtered by group
    AllEventsDo {
        group: Option<String>,
        mode: RunMode,
        run_by: Option<String>,
    },
    /// Drop a finalized live-event record and re-admit any parked duplicate
    RemoveLiveEvent { live_id: LiveId, chain_id: ChainId },
    /// Re-check whether a started event's goal has been reached
    CheckEnd { live_id: LiveId },
    /// Resolve the nearest pending sub-chain value at or above a chain
    ResolveValue { chain_id: ChainId, value: Value },
    /// Re-attempt a start parked on pending values
    AdvanceStart { live_id: LiveId },
}
