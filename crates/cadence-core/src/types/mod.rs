//! Type definitions
//!
//! Plain-data records shared by every layer: blocks describe what to run,
//! chains and live events carry the runtime state. Everything here is
//! serde-round-trippable; inter-record links are string IDs only.

mod block;
mod chain;
mod live_event;
mod run_mode;

pub use block::{EventBlock, EventBlockOptions, ParamMap, ValueBlock, ValueTag};
pub use chain::{Chain, ChainId};
pub use live_event::{LiveEvent, LiveId, PendingMode};
pub use run_mode::RunMode;
