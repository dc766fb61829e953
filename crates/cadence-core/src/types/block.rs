//! Event and value block definitions
//!
//! Blocks are plain-data descriptions of something to run, referencing a
//! registered type by `(group, name)`. A `ValueBlock` nested inside a
//! parameter map is recognized by its literal `"type": "value"` tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::ItemPath;

/// Parameter map carried by blocks and handed to handlers.
pub type ParamMap = serde_json::Map<String, Value>;

/// Per-block options controlling placement and timing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBlockOptions {
    /// Target chain; a fresh chain is created when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    /// Explicit live-event ID; generated when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_id: Option<String>,
    /// Who enqueued this block (diagnostics, passed through to handlers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_by: Option<String>,
    /// Override the type definition's parallel flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_parallel: Option<bool>,
    /// Override the elapsed-time signal location for this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_path: Option<ItemPath>,
    /// Insert after the active prefix instead of appending
    #[serde(default)]
    pub has_priority: bool,
    /// Duration in elapsed-time units; `None` means fire-and-finish
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Run through the fast in-process pipeline
    #[serde(default)]
    pub is_fast: bool,
    /// Parent chain for variable-scope fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_chain_id: Option<String>,
}

/// A plain-data description of an event to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBlock {
    pub group: String,
    pub name: String,
    #[serde(default)]
    pub params: ParamMap,
    #[serde(default)]
    pub options: EventBlockOptions,
}

impl EventBlock {
    /// Create a new event block for a registered type
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            params: ParamMap::new(),
            options: EventBlockOptions::default(),
        }
    }

    /// Set parameters from a JSON object; non-objects are ignored
    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.params = map;
        }
        self
    }

    /// Set block options
    pub fn with_options(mut self, options: EventBlockOptions) -> Self {
        self.options = options;
        self
    }

    /// Set an explicit live-event ID
    pub fn with_live_id(mut self, live_id: impl Into<String>) -> Self {
        self.options.live_id = Some(live_id.into());
        self
    }

    /// Set a duration in elapsed-time units
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.options.duration = Some(duration);
        self
    }
}

/// The literal `"value"` tag distinguishing value blocks from raw objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueTag {
    Value,
}

impl Default for ValueTag {
    fn default() -> Self {
        Self::Value
    }
}

/// A plain-data description of a deferred value to evaluate.
///
/// Serializes with a `"type": "value"` tag so it can be told apart from a
/// plain parameter object of the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueBlock {
    #[serde(rename = "type")]
    pub tag: ValueTag,
    pub group: String,
    pub name: String,
    #[serde(default)]
    pub params: ParamMap,
}

impl ValueBlock {
    /// Create a new value block for a registered type
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tag: ValueTag::Value,
            group: group.into(),
            name: name.into(),
            params: ParamMap::new(),
        }
    }

    /// Set parameters from a JSON object; non-objects are ignored
    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.params = map;
        }
        self
    }

    /// Convert into a raw JSON value for embedding in a parameter map
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Try to read a value block back out of a raw parameter value.
    ///
    /// Only objects carrying the literal `"type": "value"` tag qualify.
    pub fn from_value(value: &Value) -> Option<ValueBlock> {
        let obj = value.as_object()?;
        if obj.get("type").and_then(|t| t.as_str()) != Some("value") {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}
