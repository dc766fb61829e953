//! Value-evaluation data model
//!
//! The recursive evaluator itself lives in the runtime crate; this module
//! holds the pieces both runtimes share: the handler outcome type, the
//! defaults merge, value-identity paths, and small parameter accessors.

use serde_json::Value;

use crate::types::{EventBlock, ParamMap};

/// Result of running a value handler.
#[derive(Debug, Clone)]
pub enum ValueOutcome {
    /// The raw value, available now
    Ready(Value),
    /// The value comes from a sub-chain that must run first; the owning
    /// event's start is parked until a descendant resolves it
    Pending { events: Vec<EventBlock> },
}

/// Merge type defaults under provided parameters (`defaults ⊕ provided`).
pub fn merge_defaults(defaults: &ParamMap, provided: ParamMap) -> ParamMap {
    if defaults.is_empty() {
        return provided;
    }
    let mut merged = defaults.clone();
    for (key, value) in provided {
        merged.insert(key, value);
    }
    merged
}

/// Identity of the value at `key` under `prefix`.
///
/// The root prefix is the owning live event's ID, so a parameter value gets
/// `"{live_id}.{key}"` and nested values append further segments. These
/// paths key the pending-resolver map, so they must be unique per tree.
pub fn child_value_id(prefix: &str, key: &str) -> String {
    format!("{}.{}", prefix, key)
}

/// Read a numeric parameter as f64
pub fn param_f64(params: &ParamMap, key: &str) -> Option<f64> {
    params.get(key).and_then(|v| v.as_f64())
}

/// Read a string parameter
pub fn param_str<'a>(params: &'a ParamMap, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> ParamMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_merge_defaults_provided_wins() {
        let defaults = map(json!({"a": 1, "b": 2}));
        let provided = map(json!({"b": 3, "c": 4}));
        let merged = merge_defaults(&defaults, provided);
        assert_eq!(merged.get("a"), Some(&json!(1)));
        assert_eq!(merged.get("b"), Some(&json!(3)));
        assert_eq!(merged.get("c"), Some(&json!(4)));
    }

    #[test]
    fn test_child_value_id_appends_segments() {
        let outer = child_value_id("L1", "amount");
        assert_eq!(outer, "L1.amount");
        assert_eq!(child_value_id(&outer, "a"), "L1.amount.a");
    }

    #[test]
    fn test_param_accessors() {
        let params = map(json!({"n": 1.5, "s": "hi"}));
        assert_eq!(param_f64(&params, "n"), Some(1.5));
        assert_eq!(param_str(&params, "s"), Some("hi"));
        assert_eq!(param_f64(&params, "missing"), None);
    }
}
