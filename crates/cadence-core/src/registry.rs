//! Type registry
//!
//! Event and value type definitions keyed by `group.name`, seeded at init
//! and never mutated afterwards. Group keys registered in bulk get an
//! `"Events"`/`"Values"` suffix stripped (`gameEvents` → `game`), and an
//! alias table resolves user-supplied short keys to canonical groups.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::ctl::{EngineCtl, LiveInfo, ValueRunInfo};
use crate::error::EngineError;
use crate::store::ItemPath;
use crate::types::{ChainId, ParamMap};
use crate::value::ValueOutcome;

/// EventHandler trait - the user code body executed on every lifecycle
/// dispatch of a live event.
///
/// Handlers are black boxes to the engine. They can:
/// - Mutate host state and scoped variables
/// - Enqueue further events through the ctl
/// - Extend their own lifetime by raising `goal_end_time`
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn run(&self, params: ParamMap, info: LiveInfo, ctl: Arc<dyn EngineCtl>);
}

/// ValueHandler trait - computes one raw value from evaluated parameters.
///
/// Returning [`ValueOutcome::Pending`] suspends the owning event's start
/// until a sub-chain produces the value.
#[async_trait]
pub trait ValueHandler: Send + Sync {
    async fn run(
        &self,
        params: ParamMap,
        info: ValueRunInfo,
        ctl: Arc<dyn EngineCtl>,
    ) -> ValueOutcome;
}

/// A registered event type.
#[derive(Clone)]
pub struct EventTypeDef {
    /// `"{group}_{name}"`, assigned at registration
    pub id: String,
    pub handler: Arc<dyn EventHandler>,
    pub default_params: ParamMap,
    pub is_parallel: bool,
    /// Duration in elapsed-time units applied when the block sets none
    pub default_duration: Option<f64>,
    /// Elapsed-time signal location applied when the block sets none
    pub default_time_path: Option<ItemPath>,
}

impl EventTypeDef {
    /// Create a definition around a handler
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self {
            id: String::new(),
            handler,
            default_params: ParamMap::new(),
            is_parallel: false,
            default_duration: None,
            default_time_path: None,
        }
    }

    /// Set default parameters from a JSON object
    pub fn with_default_params(mut self, params: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = params {
            self.default_params = map;
        }
        self
    }

    /// Mark instances as parallel by default
    pub fn parallel(mut self) -> Self {
        self.is_parallel = true;
        self
    }

    /// Set a default duration in elapsed-time units
    pub fn with_default_duration(mut self, duration: f64) -> Self {
        self.default_duration = Some(duration);
        self
    }

    /// Set a default elapsed-time signal location
    pub fn with_default_time_path(mut self, path: ItemPath) -> Self {
        self.default_time_path = Some(path);
        self
    }
}

impl std::fmt::Debug for EventTypeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTypeDef")
            .field("id", &self.id)
            .field("is_parallel", &self.is_parallel)
            .field("default_duration", &self.default_duration)
            .finish_non_exhaustive()
    }
}

/// A registered value type.
#[derive(Clone)]
pub struct ValueTypeDef {
    /// `"{group}_{name}"`, assigned at registration
    pub id: String,
    pub handler: Arc<dyn ValueHandler>,
    pub default_params: ParamMap,
}

impl ValueTypeDef {
    /// Create a definition around a handler
    pub fn new(handler: Arc<dyn ValueHandler>) -> Self {
        Self {
            id: String::new(),
            handler,
            default_params: ParamMap::new(),
        }
    }

    /// Set default parameters from a JSON object
    pub fn with_default_params(mut self, params: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = params {
            self.default_params = map;
        }
        self
    }
}

impl std::fmt::Debug for ValueTypeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueTypeDef")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Registry-wide settings applied at init.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistryConfig {
    /// Elapsed-time signal location used when neither block nor type sets one
    pub default_elapsed_time_path: Option<ItemPath>,
    /// Fixed chain name new chains collapse onto; fresh random IDs when unset
    pub default_chain_id: Option<ChainId>,
    /// Short group keys resolved to canonical group names
    pub group_aliases: HashMap<String, String>,
}

/// Holds every event and value type definition, keyed by `group.name`.
///
/// Registration is last-write-wins per `(group, name)`.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    events: HashMap<String, HashMap<String, EventTypeDef>>,
    values: HashMap<String, HashMap<String, ValueTypeDef>>,
    config: TypeRegistryConfig,
}

/// Strip one trailing `"Events"`/`"Values"` suffix from a bulk group key.
fn strip_group_suffix(group: &str) -> &str {
    for suffix in ["Events", "Values"] {
        if group.len() > suffix.len() {
            if let Some(stripped) = group.strip_suffix(suffix) {
                return stripped;
            }
        }
    }
    group
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply registry-wide settings
    pub fn with_config(mut self, config: TypeRegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Overlay settings onto the registry: set fields override, aliases extend
    pub fn merge_config(&mut self, config: TypeRegistryConfig) {
        if config.default_elapsed_time_path.is_some() {
            self.config.default_elapsed_time_path = config.default_elapsed_time_path;
        }
        if config.default_chain_id.is_some() {
            self.config.default_chain_id = config.default_chain_id;
        }
        self.config.group_aliases.extend(config.group_aliases);
    }

    /// Register a group of event types. The group key may carry an
    /// `"Events"` suffix which is stripped.
    pub fn register_event_group(
        &mut self,
        group: impl AsRef<str>,
        defs: Vec<(&str, EventTypeDef)>,
    ) {
        let group = strip_group_suffix(group.as_ref()).to_string();
        let bucket = self.events.entry(group.clone()).or_default();
        for (name, mut def) in defs {
            def.id = format!("{}_{}", group, name);
            bucket.insert(name.to_string(), def);
        }
    }

    /// Register a group of value types. The group key may carry a
    /// `"Values"` suffix which is stripped.
    pub fn register_value_group(
        &mut self,
        group: impl AsRef<str>,
        defs: Vec<(&str, ValueTypeDef)>,
    ) {
        let group = strip_group_suffix(group.as_ref()).to_string();
        let bucket = self.values.entry(group.clone()).or_default();
        for (name, mut def) in defs {
            def.id = format!("{}_{}", group, name);
            bucket.insert(name.to_string(), def);
        }
    }

    /// Resolve a user-supplied group key through the alias table
    pub fn resolve_group<'a>(&'a self, group: &'a str) -> &'a str {
        self.config
            .group_aliases
            .get(group)
            .map(|g| g.as_str())
            .unwrap_or(group)
    }

    /// Look up an event type definition
    pub fn event_def(&self, group: &str, name: &str) -> Result<&EventTypeDef, EngineError> {
        let group = self.resolve_group(group);
        self.events
            .get(group)
            .and_then(|bucket| bucket.get(name))
            .ok_or_else(|| EngineError::UnknownEventType {
                group: group.to_string(),
                name: name.to_string(),
            })
    }

    /// Look up a value type definition
    pub fn value_def(&self, group: &str, name: &str) -> Result<&ValueTypeDef, EngineError> {
        let group = self.resolve_group(group);
        self.values
            .get(group)
            .and_then(|bucket| bucket.get(name))
            .ok_or_else(|| EngineError::UnknownValueType {
                group: group.to_string(),
                name: name.to_string(),
            })
    }

    /// Check whether an event type is registered
    pub fn has_event(&self, group: &str, name: &str) -> bool {
        self.event_def(group, name).is_ok()
    }

    /// Check whether a value type is registered
    pub fn has_value(&self, group: &str, name: &str) -> bool {
        self.value_def(group, name).is_ok()
    }

    /// All registered event group names
    pub fn event_group_names(&self) -> Vec<String> {
        self.events.keys().cloned().collect()
    }

    /// All event type names in a group
    pub fn event_names(&self, group: &str) -> Vec<String> {
        let group = self.resolve_group(group);
        self.events
            .get(group)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Registry-wide settings
    pub fn config(&self) -> &TypeRegistryConfig {
        &self.config
    }

    /// Elapsed-time signal fallback
    pub fn default_elapsed_time_path(&self) -> Option<&ItemPath> {
        self.config.default_elapsed_time_path.as_ref()
    }

    /// Fixed default chain name, when configured
    pub fn default_chain_id(&self) -> Option<&ChainId> {
        self.config.default_chain_id.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopEvent;

    #[async_trait]
    impl EventHandler for NoopEvent {
        async fn run(&self, _params: ParamMap, _info: LiveInfo, _ctl: Arc<dyn EngineCtl>) {}
    }

    struct NoopValue;

    #[async_trait]
    impl ValueHandler for NoopValue {
        async fn run(
            &self,
            _params: ParamMap,
            _info: ValueRunInfo,
            _ctl: Arc<dyn EngineCtl>,
        ) -> ValueOutcome {
            ValueOutcome::Ready(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_group_suffix_stripping() {
        assert_eq!(strip_group_suffix("gameEvents"), "game");
        assert_eq!(strip_group_suffix("basicValues"), "basic");
        assert_eq!(strip_group_suffix("game"), "game");
        // a bare suffix is a legitimate group name
        assert_eq!(strip_group_suffix("Events"), "Events");
    }

    #[test]
    fn test_registration_assigns_ids_and_resolves() {
        let mut registry = TypeRegistry::new();
        registry.register_event_group(
            "gameEvents",
            vec![("wait", EventTypeDef::new(Arc::new(NoopEvent)))],
        );
        registry.register_value_group(
            "basicValues",
            vec![("string", ValueTypeDef::new(Arc::new(NoopValue)))],
        );

        let def = registry.event_def("game", "wait").expect("event def");
        assert_eq!(def.id, "game_wait");
        let def = registry.value_def("basic", "string").expect("value def");
        assert_eq!(def.id, "basic_string");
    }

    #[test]
    fn test_unknown_type_lookup_fails() {
        let registry = TypeRegistry::new();
        let err = registry.event_def("game", "missing").unwrap_err();
        assert!(matches!(err, EngineError::UnknownEventType { .. }));
    }

    #[test]
    fn test_alias_resolves_to_canonical_group() {
        let mut aliases = HashMap::new();
        aliases.insert("g".to_string(), "game".to_string());
        let mut registry = TypeRegistry::new().with_config(TypeRegistryConfig {
            group_aliases: aliases,
            ..TypeRegistryConfig::default()
        });
        registry.register_event_group(
            "gameEvents",
            vec![("wait", EventTypeDef::new(Arc::new(NoopEvent)))],
        );

        assert!(registry.has_event("g", "wait"));
        assert!(registry.has_event("game", "wait"));
    }

    #[test]
    fn test_registration_is_last_write_wins() {
        let mut registry = TypeRegistry::new();
        registry.register_event_group(
            "game",
            vec![(
                "wait",
                EventTypeDef::new(Arc::new(NoopEvent)).with_default_duration(1.0),
            )],
        );
        registry.register_event_group(
            "game",
            vec![(
                "wait",
                EventTypeDef::new(Arc::new(NoopEvent)).with_default_duration(2.0),
            )],
        );
        let def = registry.event_def("game", "wait").unwrap();
        assert_eq!(def.default_duration, Some(2.0));
    }
}
