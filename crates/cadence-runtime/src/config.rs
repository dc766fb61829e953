//! Engine configuration loading.
//!
//! Init options for the engine: where the elapsed-time signal lives, an
//! optional fixed chain name, and short group aliases. Loadable from YAML
//! with validation.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cadence_core::registry::TypeRegistryConfig;
use cadence_core::store::ItemPath;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Engine init options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Elapsed-time signal location used when neither block nor type sets one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_elapsed_time_path: Option<ItemPath>,
    /// Fixed chain name new chains collapse onto; fresh random IDs when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_chain_id: Option<String>,
    /// Short group keys resolved to canonical group names
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub group_aliases: HashMap<String, String>,
}

impl EngineConfig {
    /// Set the default elapsed-time signal location
    pub fn with_elapsed_time_path(mut self, path: ItemPath) -> Self {
        self.default_elapsed_time_path = Some(path);
        self
    }

    /// Collapse all new chains onto one fixed chain name
    pub fn with_default_chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.default_chain_id = Some(chain_id.into());
        self
    }

    /// Add a short group alias
    pub fn with_group_alias(
        mut self,
        short: impl Into<String>,
        canonical: impl Into<String>,
    ) -> Self {
        self.group_aliases.insert(short.into(), canonical.into());
        self
    }
}

impl From<EngineConfig> for TypeRegistryConfig {
    fn from(config: EngineConfig) -> Self {
        TypeRegistryConfig {
            default_elapsed_time_path: config.default_elapsed_time_path,
            default_chain_id: config.default_chain_id,
            group_aliases: config.group_aliases,
        }
    }
}

/// Load engine configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: EngineConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if let Some(path) = &config.default_elapsed_time_path {
        for (label, segment) in [
            ("item_type", &path.item_type),
            ("item_id", &path.item_id),
            ("prop", &path.prop),
        ] {
            if segment.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "default_elapsed_time_path.{} must not be empty",
                    label
                )));
            }
        }
    }

    if let Some(chain_id) = &config.default_chain_id {
        if chain_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "default_chain_id must not be empty".to_string(),
            ));
        }
    }

    for (short, canonical) in &config.group_aliases {
        if short.trim().is_empty() || canonical.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "group_aliases entries must not be empty".to_string(),
            ));
        }
    }

    Ok(())
}
