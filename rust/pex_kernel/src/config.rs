//! Engine configuration.
//!
//! Configuration comes from JSON (all fields optional) and can be overridden
//! from `PEX_*` environment variables.

use serde::{Deserialize, Serialize};

use pex_core::{PexError, Result};

pub const ENV_MAX_UPDATE_RETRIES: &str = "PEX_MAX_UPDATE_RETRIES";
pub const ENV_MAX_RESOLUTION_DEPTH: &str = "PEX_MAX_RESOLUTION_DEPTH";
pub const ENV_CACHE_ENABLED: &str = "PEX_CACHE_ENABLED";
pub const ENV_CACHE_MAX_VALUES: &str = "PEX_CACHE_MAX_VALUES";
pub const ENV_LOG_CYCLES: &str = "PEX_LOG_CYCLES";

/// Tunables for one [`PermissionEngine`](crate::PermissionEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Compare-and-swap attempts per update before giving up.
    pub max_update_retries: u32,
    /// Deepest parent chain a resolve follows.
    pub max_resolution_depth: u32,
    pub cache_enabled: bool,
    /// Cached results kept per subject before the oldest tenth is dropped.
    pub cache_max_values_per_subject: usize,
    /// Log broken inheritance edges at debug level.
    pub log_cycles: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_update_retries: 10,
            max_resolution_depth: pex_core::resolve::DEFAULT_MAX_DEPTH,
            cache_enabled: true,
            cache_max_values_per_subject: crate::cache::DEFAULT_MAX_VALUES_PER_SUBJECT,
            log_cycles: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by whatever `PEX_*` variables are set.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ENV_MAX_UPDATE_RETRIES) {
            self.max_update_retries = parse_number(ENV_MAX_UPDATE_RETRIES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_RESOLUTION_DEPTH) {
            self.max_resolution_depth = parse_number(ENV_MAX_RESOLUTION_DEPTH, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CACHE_ENABLED) {
            self.cache_enabled = parse_flag(ENV_CACHE_ENABLED, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CACHE_MAX_VALUES) {
            self.cache_max_values_per_subject = parse_number::<usize>(ENV_CACHE_MAX_VALUES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LOG_CYCLES) {
            self.log_cycles = parse_flag(ENV_LOG_CYCLES, &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_update_retries == 0 {
            return Err(PexError::Config(
                "max_update_retries must be at least 1".to_string(),
            ));
        }
        if self.cache_max_values_per_subject == 0 {
            return Err(PexError::Config(
                "cache_max_values_per_subject must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an engine config from a JSON string.
pub fn parse_engine_config(json: &str) -> Result<EngineConfig> {
    let config: EngineConfig =
        serde_json::from_str(json).map_err(|e| PexError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| PexError::Config(format!("{key} must be a non-negative integer, got '{raw}'")))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PexError::Config(format!("{key} must be a boolean, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_update_retries, 10);
        assert_eq!(config.max_resolution_depth, 50);
        assert!(config.cache_enabled);
        assert_eq!(config.cache_max_values_per_subject, 4096);
        assert!(config.log_cycles);
    }

    #[test]
    fn parse_partial_json() {
        let config = parse_engine_config(r#"{"cache_enabled":false}"#).unwrap();
        assert!(!config.cache_enabled);
        assert_eq!(config.max_update_retries, 10);
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let err = parse_engine_config(r#"{"cache":false}"#).unwrap_err();
        assert!(matches!(err, PexError::Config(_)));
    }

    #[test]
    fn parse_rejects_zero_retries() {
        let err = parse_engine_config(r#"{"max_update_retries":0}"#).unwrap_err();
        assert!(err.to_string().contains("max_update_retries"));
    }

    #[test]
    fn parse_rejects_zero_cache_bound() {
        let err = parse_engine_config(r#"{"cache_max_values_per_subject":0}"#).unwrap_err();
        assert!(err.to_string().contains("cache_max_values_per_subject"));
    }

    #[test]
    fn env_overrides_apply() {
        let config = EngineConfig::default()
            .with_overrides(lookup(&[
                (ENV_MAX_UPDATE_RETRIES, "3"),
                (ENV_MAX_RESOLUTION_DEPTH, " 8 "),
                (ENV_CACHE_ENABLED, "off"),
                (ENV_CACHE_MAX_VALUES, "64"),
                (ENV_LOG_CYCLES, "FALSE"),
            ]))
            .unwrap();
        assert_eq!(
            config,
            EngineConfig {
                max_update_retries: 3,
                max_resolution_depth: 8,
                cache_enabled: false,
                cache_max_values_per_subject: 64,
                log_cycles: false,
            }
        );
    }

    #[test]
    fn env_overrides_reject_garbage() {
        assert!(EngineConfig::default()
            .with_overrides(lookup(&[(ENV_MAX_RESOLUTION_DEPTH, "-1")]))
            .is_err());
        assert!(EngineConfig::default()
            .with_overrides(lookup(&[(ENV_CACHE_ENABLED, "maybe")]))
            .is_err());
    }
}
