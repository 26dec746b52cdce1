//! Gateway Configuration
//!
//! Runtime limits and TTLs for the gateway. Hosts typically deserialize this
//! from their own config file and pass it down; every field has a default so
//! `GatewayLimits::default()` is a working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::security::MAX_QUERY_LENGTH;

/// Tunable caps and TTLs shared by the query pipeline, caches and context
/// store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayLimits {
    /// Default row cap applied when a query does not specify one
    pub default_max_rows: u32,

    /// Absolute row cap; requests above this are clamped during validation
    pub absolute_max_rows: u32,

    /// Maximum raw query length accepted before analysis
    pub max_query_length: usize,

    /// Default advisory per-query timeout in seconds
    pub default_timeout_secs: u64,

    /// Schema cache entries older than this are treated as absent on read
    pub schema_cache_ttl_secs: u64,

    /// Introspection cache window for list/describe results
    pub introspection_cache_ttl_secs: u64,

    /// Default connection persistence preference in minutes
    /// (0 = verify the connection on every access)
    pub default_persistence_minutes: u32,

    /// Per-descriptor pool size for pooling drivers
    pub pool_max_connections: u32,

    /// Number of result rows replayed to the model as a preview
    pub model_preview_rows: usize,

    /// Query history entries retained per user
    pub history_capacity: usize,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            default_max_rows: 100,
            absolute_max_rows: 1000,
            max_query_length: MAX_QUERY_LENGTH,
            default_timeout_secs: 30,
            schema_cache_ttl_secs: 300,
            introspection_cache_ttl_secs: 300,
            default_persistence_minutes: 30,
            pool_max_connections: 5,
            model_preview_rows: 5,
            history_capacity: 10,
        }
    }
}

impl GatewayLimits {
    /// Parse limits from a JSON string, applying defaults for missing fields
    pub fn from_json(json: &str) -> Result<Self> {
        let limits: Self = serde_json::from_str(json)
            .map_err(|e| GatewayError::config_error(format!("Invalid limits config: {e}")))?;
        limits.validate()?;
        Ok(limits)
    }

    /// Reject configurations that would disable core protections
    pub fn validate(&self) -> Result<()> {
        if self.default_max_rows == 0 || self.absolute_max_rows == 0 {
            return Err(GatewayError::config_error("Row caps must be greater than zero"));
        }
        if self.default_max_rows > self.absolute_max_rows {
            return Err(GatewayError::config_error(
                "default_max_rows cannot exceed absolute_max_rows",
            ));
        }
        if self.max_query_length == 0 {
            return Err(GatewayError::config_error("max_query_length must be greater than zero"));
        }
        if self.history_capacity == 0 {
            return Err(GatewayError::config_error("history_capacity must be greater than zero"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn schema_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.schema_cache_ttl_secs)
    }

    #[must_use]
    pub const fn introspection_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.introspection_cache_ttl_secs)
    }
}
