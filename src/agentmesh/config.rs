//! Runtime configuration for agentmesh.
//!
//! Provides the [`MeshConfig`] struct covering the spill subsystem, the
//! fallback chain, observer retention, capability caching, tracing export,
//! and the per-component timeouts. Users construct it manually or load the
//! recognized environment variables via [`MeshConfig::from_env`] — no config
//! file parsing dependencies are introduced.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::MeshConfig;
//! use std::path::PathBuf;
//!
//! // Use the defaults
//! let config = MeshConfig::default();
//!
//! // Or override pieces
//! let config = MeshConfig {
//!     spill_dir: PathBuf::from("/var/data/agentmesh/spill"),
//!     spill_threshold_bytes: 4096,
//!     ..MeshConfig::default()
//! };
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the primary model identifier.
pub const ENV_PRIMARY_MODEL: &str = "AGENTMESH_PRIMARY_MODEL";
/// Comma-separated ordered fallback model list.
pub const ENV_FALLBACK_MODELS: &str = "AGENTMESH_FALLBACK_MODELS";
/// `"1"`/`"true"` enables the cross-provider tail of the fallback chain.
pub const ENV_CROSS_PROVIDER_FALLBACK: &str = "AGENTMESH_CROSS_PROVIDER_FALLBACK";
/// Root directory for per-session spill folders.
pub const ENV_SPILL_DIR: &str = "AGENTMESH_SPILL_DIR";
/// Spill threshold in bytes.
pub const ENV_SPILL_THRESHOLD: &str = "AGENTMESH_SPILL_THRESHOLD_BYTES";
/// Overall run timeout in seconds.
pub const ENV_OVERALL_TIMEOUT: &str = "AGENTMESH_OVERALL_TIMEOUT_SECS";
/// Per-LLM-call timeout in seconds.
pub const ENV_LLM_TIMEOUT: &str = "AGENTMESH_LLM_TIMEOUT_SECS";
/// Per-tool-call timeout in seconds.
pub const ENV_TOOL_TIMEOUT: &str = "AGENTMESH_TOOL_TIMEOUT_SECS";
/// Live-trace exporter endpoint URL.
pub const ENV_TRACE_ENDPOINT: &str = "AGENTMESH_TRACE_ENDPOINT";
/// Live-trace exporter API key.
pub const ENV_TRACE_KEY: &str = "AGENTMESH_TRACE_KEY";
/// Live-trace mode selector (`"off"`, `"batch"`, `"live"`).
pub const ENV_TRACE_MODE: &str = "AGENTMESH_TRACE_MODE";

/// Global configuration shared by sessions, pools, and orchestrators.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Primary model identifier, e.g. `"gpt-4.1"`.
    pub primary_model: String,
    /// Ordered fallback models tried after the primary on retryable errors.
    pub fallback_models: Vec<String>,
    /// Whether the chain may cross providers at its tail.
    pub cross_provider_fallback: bool,
    /// Root directory under which each session gets a spill subdirectory.
    pub spill_dir: PathBuf,
    /// Tool outputs at or above this many bytes are spilled to disk.
    pub spill_threshold_bytes: usize,
    /// Hard wall-clock bound on a whole run (agent or orchestrator).
    pub overall_timeout: Duration,
    /// Deadline for a single LLM round-trip.
    pub llm_timeout: Duration,
    /// Deadline for a single tool dispatch.
    pub tool_timeout: Duration,
    /// Deadline for one orchestrator sub-agent execution.
    pub sub_agent_timeout: Duration,
    /// Ring-buffer capacity per observer; oldest events are evicted beyond it.
    pub max_events_per_observer: usize,
    /// Observers idle longer than this are reaped.
    pub observer_idle_horizon: Duration,
    /// Directory for the on-disk capability cache; `None` disables it.
    pub capability_cache_dir: Option<PathBuf>,
    /// TTL for cached capability discovery per server.
    pub capability_ttl: Duration,
    /// Per-server concurrent tool-call cap.
    pub per_server_concurrency: usize,
    /// Live-trace exporter endpoint, when configured.
    pub trace_endpoint: Option<String>,
    /// Live-trace exporter key.
    pub trace_key: Option<String>,
    /// Live-trace mode selector.
    pub trace_mode: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            primary_model: "gpt-4.1".to_string(),
            fallback_models: Vec::new(),
            cross_provider_fallback: false,
            spill_dir: PathBuf::from("agentmesh_spill"),
            spill_threshold_bytes: 1000,
            overall_timeout: Duration::from_secs(600),
            llm_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(60),
            sub_agent_timeout: Duration::from_secs(300),
            max_events_per_observer: 1000,
            observer_idle_horizon: Duration::from_secs(1800),
            capability_cache_dir: None,
            capability_ttl: Duration::from_secs(30 * 60),
            per_server_concurrency: 4,
            trace_endpoint: None,
            trace_key: None,
            trace_mode: "off".to_string(),
        }
    }
}

impl MeshConfig {
    /// Build a config from the recognized environment variables, falling back
    /// to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(model) = std::env::var(ENV_PRIMARY_MODEL) {
            if !model.is_empty() {
                config.primary_model = model;
            }
        }
        if let Ok(list) = std::env::var(ENV_FALLBACK_MODELS) {
            config.fallback_models = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(flag) = std::env::var(ENV_CROSS_PROVIDER_FALLBACK) {
            config.cross_provider_fallback = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
        if let Ok(dir) = std::env::var(ENV_SPILL_DIR) {
            if !dir.is_empty() {
                config.spill_dir = PathBuf::from(dir);
            }
        }
        if let Some(bytes) = parse_env::<usize>(ENV_SPILL_THRESHOLD) {
            config.spill_threshold_bytes = bytes;
        }
        if let Some(secs) = parse_env::<u64>(ENV_OVERALL_TIMEOUT) {
            config.overall_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>(ENV_LLM_TIMEOUT) {
            config.llm_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>(ENV_TOOL_TIMEOUT) {
            config.tool_timeout = Duration::from_secs(secs);
        }
        if let Ok(endpoint) = std::env::var(ENV_TRACE_ENDPOINT) {
            if !endpoint.is_empty() {
                config.trace_endpoint = Some(endpoint);
            }
        }
        if let Ok(key) = std::env::var(ENV_TRACE_KEY) {
            if !key.is_empty() {
                config.trace_key = Some(key);
            }
        }
        if let Ok(mode) = std::env::var(ENV_TRACE_MODE) {
            if !mode.is_empty() {
                config.trace_mode = mode;
            }
        }

        config
    }
}

/// Read the provider credential from `<PROVIDER>_API_KEY`.
///
/// The provider name is upper-cased, so `provider_api_key("openai")` reads
/// `OPENAI_API_KEY`.
pub fn provider_api_key(provider: &str) -> Option<String> {
    std::env::var(format!("{}_API_KEY", provider.to_uppercase())).ok()
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.spill_threshold_bytes, 1000);
        assert_eq!(config.capability_ttl, Duration::from_secs(1800));
        assert!(config.fallback_models.is_empty());
        assert!(!config.cross_provider_fallback);
    }

    #[test]
    fn test_provider_api_key_name() {
        std::env::set_var("EXAMPLEPROVIDER_API_KEY", "sk-test");
        assert_eq!(
            provider_api_key("exampleprovider").as_deref(),
            Some("sk-test")
        );
        std::env::remove_var("EXAMPLEPROVIDER_API_KEY");
    }
}
