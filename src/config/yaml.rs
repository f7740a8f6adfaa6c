//! YAML configuration document shape.
//!
//! Every field is optional so a YAML file only needs to specify the values
//! it wants to override; anything absent falls through to the
//! environment-derived base in [`super::merge`].

use std::path::Path;

use serde::Deserialize;

use crate::errors::{RelayError, RelayResult};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub credential: Option<CredentialYaml>,
    pub transports: Option<TransportsYaml>,
    pub fallback: Option<FallbackYaml>,
    pub buffer: Option<BufferYaml>,
    pub replay: Option<ReplayYaml>,
    pub reconciler: Option<ReconcilerYaml>,
    pub circuit_breaker: Option<CircuitBreakerYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CredentialYaml {
    pub api_key: Option<String>,
    pub service_account_key_ref: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TransportsYaml {
    pub socket_url_base: Option<String>,
    pub http_stream_endpoint: Option<String>,
    pub batch_endpoint: Option<String>,
    pub batch_max_bytes: Option<usize>,
    pub batch_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FallbackYaml {
    pub connection_quality_threshold: Option<f64>,
    pub fallback_delay_ms: Option<u64>,
    pub transport_timeout_ms: Option<u64>,
    pub max_consecutive_1007: Option<u32>,
    pub max_schema_variant_failures: Option<u32>,
    pub enable_audio_buffering: Option<bool>,
    pub enable_aggressive_fallback: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BufferYaml {
    pub max_segments: Option<usize>,
    pub max_memory_bytes: Option<usize>,
    pub max_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReplayYaml {
    pub max_concurrent_replays: Option<usize>,
    pub backlog_threshold_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReconcilerYaml {
    pub max_segment_buffer: Option<usize>,
    pub conflict_resolution_strategy: Option<String>,
    pub merge_overlap_threshold_ms: Option<u64>,
    pub max_timestamp_drift_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CircuitBreakerYaml {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
}

impl YamlConfig {
    pub(super) fn from_file(path: &Path) -> RelayResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Configuration(format!("failed to read {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| RelayError::Configuration(format!("failed to parse {}: {e}", path.display())))
    }
}
