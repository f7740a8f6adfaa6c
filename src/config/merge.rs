//! Overlays a parsed YAML document onto the environment-derived base.
//!
//! Priority: YAML > environment variables > defaults. Anything the YAML
//! document leaves `None` keeps whatever the environment-derived base
//! already had.

use std::time::Duration;

use super::RelayConfig;
use super::yaml::YamlConfig;
use crate::core::ConflictResolutionStrategy;
use crate::errors::{RelayError, RelayResult};

pub(super) fn merge_config(yaml: YamlConfig) -> RelayResult<RelayConfig> {
    let mut config = super::env::load()?;

    if let Some(credential) = yaml.credential {
        if let Some(api_key) = credential.api_key {
            config.credential.api_key = api_key;
        }
        if let Some(key_ref) = credential.service_account_key_ref {
            config.credential.service_account_key_ref = Some(key_ref);
        }
    }

    if let Some(transports) = yaml.transports {
        if let Some(url) = transports.socket_url_base {
            config.transports.socket.url_base = url;
        }
        if let Some(endpoint) = transports.http_stream_endpoint {
            config.transports.http_stream.stream_endpoint = endpoint;
        }
        if let Some(endpoint) = transports.batch_endpoint {
            config.transports.batch.endpoint = endpoint;
        }
        if let Some(bytes) = transports.batch_max_bytes {
            config.transports.batch.max_batch_bytes = bytes;
        }
        if let Some(ms) = transports.batch_max_delay_ms {
            config.transports.batch.max_delay = Duration::from_millis(ms);
        }
    }

    if let Some(fallback) = yaml.fallback {
        if let Some(threshold) = fallback.connection_quality_threshold {
            config.fallback.connection_quality_threshold = threshold;
        }
        if let Some(ms) = fallback.fallback_delay_ms {
            config.fallback.fallback_delay = Duration::from_millis(ms);
        }
        if let Some(limit) = fallback.max_consecutive_1007 {
            config.fallback.max_consecutive_1007 = limit;
        }
        if let Some(enabled) = fallback.enable_audio_buffering {
            config.fallback.enable_audio_buffering = enabled;
        }
        if let Some(enabled) = fallback.enable_aggressive_fallback {
            config.fallback.enable_aggressive_fallback = enabled;
        }
        if let Some(ms) = fallback.transport_timeout_ms {
            config.fallback.transport_timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = fallback.max_schema_variant_failures {
            config.fallback.max_schema_variant_failures = limit;
        }
    }

    if let Some(buffer) = yaml.buffer {
        if let Some(max_segments) = buffer.max_segments {
            config.buffer.max_segments = max_segments;
        }
        if let Some(max_bytes) = buffer.max_memory_bytes {
            config.buffer.max_memory_bytes = max_bytes;
        }
        if let Some(ms) = buffer.max_age_ms {
            config.buffer.max_age_ms = ms;
        }
    }

    if let Some(replay) = yaml.replay {
        if let Some(max_concurrent) = replay.max_concurrent_replays {
            config.replay.max_concurrent_replays = max_concurrent;
        }
        if let Some(ms) = replay.backlog_threshold_ms {
            config.replay.backlog_threshold = Duration::from_millis(ms);
        }
    }

    if let Some(reconciler) = yaml.reconciler {
        if let Some(max_buffer) = reconciler.max_segment_buffer {
            config.reconciler.max_segment_buffer = max_buffer;
        }
        if let Some(strategy) = reconciler.conflict_resolution_strategy {
            config.reconciler.strategy = parse_strategy(&strategy)?;
        }
        if let Some(ms) = reconciler.merge_overlap_threshold_ms {
            config.reconciler.merge_overlap_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = reconciler.max_timestamp_drift_ms {
            config.reconciler.max_timestamp_drift = Duration::from_millis(ms);
        }
    }

    if let Some(circuit_breaker) = yaml.circuit_breaker {
        if let Some(threshold) = circuit_breaker.failure_threshold {
            config.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(threshold) = circuit_breaker.success_threshold {
            config.circuit_breaker.success_threshold = threshold;
        }
    }

    Ok(config)
}

/// Parses `reconciler.conflict_resolution_strategy`'s `confidence`/`timestamp`/
/// `transport`/`merge` string values, matching [`ConflictResolutionStrategy`]'s
/// kebab-case serde rename. Shared by [`super::env::load`] for
/// `RELAY_RECONCILER_STRATEGY`.
pub(super) fn parse_strategy(raw: &str) -> RelayResult<ConflictResolutionStrategy> {
    match raw {
        "confidence" => Ok(ConflictResolutionStrategy::Confidence),
        "timestamp" => Ok(ConflictResolutionStrategy::Timestamp),
        "transport" => Ok(ConflictResolutionStrategy::Transport),
        "merge" => Ok(ConflictResolutionStrategy::Merge),
        other => Err(RelayError::Configuration(format!(
            "reconciler.conflict_resolution_strategy: unknown strategy {other:?}"
        ))),
    }
}
