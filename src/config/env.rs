//! Environment variable loading with typed defaults.
//!
//! Every variable is optional; an unset variable falls back to the default
//! already baked into the relevant component's `Default` impl.

use std::time::Duration;

use super::RelayConfig;
use super::merge::parse_strategy;
use crate::errors::{RelayError, RelayResult};

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str) -> RelayResult<Option<T>> {
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| RelayError::Configuration(format!("{name} is not a valid value: {raw}"))),
    }
}

fn parse_duration_ms(name: &str) -> RelayResult<Option<Duration>> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_millis))
}

/// Builds a [`RelayConfig`] from environment variables, falling back to
/// each component's typed default for anything unset.
pub(super) fn load() -> RelayResult<RelayConfig> {
    let mut config = RelayConfig::default();

    config.credential.api_key = var("RELAY_API_KEY").unwrap_or_default();
    config.credential.service_account_key_ref = var("RELAY_SERVICE_ACCOUNT_KEY_REF");

    if let Some(url) = var("RELAY_SOCKET_URL_BASE") {
        config.transports.socket.url_base = url;
    }
    if let Some(endpoint) = var("RELAY_HTTP_STREAM_ENDPOINT") {
        config.transports.http_stream.stream_endpoint = endpoint;
    }
    if let Some(endpoint) = var("RELAY_BATCH_ENDPOINT") {
        config.transports.batch.endpoint = endpoint;
    }
    if let Some(bytes) = parse_var::<usize>("RELAY_BATCH_MAX_BYTES")? {
        config.transports.batch.max_batch_bytes = bytes;
    }
    if let Some(delay) = parse_duration_ms("RELAY_BATCH_MAX_DELAY_MS")? {
        config.transports.batch.max_delay = delay;
    }

    if let Some(threshold) = parse_var::<f64>("RELAY_CONNECTION_QUALITY_THRESHOLD")? {
        config.fallback.connection_quality_threshold = threshold;
    }
    if let Some(delay) = parse_duration_ms("RELAY_FALLBACK_DELAY_MS")? {
        config.fallback.fallback_delay = delay;
    }
    if let Some(timeout) = parse_duration_ms("RELAY_TRANSPORT_TIMEOUT_MS")? {
        config.fallback.transport_timeout = timeout;
    }
    if let Some(limit) = parse_var::<u32>("RELAY_MAX_CONSECUTIVE_1007")? {
        config.fallback.max_consecutive_1007 = limit;
    }
    if let Some(limit) = parse_var::<u32>("RELAY_MAX_SCHEMA_VARIANT_FAILURES")? {
        config.fallback.max_schema_variant_failures = limit;
    }
    if let Some(enabled) = parse_var::<bool>("RELAY_ENABLE_AUDIO_BUFFERING")? {
        config.fallback.enable_audio_buffering = enabled;
    }
    if let Some(enabled) = parse_var::<bool>("RELAY_ENABLE_AGGRESSIVE_FALLBACK")? {
        config.fallback.enable_aggressive_fallback = enabled;
    }

    if let Some(max_segments) = parse_var::<usize>("RELAY_BUFFER_MAX_SEGMENTS")? {
        config.buffer.max_segments = max_segments;
    }
    if let Some(max_bytes) = parse_var::<usize>("RELAY_BUFFER_MAX_MEMORY_BYTES")? {
        config.buffer.max_memory_bytes = max_bytes;
    }
    if let Some(ms) = parse_var::<u64>("RELAY_BUFFER_MAX_AGE_MS")? {
        config.buffer.max_age_ms = ms;
    }

    if let Some(max_concurrent) = parse_var::<usize>("RELAY_REPLAY_MAX_CONCURRENT_REPLAYS")? {
        config.replay.max_concurrent_replays = max_concurrent;
    }
    if let Some(threshold) = parse_duration_ms("RELAY_REPLAY_BACKLOG_THRESHOLD_MS")? {
        config.replay.backlog_threshold = threshold;
    }

    if let Some(max_buffer) = parse_var::<usize>("RELAY_RECONCILER_MAX_SEGMENT_BUFFER")? {
        config.reconciler.max_segment_buffer = max_buffer;
    }
    if let Some(strategy) = var("RELAY_RECONCILER_STRATEGY") {
        config.reconciler.strategy = parse_strategy(&strategy)?;
    }
    if let Some(ms) = parse_duration_ms("RELAY_RECONCILER_MERGE_OVERLAP_THRESHOLD_MS")? {
        config.reconciler.merge_overlap_threshold = ms;
    }
    if let Some(ms) = parse_duration_ms("RELAY_RECONCILER_MAX_TIMESTAMP_DRIFT_MS")? {
        config.reconciler.max_timestamp_drift = ms;
    }

    if let Some(threshold) = parse_var::<u32>("RELAY_CIRCUIT_FAILURE_THRESHOLD")? {
        config.circuit_breaker.failure_threshold = threshold;
    }
    if let Some(threshold) = parse_var::<u32>("RELAY_CIRCUIT_SUCCESS_THRESHOLD")? {
        config.circuit_breaker.success_threshold = threshold;
    }

    Ok(config)
}
