//! Cross-field configuration invariants.
//!
//! Checked once, after a [`super::RelayConfig`] has been fully assembled by
//! `from_env`/`from_file`, independent of which source set which field.

use super::RelayConfig;
use crate::errors::{RelayError, RelayResult};

pub fn validate(config: &RelayConfig) -> RelayResult<()> {
    if config.circuit_breaker.success_threshold == 0 {
        return Err(RelayError::Configuration("circuit_breaker.success_threshold must be > 0".into()));
    }
    if config.circuit_breaker.failure_threshold == 0 {
        return Err(RelayError::Configuration("circuit_breaker.failure_threshold must be > 0".into()));
    }
    if config.buffer.max_segments == 0 {
        return Err(RelayError::Configuration("buffer.max_segments must be > 0".into()));
    }
    if config.buffer.max_memory_bytes == 0 {
        return Err(RelayError::Configuration("buffer.max_memory_bytes must be > 0".into()));
    }
    if config.reconciler.max_segment_buffer == 0 {
        return Err(RelayError::Configuration("reconciler.max_segment_buffer must be > 0".into()));
    }
    if !(0.0..=1.0).contains(&config.fallback.connection_quality_threshold) {
        return Err(RelayError::Configuration(
            "fallback.connection_quality_threshold must be within [0, 1]".into(),
        ));
    }
    if config.transports.batch.max_batch_bytes == 0 {
        return Err(RelayError::Configuration("transports.batch.max_batch_bytes must be > 0".into()));
    }
    if config.replay.max_concurrent_replays == 0 {
        return Err(RelayError::Configuration("replay.max_concurrent_replays must be > 0".into()));
    }

    validate_url("transports.socket.url_base", &config.transports.socket.url_base, &["ws", "wss"])?;
    validate_url("transports.http_stream.stream_endpoint", &config.transports.http_stream.stream_endpoint, &["http", "https"])?;
    validate_url("transports.batch.endpoint", &config.transports.batch.endpoint, &["http", "https"])?;

    Ok(())
}

/// Parses `raw` as an absolute URL and checks its scheme is one of `schemes`.
/// `wss` is the canonical socket scheme; a bare `ws` URL still parses fine,
/// since some deployments front the socket endpoint with a plaintext proxy.
fn validate_url(field: &str, raw: &str, schemes: &[&str]) -> RelayResult<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| RelayError::Configuration(format!("{field} is not a valid URL: {e}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(RelayError::Configuration(format!(
            "{field} must use scheme {schemes:?}, got {:?}",
            parsed.scheme()
        )));
    }
    Ok(())
}
