//! Configuration for the transcription relay core.
//!
//! Loading follows a fixed priority: YAML > environment variables > typed
//! defaults. `.env` loading is the
//! host application's responsibility (`dotenvy::dotenv()`), not the
//! library's — this module only reads whatever is already in the process
//! environment by the time `from_env`/`from_file` run.
//!
//! # Modules
//! - `env`: environment variable loading with typed defaults
//! - `merge`: overlays a parsed YAML document onto the env-derived base
//! - `validation`: cross-field invariant checks
//! - `yaml`: the YAML document shape

mod env;
mod merge;
pub mod validation;
mod yaml;

use std::path::Path;

use crate::core::{
    BufferConfig, CircuitBreakerConfig, FallbackConfig, MonitorConfig, ReconcilerConfig,
    ReplayConfig,
};
use crate::core::transport::batch::BatchConfig;
use crate::core::transport::http_stream::HttpStreamConfig;
use crate::core::transport::socket::SocketConfig;
use crate::errors::RelayResult;

/// An opaque credential handed to every transport. The core never resolves
/// this itself — `RelayConfig::from_env`/`from_file` is the one sanctioned
/// boundary that reads it out of the process environment or a config file.
#[derive(Clone, Default)]
pub struct RelayCredential {
    pub api_key: String,
    /// Optional reference to service-account key material (a file path or an
    /// opaque handle understood by the host); the core never dereferences it.
    pub service_account_key_ref: Option<String>,
}

impl std::fmt::Debug for RelayCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCredential")
            .field("api_key", &if self.api_key.is_empty() { "<empty>" } else { "<redacted>" })
            .field(
                "service_account_key_ref",
                &self.service_account_key_ref.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Per-tier endpoint configuration. `RelayConfig::into_transport_configs`
/// stamps the shared credential into each of these before a transport is
/// constructed from them.
#[derive(Clone, Debug, Default)]
pub struct TransportEndpoints {
    pub socket: SocketConfig,
    pub http_stream: HttpStreamConfig,
    pub batch: BatchConfig,
}

/// The top-level configuration aggregate: one struct threading every
/// component's typed config, loadable from the environment or a YAML file.
#[derive(Clone)]
pub struct RelayConfig {
    pub credential: RelayCredential,
    pub transports: TransportEndpoints,
    pub fallback: FallbackConfig,
    pub buffer: BufferConfig,
    pub replay: ReplayConfig,
    pub reconciler: ReconcilerConfig,
    pub monitor: MonitorConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("credential", &self.credential)
            .field("transports", &self.transports)
            .field("fallback", &self.fallback)
            .field("buffer", &self.buffer)
            .field("replay", &self.replay)
            .field("reconciler", &self.reconciler)
            .field("monitor", &self.monitor)
            .field("circuit_breaker", &self.circuit_breaker)
            .finish()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            credential: RelayCredential::default(),
            transports: TransportEndpoints::default(),
            fallback: FallbackConfig::default(),
            buffer: BufferConfig::default(),
            replay: ReplayConfig::default(),
            reconciler: ReconcilerConfig::default(),
            monitor: MonitorConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Loads configuration from environment variables with typed defaults,
    /// then validates it. Does not touch `.env` files; the host loads those
    /// before calling this, keeping the library's config loading separate
    /// from the binary's startup sequence.
    pub fn from_env() -> RelayResult<Self> {
        let config = env::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Loads the environment-derived base, then overlays a YAML document's
    /// values on top of it (YAML wins on every field it sets).
    pub fn from_file(path: &Path) -> RelayResult<Self> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(yaml_config)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Stamps the shared credential into each transport tier's own config,
    /// consuming `self`. A transport constructed from the result fails fast
    /// on an empty `api_key`.
    pub fn into_transport_configs(self) -> (SocketConfig, HttpStreamConfig, BatchConfig) {
        let mut socket = self.transports.socket;
        let mut http_stream = self.transports.http_stream;
        let mut batch = self.transports.batch;
        socket.api_key = self.credential.api_key.clone();
        http_stream.api_key = self.credential.api_key.clone();
        batch.api_key = self.credential.api_key;
        (socket, http_stream, batch)
    }
}
