//! Transport abstraction and the three concrete tiers: socket, HTTP stream, batch.

pub mod batch;
pub mod http_stream;
pub mod socket;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::reconciler::TranscriptSegment;
use crate::errors::RelayResult;

/// Identifies one of the three transport tiers. Ordering follows `priority()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportId {
    Websocket,
    HttpStream,
    Batch,
}

impl TransportId {
    /// Lower is higher priority: Websocket=1, HttpStream=2, Batch=3.
    pub fn priority(&self) -> u8 {
        match self {
            TransportId::Websocket => 1,
            TransportId::HttpStream => 2,
            TransportId::Batch => 3,
        }
    }

    pub fn service_name(&self) -> &'static str {
        match self {
            TransportId::Websocket => "websocket",
            TransportId::HttpStream => "http_stream",
            TransportId::Batch => "batch",
        }
    }

    pub fn all_by_priority() -> [TransportId; 3] {
        [TransportId::Websocket, TransportId::HttpStream, TransportId::Batch]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Inactive,
    Initializing,
    Active,
    Degraded,
    Failed,
}

/// Options accompanying a single `send_audio` call.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub session_id: Option<String>,
    pub is_final_chunk: bool,
    /// Voice-activity hint from upstream VAD, used to derive buffer priority.
    pub has_voice_activity: bool,
    /// Duration of this audio chunk, used to derive buffer priority.
    pub duration: Option<Duration>,
    pub chunk_index: Option<u64>,
}

/// Outcome of a successful send: either an immediate transcript fragment
/// (socket/stream tiers) or nothing yet (batch tier responds asynchronously
/// via the event channel).
#[derive(Debug, Clone, Default)]
pub struct TranscriptionResult {
    pub segment: Option<TranscriptSegment>,
}

/// Event surface shared by all transport variants.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected { transport: TransportId },
    Disconnected { transport: TransportId, code: Option<u16>, reason: String },
    Error { transport: TransportId, message: String },
    HealthChanged { transport: TransportId, healthy: bool, quality: f64 },
    SchemaExhausted { transport: TransportId },
    Transcription { transport: TransportId, segment: TranscriptSegment },
}

/// Shared contract implemented by each transport tier.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Idempotent: must reach `Active` or return an error.
    async fn initialize(&self) -> RelayResult<()>;

    async fn send_audio(
        &self,
        payload: bytes::Bytes,
        opts: SendOptions,
    ) -> RelayResult<TranscriptionResult>;

    async fn send_turn_complete(&self) -> RelayResult<()>;

    /// Static capability check; does not imply current health.
    fn is_available(&self) -> bool;

    fn state(&self) -> TransportState;

    /// Current quality estimate in `[0, 1]`, capped per-tier.
    fn quality(&self) -> f64;

    /// Releases resources. Always safe to call more than once.
    async fn destroy(&self);
}

pub(crate) fn clamp_quality(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

pub(crate) const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Installs the `ring` crypto provider as the process default exactly once.
///
/// `reqwest`'s `rustls-tls` feature and `tokio-tungstenite`'s
/// `rustls-tls-webpki-roots` feature each depend on `rustls` 0.23, which
/// since that version no longer picks a default `CryptoProvider` for you;
/// without an explicit install the first TLS handshake panics if more than
/// one provider-capable backend is linked in. Every transport constructor
/// calls this before opening a connection.
pub(crate) fn ensure_crypto_provider() {
    static INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
    once_cell::sync::Lazy::force(&INIT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_tier_table() {
        assert!(TransportId::Websocket.priority() < TransportId::HttpStream.priority());
        assert!(TransportId::HttpStream.priority() < TransportId::Batch.priority());
    }
}
