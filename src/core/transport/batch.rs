//! Batch transport (priority 3).
//!
//! Accumulates audio until a byte-size threshold or a max-delay elapses,
//! then submits a single non-streaming request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{SendOptions, Transport, TransportEvent, TransportId, TransportState, clamp_quality};
use crate::core::reconciler::TranscriptSegment;
use crate::errors::{RelayError, RelayResult};

/// Quality is capped here: this tier trades latency for request efficiency.
const QUALITY_CAP: f64 = 0.6;

#[derive(Clone)]
pub struct BatchConfig {
    pub endpoint: String,
    pub api_key: String,
    pub mime_type: String,
    pub max_batch_bytes: usize,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("mime_type", &self.mime_type)
            .field("max_batch_bytes", &self.max_batch_bytes)
            .field("max_delay", &self.max_delay)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".to_string(),
            api_key: String::new(),
            mime_type: "audio/pcm;rate=16000".to_string(),
            max_batch_bytes: 256 * 1024,
            max_delay: Duration::from_secs(3),
            request_timeout: super::DEFAULT_TRANSPORT_TIMEOUT,
        }
    }
}

#[derive(Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    #[serde(rename = "inlineData")]
    inline_data: InlineData,
}

#[derive(Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "candidateCount")]
    candidate_count: u32,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<TextPart>>,
}

#[derive(Deserialize)]
struct TextPart {
    text: Option<String>,
}

struct Pending {
    bytes: Vec<u8>,
    first_chunk_at: Option<Instant>,
    session_id: Option<String>,
}

struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
}

/// This "compression" step is a pass-through placeholder; no concrete codec
/// is specified for the remote endpoint's batch body.
fn compress(raw: &[u8]) -> Vec<u8> {
    raw.to_vec()
}

pub struct BatchTransport {
    config: BatchConfig,
    client: Client,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<RwLock<TransportState>>,
    counters: Arc<Counters>,
    pending: Arc<Mutex<Pending>>,
    timer_task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl BatchTransport {
    pub fn new(config: BatchConfig, events: mpsc::Sender<TransportEvent>) -> RelayResult<Self> {
        super::ensure_crypto_provider();
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RelayError::Configuration(format!("failed to build http client: {e}")))?;
        Ok(Self {
            config,
            client,
            events,
            state: Arc::new(RwLock::new(TransportState::Inactive)),
            counters: Arc::new(Counters { attempts: AtomicU64::new(0), successes: AtomicU64::new(0) }),
            pending: Arc::new(Mutex::new(Pending { bytes: Vec::new(), first_chunk_at: None, session_id: None })),
            timer_task: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    fn spawn_delay_timer(&self) {
        let max_delay = self.config.max_delay;
        let pending = self.pending.clone();
        let this = self.clone_handle();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(max_delay).await;
            let should_flush = {
                let guard = pending.lock();
                guard.first_chunk_at.map(|t| t.elapsed() >= max_delay).unwrap_or(false)
            };
            if should_flush {
                if let Err(e) = this.flush().await {
                    warn!(error = %e, "batch transport delay-triggered flush failed");
                }
            }
        });
        // best effort: previous handle (if any) is left to finish or has already fired
        if let Ok(mut slot) = self.timer_task.try_lock() {
            *slot = Some(handle);
        }
    }

    fn clone_handle(&self) -> Self {
        Self {
            config: self.config.clone(),
            client: self.client.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            counters: self.counters.clone(),
            pending: self.pending.clone(),
            timer_task: self.timer_task.clone(),
        }
    }

    #[instrument(skip(self))]
    async fn flush(&self) -> RelayResult<super::TranscriptionResult> {
        let (bytes, session_id) = {
            let mut guard = self.pending.lock();
            if guard.bytes.is_empty() {
                return Ok(super::TranscriptionResult::default());
            }
            guard.first_chunk_at = None;
            (std::mem::take(&mut guard.bytes), guard.session_id.take())
        };

        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let payload = compress(&bytes);

        let body = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part {
                    inline_data: InlineData {
                        mime_type: self.config.mime_type.clone(),
                        data: BASE64_STANDARD.encode(&payload),
                    },
                }],
            }],
            generation_config: GenerationConfig { temperature: 0.0, candidate_count: 1 },
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() >= 500 {
            return Err(RelayError::Transport(format!("server error: {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RelayError::Schema(format!("batch transport rejected request ({status}): {text}")));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Transport(format!("failed to parse response: {e}")))?;

        let mut text = String::new();
        for candidate in parsed.candidates.into_iter().flatten() {
            for part in candidate.content.into_iter().flat_map(|c| c.parts.into_iter().flatten()) {
                if let Some(t) = part.text {
                    text.push_str(&t);
                }
            }
        }

        self.counters.successes.fetch_add(1, Ordering::Relaxed);
        debug!(bytes = payload.len(), chars = text.len(), "batch transport flushed");

        let segment = TranscriptSegment {
            id: Uuid::new_v4(),
            session_id: session_id.unwrap_or_default(),
            utterance_id: Uuid::new_v4(),
            sequence_number: 0,
            text,
            confidence: 0.85,
            start_time_ms: 0,
            end_time_ms: 0,
            timestamp: Instant::now(),
            is_partial: false,
            is_final: true,
            origin_transport: TransportId::Batch,
            merge_history: Vec::new(),
            transport_switch_point: false,
        };

        let _ = self
            .events
            .send(TransportEvent::Transcription { transport: TransportId::Batch, segment: segment.clone() })
            .await;

        Ok(super::TranscriptionResult { segment: Some(segment) })
    }
}

#[async_trait]
impl Transport for BatchTransport {
    fn id(&self) -> TransportId {
        TransportId::Batch
    }

    async fn initialize(&self) -> RelayResult<()> {
        if self.config.api_key.is_empty() {
            return Err(RelayError::Configuration("batch transport requires an api_key".into()));
        }
        *self.state.write() = TransportState::Active;
        let _ = self.events.send(TransportEvent::Connected { transport: TransportId::Batch }).await;
        Ok(())
    }

    async fn send_audio(
        &self,
        payload: Bytes,
        opts: SendOptions,
    ) -> RelayResult<super::TranscriptionResult> {
        let should_flush_now = {
            let mut guard = self.pending.lock();
            if guard.first_chunk_at.is_none() {
                guard.first_chunk_at = Some(Instant::now());
                guard.session_id = opts.session_id.clone();
                self.spawn_delay_timer();
            }
            guard.bytes.extend_from_slice(&payload);
            guard.bytes.len() >= self.config.max_batch_bytes
        };

        if should_flush_now || opts.is_final_chunk {
            self.flush().await
        } else {
            Ok(super::TranscriptionResult::default())
        }
    }

    async fn send_turn_complete(&self) -> RelayResult<()> {
        self.flush().await?;
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }

    fn state(&self) -> TransportState {
        *self.state.read()
    }

    fn quality(&self) -> f64 {
        if *self.state.read() != TransportState::Active {
            return 0.0;
        }
        let attempts = self.counters.attempts.load(Ordering::Relaxed);
        let successes = self.counters.successes.load(Ordering::Relaxed);
        let success_rate = if attempts == 0 { 1.0 } else { successes as f64 / attempts as f64 };
        clamp_quality(success_rate).min(QUALITY_CAP)
    }

    async fn destroy(&self) {
        if let Some(task) = self.timer_task.lock().await.take() {
            task.abort();
        }
        *self.state.write() = TransportState::Inactive;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(events_cap: usize) -> (BatchTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(events_cap);
        let transport = BatchTransport::new(
            BatchConfig { api_key: "k".into(), max_batch_bytes: 16, ..Default::default() },
            tx,
        )
        .unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn send_turn_complete_forces_flush_even_below_threshold() {
        let (transport, _rx) = make(8);
        transport.initialize().await.unwrap();

        {
            let mut guard = transport.pending.lock();
            guard.bytes = vec![1, 2, 3];
            guard.first_chunk_at = Some(Instant::now());
        }

        // flush() will attempt a real network call and fail in this offline test
        // environment; we only assert the pending buffer was drained before the call.
        let _ = transport.send_turn_complete().await;
        assert!(transport.pending.lock().bytes.is_empty());
    }

    #[test]
    fn quality_capped_below_one_when_active() {
        let (transport, _rx) = make(8);
        *transport.state.write() = TransportState::Active;
        transport.counters.attempts.store(4, Ordering::Relaxed);
        transport.counters.successes.store(4, Ordering::Relaxed);
        assert!(transport.quality() <= QUALITY_CAP + f64::EPSILON);
    }
}
