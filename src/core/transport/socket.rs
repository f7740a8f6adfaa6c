//! Persistent bidirectional transport (priority 1).
//!
//! Frames audio as JSON envelopes over a WebSocket and rotates through a set
//! of accepted envelope shapes ("schema variants") when the remote service
//! rejects the current one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{SendOptions, Transport, TransportEvent, TransportId, TransportState, clamp_quality};
use crate::core::reconciler::TranscriptSegment;
use crate::errors::{RelayError, RelayResult};

/// In-band phrases that indicate the remote service rejected the envelope
/// shape, mirrored alongside close code 1007.
const SCHEMA_FAILURE_PHRASES: [&str; 4] =
    ["Invalid JSON payload", "clientContent", "contents", "parts"];

const SCHEMA_FAILURE_CLOSE_CODE: u16 = 1007;

#[derive(Clone)]
pub struct SocketConfig {
    /// Base WebSocket URL, without `key`/`variant` query parameters.
    pub url_base: String,
    pub api_key: String,
    /// Ordered schema variant ids to try, starting at index 0.
    pub variants: Vec<u8>,
    pub schema_variant_retry_limit: u32,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    pub mime_type: String,
}

impl std::fmt::Debug for SocketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConfig")
            .field("url_base", &self.url_base)
            .field("api_key", &"<redacted>")
            .field("variants", &self.variants)
            .field("schema_variant_retry_limit", &self.schema_variant_retry_limit)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url_base: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService/BidiGenerateContent".to_string(),
            api_key: String::new(),
            variants: vec![13, 14, 15, 16],
            schema_variant_retry_limit: 2,
            reconnect_delay: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(15),
            mime_type: "audio/pcm;rate=16000".to_string(),
        }
    }
}

#[derive(Serialize)]
struct MediaChunk {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct RealtimeInputEnvelope {
    #[serde(rename = "realtimeInput")]
    realtime_input: RealtimeInputBody,
}

#[derive(Serialize)]
struct RealtimeInputBody {
    #[serde(rename = "mediaChunks")]
    media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize)]
struct TurnCompleteEnvelope {
    #[serde(rename = "clientContent")]
    client_content: TurnCompleteBody,
}

#[derive(Serialize)]
struct TurnCompleteBody {
    #[serde(rename = "turnComplete")]
    turn_complete: bool,
}

#[derive(Deserialize)]
struct ServerMessage {
    #[serde(rename = "serverContent")]
    server_content: Option<ServerContent>,
}

#[derive(Deserialize)]
struct ServerContent {
    #[serde(rename = "modelTurn")]
    model_turn: Option<ModelTurn>,
    #[serde(rename = "turnComplete")]
    turn_complete: Option<bool>,
}

#[derive(Deserialize)]
struct ModelTurn {
    parts: Option<Vec<TextPart>>,
}

#[derive(Deserialize)]
struct TextPart {
    text: Option<String>,
}

/// Builds the wire envelope for one schema variant. The remote protocol's
/// variant ids (13..16) have no publicly documented envelope-shape
/// differences, so every entry currently builds the same canonical shape;
/// resolving them into this ordered list once at construction (rather than
/// branching on the variant id inside `send_audio`) is what lets a future
/// variant with a genuinely different shape drop in without touching the
/// send path.
type EnvelopeBuilder = fn(&str, &str) -> RealtimeInputEnvelope;

fn canonical_envelope(mime_type: &str, data: &str) -> RealtimeInputEnvelope {
    RealtimeInputEnvelope {
        realtime_input: RealtimeInputBody {
            media_chunks: vec![MediaChunk { mime_type: mime_type.to_string(), data: data.to_string() }],
        },
    }
}

fn resolve_envelope_builders(variant_count: usize) -> Vec<EnvelopeBuilder> {
    vec![canonical_envelope; variant_count.max(1)]
}

struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
    schema_failures_total: AtomicU64,
    schema_failures_this_connect: AtomicU32,
    variant_idx: AtomicUsize,
    heartbeat_failed: AtomicBool,
    exhausted: AtomicBool,
}

/// Persistent WebSocket transport. Cheaply `Arc`-clonable internals let the
/// background read/write task and heartbeat task share state with the
/// handle returned to the `FallbackManager`.
pub struct SocketTransport {
    config: SocketConfig,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<RwLock<TransportState>>,
    counters: Arc<Counters>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// One envelope builder per entry in `config.variants`, resolved once here.
    envelope_builders: Arc<Vec<EnvelopeBuilder>>,
    /// Session id of the most recent `send_audio` call, stamped onto
    /// transcripts built from inbound messages the read task receives later.
    last_session_id: Arc<RwLock<Option<String>>>,
}

impl SocketTransport {
    pub fn new(config: SocketConfig, events: mpsc::Sender<TransportEvent>) -> Self {
        super::ensure_crypto_provider();
        let envelope_builders = Arc::new(resolve_envelope_builders(config.variants.len()));
        Self {
            config,
            events,
            state: Arc::new(RwLock::new(TransportState::Inactive)),
            counters: Arc::new(Counters {
                attempts: AtomicU64::new(0),
                successes: AtomicU64::new(0),
                schema_failures_total: AtomicU64::new(0),
                schema_failures_this_connect: AtomicU32::new(0),
                variant_idx: AtomicUsize::new(0),
                heartbeat_failed: AtomicBool::new(false),
                exhausted: AtomicBool::new(false),
            }),
            outbound: Arc::new(Mutex::new(None)),
            tasks: Arc::new(Mutex::new(Vec::new())),
            envelope_builders,
            last_session_id: Arc::new(RwLock::new(None)),
        }
    }

    fn build_url(&self, variant: u8) -> String {
        format!("{}?key={}&variant={variant}", self.config.url_base, self.config.api_key)
    }

    async fn connect_variant(&self, idx: usize) -> RelayResult<()> {
        let Some(&variant) = self.config.variants.get(idx) else {
            return Err(RelayError::Configuration("no schema variants configured".into()));
        };

        *self.state.write() = TransportState::Initializing;
        self.counters.variant_idx.store(idx, Ordering::Relaxed);
        self.counters.schema_failures_this_connect.store(0, Ordering::Relaxed);

        let url = self.build_url(variant);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| RelayError::Transport(format!("websocket connect failed: {e}")))?;

        info!(variant, "socket transport connected");
        *self.state.write() = TransportState::Active;

        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock().await = Some(tx);

        let events = self.events.clone();
        let state = self.state.clone();
        let counters = self.counters.clone();
        let config = self.config.clone();
        let outbound = self.outbound.clone();
        let last_session_id = self.last_session_id.clone();
        let self_for_rotate = self.clone_handle();

        let read_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = rx.recv() => {
                        if let Err(e) = sink.send(msg).await {
                            warn!(error = %e, "socket transport send failed");
                            break;
                        }
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(Message::Text(text))) => {
                                counters.successes.fetch_add(1, Ordering::Relaxed);
                                if contains_schema_failure_phrase(&text) {
                                    self_for_rotate.handle_schema_failure().await;
                                    continue;
                                }
                                match parse_server_message(&text) {
                                    Some((transcript, turn_complete)) if !transcript.is_empty() => {
                                        let segment = TranscriptSegment {
                                            id: Uuid::new_v4(),
                                            session_id: last_session_id.read().clone().unwrap_or_default(),
                                            utterance_id: Uuid::new_v4(),
                                            sequence_number: 0,
                                            text: transcript,
                                            confidence: 0.92,
                                            start_time_ms: 0,
                                            end_time_ms: 0,
                                            timestamp: std::time::Instant::now(),
                                            is_partial: !turn_complete,
                                            is_final: turn_complete,
                                            origin_transport: TransportId::Websocket,
                                            merge_history: Vec::new(),
                                            transport_switch_point: false,
                                        };
                                        let _ = events
                                            .send(TransportEvent::Transcription {
                                                transport: TransportId::Websocket,
                                                segment,
                                            })
                                            .await;
                                    }
                                    Some(_) => {
                                        debug!("socket transport received turn-complete message with no transcript text");
                                    }
                                    None => {
                                        debug!(len = text.len(), "socket transport received message");
                                        let _ = events
                                            .send(TransportEvent::Error {
                                                transport: TransportId::Websocket,
                                                message: format!("unparsed payload: {}", truncate(&text, 200)),
                                            })
                                            .await;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let code = frame.as_ref().map(|f| u16::from(f.code));
                                if code == Some(SCHEMA_FAILURE_CLOSE_CODE) {
                                    self_for_rotate.handle_schema_failure().await;
                                } else {
                                    *state.write() = TransportState::Failed;
                                    let _ = events
                                        .send(TransportEvent::Disconnected {
                                            transport: TransportId::Websocket,
                                            code,
                                            reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                                        })
                                        .await;
                                }
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "socket transport stream error");
                                *state.write() = TransportState::Failed;
                                let _ = events
                                    .send(TransportEvent::Error {
                                        transport: TransportId::Websocket,
                                        message: e.to_string(),
                                    })
                                    .await;
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            *outbound.lock().await = None;
        });

        let heartbeat_task = self.spawn_heartbeat();

        let mut tasks = self.tasks.lock().await;
        tasks.push(read_task);
        tasks.push(heartbeat_task);

        Ok(())
    }

    /// Cheap clone sharing the same internal state, used by the background task.
    fn clone_handle(&self) -> Self {
        Self {
            config: self.config.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            counters: self.counters.clone(),
            outbound: self.outbound.clone(),
            tasks: self.tasks.clone(),
            envelope_builders: self.envelope_builders.clone(),
            last_session_id: self.last_session_id.clone(),
        }
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let interval_dur = self.config.heartbeat_interval;
        let outbound = self.outbound.clone();
        let counters = self.counters.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval_dur);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let sender = outbound.lock().await.clone();
                let Some(sender) = sender else { break };
                let payload = serde_json::to_string(&TurnCompleteEnvelope {
                    client_content: TurnCompleteBody { turn_complete: false },
                })
                .unwrap_or_default();
                if sender.send(Message::Text(payload.into())).is_err() {
                    counters.heartbeat_failed.store(true, Ordering::Relaxed);
                    let _ = events
                        .send(TransportEvent::HealthChanged {
                            transport: TransportId::Websocket,
                            healthy: false,
                            quality: 0.5,
                        })
                        .await;
                    break;
                }
            }
        })
    }

    async fn handle_schema_failure(&self) {
        let total = self.counters.schema_failures_total.fetch_add(1, Ordering::Relaxed) + 1;
        let this_connect =
            self.counters.schema_failures_this_connect.fetch_add(1, Ordering::Relaxed) + 1;
        let idx = self.counters.variant_idx.load(Ordering::Relaxed);
        warn!(total, this_connect, variant_idx = idx, "socket transport schema failure");

        let has_next_variant = idx + 1 < self.config.variants.len();
        if has_next_variant && this_connect < self.config.schema_variant_retry_limit {
            let next_idx = idx + 1;
            let delay = self.config.reconnect_delay;
            let handle = self.clone_handle();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = handle.connect_variant(next_idx).await {
                    warn!(error = %e, "schema variant reconnect failed");
                }
            });
        } else {
            self.counters.exhausted.store(true, Ordering::Relaxed);
            *self.state.write() = TransportState::Failed;
            let _ = self.events.send(TransportEvent::SchemaExhausted { transport: TransportId::Websocket }).await;
        }
    }
}

fn contains_schema_failure_phrase(text: &str) -> bool {
    SCHEMA_FAILURE_PHRASES.iter().any(|phrase| text.contains(phrase))
}

/// Extracts `serverContent.modelTurn.parts[*].text` and the `turnComplete`
/// flag from one inbound message. Returns `None` when the message doesn't
/// parse as a server message at all (distinct from parsing fine but
/// carrying no transcript text, e.g. a bare turn-complete acknowledgement).
fn parse_server_message(text: &str) -> Option<(String, bool)> {
    let message = serde_json::from_str::<ServerMessage>(text).ok()?;
    let content = message.server_content?;
    let turn_complete = content.turn_complete.unwrap_or(false);
    let transcript = content
        .model_turn
        .into_iter()
        .flat_map(|t| t.parts.into_iter().flatten())
        .filter_map(|p| p.text)
        .collect::<String>();
    Some((transcript, turn_complete))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max { s } else { &s[..max] }
}

#[async_trait]
impl Transport for SocketTransport {
    fn id(&self) -> TransportId {
        TransportId::Websocket
    }

    #[instrument(skip(self))]
    async fn initialize(&self) -> RelayResult<()> {
        if *self.state.read() == TransportState::Active {
            return Ok(());
        }
        if self.config.api_key.is_empty() {
            return Err(RelayError::Configuration("socket transport requires an api_key".into()));
        }
        self.connect_variant(0).await?;
        let _ = self.events.send(TransportEvent::Connected { transport: TransportId::Websocket }).await;
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn send_audio(
        &self,
        payload: Bytes,
        opts: SendOptions,
    ) -> RelayResult<super::TranscriptionResult> {
        let sender = self.outbound.lock().await.clone();
        let Some(sender) = sender else {
            return Err(RelayError::Transport("socket transport not connected".into()));
        };

        if let Some(session_id) = opts.session_id {
            *self.last_session_id.write() = Some(session_id);
        }

        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let variant_idx = self.counters.variant_idx.load(Ordering::Relaxed);
        let builder = self
            .envelope_builders
            .get(variant_idx)
            .copied()
            .unwrap_or(canonical_envelope);
        let envelope = builder(&self.config.mime_type, &BASE64_STANDARD.encode(&payload));
        let json = serde_json::to_string(&envelope)
            .map_err(|e| RelayError::Transport(format!("failed to encode envelope: {e}")))?;

        sender
            .send(Message::Text(json.into()))
            .map_err(|_| RelayError::Transport("socket transport send channel closed".into()))?;

        // The transcript for this chunk arrives later as a TransportEvent::Transcription
        // once the remote service replies; this call only reports the send succeeded.
        Ok(super::TranscriptionResult::default())
    }

    async fn send_turn_complete(&self) -> RelayResult<()> {
        let sender = self.outbound.lock().await.clone();
        let Some(sender) = sender else {
            return Err(RelayError::Transport("socket transport not connected".into()));
        };
        let json = serde_json::to_string(&TurnCompleteEnvelope {
            client_content: TurnCompleteBody { turn_complete: true },
        })
        .unwrap_or_default();
        sender
            .send(Message::Text(json.into()))
            .map_err(|_| RelayError::Transport("socket transport send channel closed".into()))?;
        Ok(())
    }

    fn is_available(&self) -> bool {
        !self.counters.exhausted.load(Ordering::Relaxed)
    }

    fn state(&self) -> TransportState {
        *self.state.read()
    }

    fn quality(&self) -> f64 {
        let state = *self.state.read();
        if state == TransportState::Inactive || state == TransportState::Failed {
            return 0.0;
        }
        if self.counters.heartbeat_failed.load(Ordering::Relaxed) {
            return 0.5;
        }
        if state != TransportState::Active {
            return 0.2;
        }

        let attempts = self.counters.attempts.load(Ordering::Relaxed);
        let successes = self.counters.successes.load(Ordering::Relaxed);
        let success_rate = if attempts == 0 { 1.0 } else { successes as f64 / attempts as f64 };

        let schema_failures = self.counters.schema_failures_total.load(Ordering::Relaxed);
        let schema_failure_rate =
            if attempts == 0 { 0.0 } else { (schema_failures as f64 / attempts as f64).min(1.0) };

        clamp_quality(success_rate * (1.0 - 0.5 * schema_failure_rate))
    }

    async fn destroy(&self) {
        *self.outbound.lock().await = None;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        *self.state.write() = TransportState::Inactive;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_builders_resolve_one_per_variant() {
        let builders = resolve_envelope_builders(4);
        assert_eq!(builders.len(), 4);
        let envelope = builders[2]("audio/pcm;rate=16000", "ZGF0YQ==");
        assert_eq!(envelope.realtime_input.media_chunks.len(), 1);
        assert_eq!(envelope.realtime_input.media_chunks[0].data, "ZGF0YQ==");
    }

    #[test]
    fn schema_failure_phrase_detection() {
        assert!(contains_schema_failure_phrase("error: Invalid JSON payload near offset 4"));
        assert!(contains_schema_failure_phrase(r#"{"clientContent": {}}"#));
        assert!(!contains_schema_failure_phrase("ordinary transcript text"));
    }

    #[test]
    fn parse_server_message_extracts_text_and_turn_complete() {
        let (text, turn_complete) = parse_server_message(
            r#"{"serverContent":{"modelTurn":{"parts":[{"text":"hello "},{"text":"world"}]},"turnComplete":true}}"#,
        )
        .unwrap();
        assert_eq!(text, "hello world");
        assert!(turn_complete);
    }

    #[test]
    fn parse_server_message_defaults_turn_complete_to_false() {
        let (text, turn_complete) = parse_server_message(
            r#"{"serverContent":{"modelTurn":{"parts":[{"text":"partial"}]}}}"#,
        )
        .unwrap();
        assert_eq!(text, "partial");
        assert!(!turn_complete);
    }

    #[test]
    fn parse_server_message_rejects_non_server_content() {
        assert!(parse_server_message("not json").is_none());
        assert!(parse_server_message(r#"{"somethingElse": true}"#).is_none());
    }

    #[tokio::test]
    async fn quality_is_zero_before_connecting() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = SocketTransport::new(SocketConfig::default(), tx);
        assert_eq!(transport.quality(), 0.0);
        assert_eq!(transport.state(), TransportState::Inactive);
    }

    #[tokio::test]
    async fn send_audio_without_connection_errors() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = SocketTransport::new(SocketConfig::default(), tx);
        let result = transport.send_audio(Bytes::from_static(&[0u8; 4]), SendOptions::default()).await;
        assert!(result.is_err());
    }
}
