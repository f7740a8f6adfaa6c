//! HTTP streaming transport (priority 2).
//!
//! Submits each audio payload as one streaming POST request and concatenates
//! the text extracted from a line-delimited JSON response body.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{SendOptions, Transport, TransportEvent, TransportId, TransportState, clamp_quality};
use crate::core::reconciler::TranscriptSegment;
use crate::errors::{RelayError, RelayResult};

/// Quality is capped here: this tier is inherently less efficient than the
/// persistent socket tier.
const QUALITY_CAP: f64 = 0.8;

#[derive(Clone)]
pub struct HttpStreamConfig {
    pub stream_endpoint: String,
    pub api_key: String,
    pub mime_type: String,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for HttpStreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStreamConfig")
            .field("stream_endpoint", &self.stream_endpoint)
            .field("api_key", &"<redacted>")
            .field("mime_type", &self.mime_type)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for HttpStreamConfig {
    fn default() -> Self {
        Self {
            stream_endpoint: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent".to_string(),
            api_key: String::new(),
            mime_type: "audio/pcm;rate=16000".to_string(),
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
struct StreamChunk {
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

struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
}

pub struct HttpStreamTransport {
    config: HttpStreamConfig,
    client: Client,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<RwLock<TransportState>>,
    counters: Arc<Counters>,
}

impl HttpStreamTransport {
    pub fn new(config: HttpStreamConfig, events: mpsc::Sender<TransportEvent>) -> RelayResult<Self> {
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
        })
    }
}

#[async_trait]
impl Transport for HttpStreamTransport {
    fn id(&self) -> TransportId {
        TransportId::HttpStream
    }

    async fn initialize(&self) -> RelayResult<()> {
        if self.config.api_key.is_empty() {
            return Err(RelayError::Configuration("http_stream transport requires an api_key".into()));
        }
        *self.state.write() = TransportState::Active;
        let _ = self.events.send(TransportEvent::Connected { transport: TransportId::HttpStream }).await;
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn send_audio(
        &self,
        payload: Bytes,
        opts: SendOptions,
    ) -> RelayResult<super::TranscriptionResult> {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

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
            .post(&self.config.stream_endpoint)
            .query(&[("key", self.config.api_key.as_str()), ("alt", "sse")])
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
            return Err(RelayError::Schema(format!("http stream rejected request ({status}): {text}")));
        }

        let mut text = String::new();
        let mut stream = response.bytes_stream();
        let mut leftover = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RelayError::Transport(format!("stream read failed: {e}")))?;
            leftover.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = leftover.find('\n') {
                let line = leftover[..pos].trim().to_string();
                leftover.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                append_chunk_text(&line, &mut text);
            }
        }
        if !leftover.trim().is_empty() {
            append_chunk_text(leftover.trim(), &mut text);
        }

        self.counters.successes.fetch_add(1, Ordering::Relaxed);
        debug!(chars = text.len(), "http stream transport received full response");

        let segment = TranscriptSegment {
            id: Uuid::new_v4(),
            session_id: opts.session_id.unwrap_or_default(),
            utterance_id: Uuid::new_v4(),
            sequence_number: 0,
            text,
            confidence: 0.9,
            start_time_ms: 0,
            end_time_ms: 0,
            timestamp: std::time::Instant::now(),
            is_partial: false,
            is_final: opts.is_final_chunk,
            origin_transport: TransportId::HttpStream,
            merge_history: Vec::new(),
            transport_switch_point: false,
        };

        let _ = self
            .events
            .send(TransportEvent::Transcription { transport: TransportId::HttpStream, segment: segment.clone() })
            .await;

        Ok(super::TranscriptionResult { segment: Some(segment) })
    }

    async fn send_turn_complete(&self) -> RelayResult<()> {
        // Turn completion is implicit: the stream ends when the response body closes.
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
        *self.state.write() = TransportState::Inactive;
    }
}

/// Extracts and appends `candidates[0].content.parts[*].text` from one
/// line-delimited JSON chunk. Chunks that don't parse (keep-alive lines,
/// trailing commas from `alt=sse` framing) are skipped rather than failing
/// the whole response.
fn append_chunk_text(line: &str, out: &mut String) {
    let line = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    let Ok(chunk) = serde_json::from_str::<StreamChunk>(line) else {
        warn!(line = %truncate(line, 120), "http stream transport skipped unparseable chunk");
        return;
    };
    for candidate in chunk.candidates.into_iter().flatten() {
        for part in candidate.content.into_iter().flat_map(|c| c.parts.into_iter().flatten()) {
            if let Some(text) = part.text {
                out.push_str(&text);
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max { s } else { &s[..max] }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_chunk_text_extracts_nested_text() {
        let mut out = String::new();
        append_chunk_text(
            r#"{"candidates":[{"content":{"parts":[{"text":"hello "},{"text":"world"}]}}]}"#,
            &mut out,
        );
        assert_eq!(out, "hello world");
    }

    #[test]
    fn append_chunk_text_ignores_garbage_lines() {
        let mut out = String::new();
        append_chunk_text("not json", &mut out);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn quality_capped_below_one() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = HttpStreamTransport::new(
            HttpStreamConfig { api_key: "k".into(), ..Default::default() },
            tx,
        )
        .unwrap();
        transport.initialize().await.unwrap();
        transport.counters.attempts.store(10, Ordering::Relaxed);
        transport.counters.successes.store(10, Ordering::Relaxed);
        assert!(transport.quality() <= QUALITY_CAP + f64::EPSILON);
    }
}
