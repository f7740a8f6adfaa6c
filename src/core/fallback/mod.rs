//! Central orchestrator tying transports, the circuit breaker, the replay
//! engine, the connection monitor, and the transcript reconciler together
//! into one resilient send path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::buffer::{AudioSegment, AudioSegmentBuffer, BufferConfig};
use crate::core::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
use crate::core::monitor::{ConnectionMonitor, MonitorConfig, MonitorEvent};
use crate::core::reconciler::{RawTranscriptEvent, ReconcilerConfig, TranscriptReconciler};
use crate::core::replay::{FnReplayHandler, ReplayConfig, ReplayEngine, ReplayEvent};
use crate::core::transport::{SendOptions, Transport, TransportEvent, TransportId, TransportState};
use crate::errors::{RelayError, RelayResult};

const MAX_TRANSPORT_FAILURES: u32 = 3;
const MAX_REPLAY_BUFFER: usize = 100;
const MONITOR_EVENT_WINDOW: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct FallbackConfig {
    pub max_consecutive_1007: u32,
    pub max_schema_variant_failures: u32,
    pub connection_quality_threshold: f64,
    pub fallback_delay: Duration,
    pub transport_timeout: Duration,
    pub enable_aggressive_fallback: bool,
    pub enable_audio_buffering: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_consecutive_1007: 4,
            max_schema_variant_failures: 4,
            connection_quality_threshold: 0.3,
            fallback_delay: Duration::from_millis(200),
            transport_timeout: super::transport::DEFAULT_TRANSPORT_TIMEOUT,
            enable_aggressive_fallback: true,
            enable_audio_buffering: true,
        }
    }
}

/// Consumer-facing events: the public surface of the relay.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Transcription {
        id: Uuid,
        text: String,
        confidence: Option<f64>,
        source: TransportId,
        session_id: String,
        utterance_id: Uuid,
        is_partial: bool,
        is_final: bool,
    },
    TransportChanged {
        from: Option<TransportId>,
        to: TransportId,
    },
    TransportFailed {
        name: TransportId,
        error: String,
    },
    FallbackExhausted,
    BacklogWarning {
        size: usize,
    },
    SegmentReplayed {
        segment: AudioSegment,
        result: crate::core::transport::TranscriptionResult,
    },
    SegmentFailed {
        segment: AudioSegment,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackStatistics {
    pub current_transport: Option<TransportId>,
    pub state: Option<TransportState>,
    pub buffer_size: usize,
    pub quality: f64,
    pub consecutive_schema_errors: u32,
    pub schema_variant_failures: u32,
    pub transport_switches: u64,
}

struct TransportSlot {
    transport: Arc<dyn Transport>,
    failures: AtomicU32,
}

/// Owns the current transport slot, drives fallback transitions, and fans
/// out `RelayEvent`s to subscribers.
pub struct FallbackManager {
    config: FallbackConfig,
    slots: Vec<TransportSlot>,
    current: RwLock<Option<usize>>,
    transitioning: std::sync::atomic::AtomicBool,
    circuit_breakers: CircuitBreakerManager,
    replay_engine: ReplayEngine,
    reconciler: Arc<TranscriptReconciler>,
    monitor: Arc<ConnectionMonitor>,
    outbound: broadcast::Sender<RelayEvent>,
    consecutive_1007: AtomicU32,
    schema_variant_failures: AtomicU32,
    transport_switches: AtomicU64,
}

impl FallbackManager {
    pub fn new(
        config: FallbackConfig,
        transports: Vec<Arc<dyn Transport>>,
        buffer_config: BufferConfig,
        replay_config: ReplayConfig,
        reconciler_config: ReconcilerConfig,
        monitor_config: MonitorConfig,
    ) -> (Self, broadcast::Receiver<RelayEvent>, mpsc::Receiver<MonitorEvent>) {
        Self::with_circuit_breaker_config(
            config,
            transports,
            buffer_config,
            replay_config,
            reconciler_config,
            monitor_config,
            CircuitBreakerConfig::default(),
        )
    }

    /// Same as [`Self::new`], but lets the caller supply the circuit breaker
    /// config each transport's service name is registered under (the
    /// manager lazily creates one breaker per service via
    /// [`CircuitBreakerManager::get_or_create`]).
    pub fn with_circuit_breaker_config(
        config: FallbackConfig,
        transports: Vec<Arc<dyn Transport>>,
        buffer_config: BufferConfig,
        replay_config: ReplayConfig,
        reconciler_config: ReconcilerConfig,
        monitor_config: MonitorConfig,
        circuit_breaker_config: CircuitBreakerConfig,
    ) -> (Self, broadcast::Receiver<RelayEvent>, mpsc::Receiver<MonitorEvent>) {
        let mut ordered = transports;
        ordered.sort_by_key(|t| t.id().priority());

        let slots =
            ordered.into_iter().map(|transport| TransportSlot { transport, failures: AtomicU32::new(0) }).collect();

        let buffer = Arc::new(AudioSegmentBuffer::new(buffer_config));
        let (replay_tx, mut replay_rx) = mpsc::channel(64);
        let replay_engine = ReplayEngine::new(replay_config, buffer, replay_tx);

        let (outbound, sub) = broadcast::channel(256);
        let outbound_for_replay = outbound.clone();
        tokio::spawn(async move {
            while let Some(event) = replay_rx.recv().await {
                let mapped = match event {
                    ReplayEvent::SegmentReplayed { segment, result } => {
                        RelayEvent::SegmentReplayed { segment, result }
                    }
                    ReplayEvent::SegmentFailed { segment, error } => RelayEvent::SegmentFailed { segment, error },
                    ReplayEvent::BacklogWarning { size } => RelayEvent::BacklogWarning { size },
                };
                let _ = outbound_for_replay.send(mapped);
            }
        });

        let (monitor_tx, monitor_rx) = mpsc::channel(64);
        let monitor = Arc::new(ConnectionMonitor::new(monitor_config, monitor_tx));

        let manager = Self {
            config,
            slots,
            current: RwLock::new(None),
            transitioning: std::sync::atomic::AtomicBool::new(false),
            circuit_breakers: CircuitBreakerManager::new(circuit_breaker_config),
            replay_engine,
            reconciler: Arc::new(TranscriptReconciler::new(reconciler_config)),
            monitor,
            outbound,
            consecutive_1007: AtomicU32::new(0),
            schema_variant_failures: AtomicU32::new(0),
            transport_switches: AtomicU64::new(0),
        };
        (manager, sub, monitor_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.outbound.subscribe()
    }

    fn emit(&self, event: RelayEvent) {
        let _ = self.outbound.send(event);
    }

    fn slot_index_for(&self, id: TransportId) -> Option<usize> {
        self.slots.iter().position(|s| s.transport.id() == id)
    }

    /// Highest-priority available transport, excluding `exclude`, whose
    /// failure counter is below the cap.
    fn best_candidate(&self, exclude: Option<usize>) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(idx, slot)| {
                Some(*idx) != exclude
                    && slot.transport.is_available()
                    && slot.failures.load(Ordering::Relaxed) < MAX_TRANSPORT_FAILURES
            })
            .min_by_key(|(_, slot)| slot.transport.id().priority())
            .map(|(idx, _)| idx)
    }

    #[instrument(skip(self))]
    pub async fn start(&self, session_id: Option<String>) -> RelayResult<()> {
        self.reconciler.start_session(session_id.unwrap_or_else(|| Uuid::new_v4().to_string()));

        let Some(idx) = self.best_candidate(None) else {
            self.emit(RelayEvent::FallbackExhausted);
            return Err(RelayError::FallbackExhausted);
        };

        self.slots[idx].transport.initialize().await.map_err(|e| {
            self.slots[idx].failures.fetch_add(1, Ordering::Relaxed);
            e
        })?;

        *self.current.write() = Some(idx);
        self.transport_switches.fetch_add(1, Ordering::Relaxed);
        self.emit(RelayEvent::TransportChanged { from: None, to: self.slots[idx].transport.id() });
        Ok(())
    }

    fn current_slot(&self) -> Option<&TransportSlot> {
        let idx = (*self.current.read())?;
        Some(&self.slots[idx])
    }

    #[instrument(skip(self, payload))]
    pub async fn send_audio(&self, payload: Bytes, opts: SendOptions) -> RelayResult<()> {
        if self.config.enable_audio_buffering {
            let duration = opts.duration.unwrap_or(Duration::from_millis(20));
            let priority = AudioSegment::derive_priority(opts.has_voice_activity, duration);
            let segment = AudioSegment::new(payload.clone(), duration, priority).with_metadata(
                crate::core::buffer::AudioSegmentMetadata {
                    session_id: opts.session_id.clone(),
                    chunk_index: opts.chunk_index,
                    has_voice_activity: opts.has_voice_activity,
                    ..Default::default()
                },
            );
            self.replay_engine.buffer().append(segment);
            enforce_buffer_cap(self.replay_engine.buffer(), MAX_REPLAY_BUFFER);
        }

        let Some(slot) = self.current_slot() else {
            return Err(RelayError::Transport("no active transport".into()));
        };
        let transport = slot.transport.clone();
        let service = transport.id().service_name();
        let breaker = self.circuit_breakers.get_or_create(service);

        let outcome = breaker.call(service, || transport.send_audio(payload, opts)).await;

        match outcome {
            Ok(_result) => {
                // The transport's own `TransportEvent::Transcription`, drained by
                // `handle_transport_event`, is the single delivery path for the
                // resulting segment (every transport sends it on that channel,
                // whether or not it also returns one synchronously here).
                self.consecutive_1007.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                if matches!(err, RelayError::Schema(_)) {
                    self.handle_schema_error(&err, None).await;
                } else {
                    self.emit(RelayEvent::TransportFailed { name: transport.id(), error: err.to_string() });
                }
                Err(err)
            }
        }
    }

    pub async fn send_turn_complete(&self) -> RelayResult<()> {
        let Some(slot) = self.current_slot() else {
            return Err(RelayError::Transport("no active transport".into()));
        };
        match slot.transport.send_turn_complete().await {
            Ok(()) => Ok(()),
            Err(err) if matches!(err, RelayError::Schema(_)) => {
                self.handle_schema_error(&err, None).await;
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    /// Increments schema-error counters; triggers fallback once thresholds are crossed.
    #[instrument(skip(self, err))]
    pub async fn handle_schema_error(&self, err: &RelayError, _variant: Option<u8>) {
        let consecutive = self.consecutive_1007.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.schema_variant_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(consecutive, total, error = %err, "schema error observed");

        if consecutive >= self.config.max_consecutive_1007 || total >= self.config.max_schema_variant_failures {
            self.force_fallback("schema error threshold exceeded").await;
        }
    }

    #[instrument(skip(self))]
    pub async fn force_fallback(&self, reason: &str) {
        if self.transitioning.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(reason, "forcing transport fallback");
        let result = self.transition(0).await;
        self.transitioning.store(false, Ordering::Release);

        if result.is_err() {
            self.emit(RelayEvent::FallbackExhausted);
        }
    }

    /// Recursively tries candidates in priority order, bounded by the
    /// transport count, per the transition protocol.
    async fn transition(&self, attempt: usize) -> RelayResult<()> {
        if attempt >= self.slots.len() {
            return Err(RelayError::FallbackExhausted);
        }

        let from_idx = *self.current.read();
        let from_id = from_idx.map(|idx| self.slots[idx].transport.id());

        let Some(next_idx) = self.best_candidate(from_idx) else {
            return Err(RelayError::FallbackExhausted);
        };

        if let Some(idx) = from_idx {
            self.slots[idx].transport.destroy().await;
        }
        tokio::time::sleep(self.config.fallback_delay).await;

        match self.slots[next_idx].transport.initialize().await {
            Ok(()) => {
                *self.current.write() = Some(next_idx);
                self.consecutive_1007.store(0, Ordering::Relaxed);
                self.schema_variant_failures.store(0, Ordering::Relaxed);
                self.transport_switches.fetch_add(1, Ordering::Relaxed);
                let to_id = self.slots[next_idx].transport.id();
                self.reconciler.mark_transport_switch(std::time::Instant::now());
                self.emit(RelayEvent::TransportChanged { from: from_id, to: to_id });

                let transport = self.slots[next_idx].transport.clone();
                let handler = FnReplayHandler::new(move |segment: AudioSegment| {
                    let transport = transport.clone();
                    async move {
                        transport
                            .send_audio(
                                segment.payload,
                                SendOptions {
                                    session_id: segment.metadata.session_id,
                                    has_voice_activity: segment.metadata.has_voice_activity,
                                    duration: Some(segment.duration),
                                    chunk_index: segment.metadata.chunk_index,
                                    is_final_chunk: false,
                                },
                            )
                            .await
                    }
                });
                self.replay_engine.run_replay_cycle(&handler).await;
                Ok(())
            }
            Err(e) => {
                self.slots[next_idx].failures.fetch_add(1, Ordering::Relaxed);
                warn!(transport = ?self.slots[next_idx].transport.id(), error = %e, "fallback candidate init failed");
                Box::pin(self.transition(attempt + 1)).await
            }
        }
    }

    /// Reacts to connection-monitor signals per the integration rules:
    /// low quality (when aggressive fallback is enabled), repeated heartbeat
    /// timeouts, or any recovery-needed signal all trigger a fallback.
    pub async fn handle_monitor_event(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::HeartbeatTimeout { consecutive_timeouts } if consecutive_timeouts >= MONITOR_EVENT_WINDOW => {
                self.force_fallback("repeated heartbeat timeouts").await;
            }
            MonitorEvent::HealthChanged { quality, .. } => {
                let aggressive_trips = self.config.enable_aggressive_fallback && quality <= 0.2;
                if quality <= self.config.connection_quality_threshold && aggressive_trips {
                    self.force_fallback("connection quality below threshold").await;
                }
            }
            MonitorEvent::RecoveryNeeded { reason, .. } => {
                self.force_fallback(&reason).await;
            }
            _ => {}
        }
    }

    /// Reacts to a transport's own event surface (schema exhaustion, health
    /// changes reported directly by the transport rather than the monitor).
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::SchemaExhausted { transport } => {
                warn!(?transport, "transport exhausted its schema variants");
                self.force_fallback("schema variants exhausted").await;
            }
            TransportEvent::Disconnected { transport, code, reason } => {
                self.emit(RelayEvent::TransportFailed {
                    name: transport,
                    error: format!("disconnected (code {code:?}): {reason}"),
                });
                self.force_fallback("transport disconnected").await;
            }
            TransportEvent::Error { transport, message } => {
                self.emit(RelayEvent::TransportFailed { name: transport, error: message });
            }
            TransportEvent::HealthChanged { quality, healthy, .. } if !healthy => {
                if self.config.enable_aggressive_fallback && quality <= 0.2 {
                    self.force_fallback("transport reported unhealthy").await;
                }
            }
            TransportEvent::Transcription { transport, segment } => {
                let Some(ingested) = self.reconciler.ingest(RawTranscriptEvent {
                    session_id: Some(segment.session_id),
                    utterance_id: Some(segment.utterance_id),
                    text: segment.text,
                    confidence: segment.confidence,
                    start_time_ms: segment.start_time_ms,
                    end_time_ms: segment.end_time_ms,
                    is_partial: segment.is_partial,
                    is_final: segment.is_final,
                    origin_transport: segment.origin_transport,
                }) else {
                    return;
                };
                let reconciled =
                    self.reconciler.reconcile_utterance(ingested.utterance_id).unwrap_or(ingested);
                self.emit(RelayEvent::Transcription {
                    id: reconciled.id,
                    text: reconciled.text,
                    confidence: Some(reconciled.confidence),
                    source: transport,
                    session_id: reconciled.session_id,
                    utterance_id: reconciled.utterance_id,
                    is_partial: reconciled.is_partial,
                    is_final: reconciled.is_final,
                });
            }
            _ => {}
        }
    }

    pub fn get_statistics(&self) -> FallbackStatistics {
        let current = self.current_slot();
        FallbackStatistics {
            current_transport: current.map(|s| s.transport.id()),
            state: current.map(|s| s.transport.state()),
            buffer_size: self.replay_engine.buffer().stats().item_count,
            quality: current.map(|s| s.transport.quality()).unwrap_or(0.0),
            consecutive_schema_errors: self.consecutive_1007.load(Ordering::Relaxed),
            schema_variant_failures: self.schema_variant_failures.load(Ordering::Relaxed),
            transport_switches: self.transport_switches.load(Ordering::Relaxed),
        }
    }

    pub async fn destroy(&self) {
        self.monitor.record_error_cleared();
        if let Some(idx) = self.current.write().take() {
            self.slots[idx].transport.destroy().await;
        }
        self.replay_engine.buffer().clear();
        self.reconciler.end_session();
    }
}

fn enforce_buffer_cap(buffer: &AudioSegmentBuffer, cap: usize) {
    buffer.enforce_item_cap(cap);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct FakeTransport {
        id: TransportId,
        available: AtomicBool,
        initialized: AtomicBool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn id(&self) -> TransportId {
            self.id
        }

        async fn initialize(&self) -> RelayResult<()> {
            self.initialized.store(true, Ordering::Relaxed);
            Ok(())
        }

        async fn send_audio(
            &self,
            _payload: Bytes,
            _opts: SendOptions,
        ) -> RelayResult<crate::core::transport::TranscriptionResult> {
            Ok(crate::core::transport::TranscriptionResult::default())
        }

        async fn send_turn_complete(&self) -> RelayResult<()> {
            Ok(())
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::Relaxed)
        }

        fn state(&self) -> TransportState {
            if self.initialized.load(Ordering::Relaxed) { TransportState::Active } else { TransportState::Inactive }
        }

        fn quality(&self) -> f64 {
            1.0
        }

        async fn destroy(&self) {
            self.initialized.store(false, Ordering::Relaxed);
        }
    }

    fn make_manager(transports: Vec<Arc<dyn Transport>>) -> FallbackManager {
        let (manager, _sub, _monitor_rx) = FallbackManager::new(
            FallbackConfig::default(),
            transports,
            BufferConfig::default(),
            ReplayConfig::default(),
            ReconcilerConfig::default(),
            MonitorConfig::default(),
        );
        manager
    }

    #[tokio::test]
    async fn start_picks_highest_priority_available_transport() {
        let socket = Arc::new(FakeTransport {
            id: TransportId::Websocket,
            available: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
        });
        let batch = Arc::new(FakeTransport {
            id: TransportId::Batch,
            available: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
        });
        let manager = make_manager(vec![batch, socket]);

        manager.start(Some("sess-1".to_string())).await.unwrap();
        assert_eq!(manager.get_statistics().current_transport, Some(TransportId::Websocket));
    }

    #[tokio::test]
    async fn start_fails_when_no_transport_available() {
        let socket = Arc::new(FakeTransport {
            id: TransportId::Websocket,
            available: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        });
        let manager = make_manager(vec![socket]);

        let result = manager.start(None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn force_fallback_switches_to_next_available_transport() {
        let socket = Arc::new(FakeTransport {
            id: TransportId::Websocket,
            available: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
        });
        let http = Arc::new(FakeTransport {
            id: TransportId::HttpStream,
            available: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
        });
        let manager = make_manager(vec![socket, http]);

        manager.start(None).await.unwrap();
        manager.force_fallback("test").await;

        assert_eq!(manager.get_statistics().current_transport, Some(TransportId::HttpStream));
    }
}
