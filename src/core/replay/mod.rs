//! Drives ordered re-submission of buffered audio segments after a transport
//! switch or recovery, via a caller-supplied replay handler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::buffer::{AudioSegment, AudioSegmentBuffer, SegmentPriority};
use crate::core::transport::TranscriptionResult;
use crate::errors::{RelayError, RelayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Dispatch whole priority groups (Critical..Low) in fixed-size concurrent batches.
    PriorityBatching,
    /// Dispatch one segment at a time in strict priority/timestamp order.
    Sequential,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplayConfig {
    pub mode: ReplayMode,
    pub max_concurrent_replays: usize,
    pub replay_timeout: Duration,
    pub backlog_threshold: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            mode: ReplayMode::PriorityBatching,
            max_concurrent_replays: 4,
            replay_timeout: Duration::from_secs(5),
            backlog_threshold: Duration::from_secs(10),
        }
    }
}

/// Caller-supplied handler that resubmits one segment through the current transport.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    async fn replay(&self, segment: &AudioSegment) -> RelayResult<TranscriptionResult>;
}

/// Adapts a plain async closure into a [`ReplayHandler`].
pub struct FnReplayHandler<F> {
    f: F,
}

impl<F, Fut> FnReplayHandler<F>
where
    F: Fn(AudioSegment) -> Fut + Send + Sync,
    Fut: Future<Output = RelayResult<TranscriptionResult>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ReplayHandler for FnReplayHandler<F>
where
    F: Fn(AudioSegment) -> Fut + Send + Sync,
    Fut: Future<Output = RelayResult<TranscriptionResult>> + Send,
{
    async fn replay(&self, segment: &AudioSegment) -> RelayResult<TranscriptionResult> {
        (self.f)(segment.clone()).await
    }
}

#[derive(Debug, Clone)]
pub enum ReplayEvent {
    SegmentReplayed { segment: AudioSegment, result: TranscriptionResult },
    SegmentFailed { segment: AudioSegment, error: String },
    BacklogWarning { size: usize },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayStats {
    pub replayed: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
}

/// Exclusive owner of the [`AudioSegmentBuffer`]; drives replay cycles over it.
pub struct ReplayEngine {
    config: ReplayConfig,
    buffer: Arc<AudioSegmentBuffer>,
    events: mpsc::Sender<ReplayEvent>,
    replayed: AtomicU64,
    failed: AtomicU64,
    avg_latency_bits: std::sync::atomic::AtomicU64,
}

impl ReplayEngine {
    pub fn new(
        config: ReplayConfig,
        buffer: Arc<AudioSegmentBuffer>,
        events: mpsc::Sender<ReplayEvent>,
    ) -> Self {
        Self {
            config,
            buffer,
            events,
            replayed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            avg_latency_bits: std::sync::atomic::AtomicU64::new(0.0_f64.to_bits()),
        }
    }

    pub fn buffer(&self) -> &AudioSegmentBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> ReplayStats {
        ReplayStats {
            replayed: self.replayed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_latency_ms: f64::from_bits(self.avg_latency_bits.load(Ordering::Relaxed)),
        }
    }

    /// Drives one full replay pass over everything currently unprocessed.
    pub async fn run_replay_cycle(&self, handler: &dyn ReplayHandler) {
        if let Some(age) = self.buffer.oldest_unprocessed_age() {
            if age >= self.config.backlog_threshold {
                let size = self.buffer.unprocessed_by_priority(None).len();
                warn!(size, age_ms = age.as_millis() as u64, "replay backlog threshold exceeded");
                let _ = self.events.send(ReplayEvent::BacklogWarning { size }).await;
            }
        }

        match self.config.mode {
            ReplayMode::Sequential => self.run_sequential(handler).await,
            ReplayMode::PriorityBatching => self.run_priority_batches(handler).await,
        }
    }

    async fn run_sequential(&self, handler: &dyn ReplayHandler) {
        let segments = self.buffer.unprocessed_by_priority(None);
        for segment in segments {
            self.replay_one(handler, segment).await;
        }
    }

    async fn run_priority_batches(&self, handler: &dyn ReplayHandler) {
        let segments = self.buffer.unprocessed_by_priority(None);
        let groups = [
            SegmentPriority::Critical,
            SegmentPriority::High,
            SegmentPriority::Normal,
            SegmentPriority::Low,
        ];

        // Flatten in priority order, then chunk into fixed-size concurrent batches.
        // A short high-priority group borrows remaining batch capacity from the
        // next priority tier instead of leaving slots idle.
        let mut ordered: Vec<AudioSegment> = Vec::with_capacity(segments.len());
        for group in groups {
            ordered.extend(segments.iter().filter(|s| s.priority == group).cloned());
        }

        for batch in ordered.chunks(self.config.max_concurrent_replays.max(1)) {
            let futures = batch.iter().map(|segment| self.replay_one(handler, segment.clone()));
            futures::future::join_all(futures).await;
        }
    }

    async fn replay_one(&self, handler: &dyn ReplayHandler, segment: AudioSegment) {
        let started = Instant::now();
        let outcome = timeout(self.config.replay_timeout, handler.replay(&segment)).await;

        match outcome {
            Ok(Ok(result)) => {
                self.buffer.mark_processed(segment.id, true);
                self.record_latency(started.elapsed());
                self.replayed.fetch_add(1, Ordering::Relaxed);
                debug!(segment_id = %segment.id, "segment replayed successfully");
                let _ = self.events.send(ReplayEvent::SegmentReplayed { segment, result }).await;
            }
            Ok(Err(err)) => {
                self.buffer.mark_processed(segment.id, false);
                self.failed.fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .events
                    .send(ReplayEvent::SegmentFailed { segment, error: err.to_string() })
                    .await;
            }
            Err(_) => {
                self.buffer.mark_processed(segment.id, false);
                self.failed.fetch_add(1, Ordering::Relaxed);
                let error = RelayError::Transport("replay timed out".to_string()).to_string();
                let _ = self.events.send(ReplayEvent::SegmentFailed { segment, error }).await;
            }
        }
    }

    fn record_latency(&self, sample: Duration) {
        let sample_ms = sample.as_millis() as f64;
        loop {
            let current_bits = self.avg_latency_bits.load(Ordering::Relaxed);
            let current = f64::from_bits(current_bits);
            let next = if current == 0.0 { sample_ms } else { current * 0.9 + sample_ms * 0.1 };
            if self
                .avg_latency_bits
                .compare_exchange_weak(
                    current_bits,
                    next.to_bits(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }
}

pub type BoxReplayFuture = Pin<Box<dyn Future<Output = RelayResult<TranscriptionResult>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::BufferConfig;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    struct AlwaysOk;
    #[async_trait]
    impl ReplayHandler for AlwaysOk {
        async fn replay(&self, _segment: &AudioSegment) -> RelayResult<TranscriptionResult> {
            Ok(TranscriptionResult::default())
        }
    }

    struct AlwaysFail;
    #[async_trait]
    impl ReplayHandler for AlwaysFail {
        async fn replay(&self, _segment: &AudioSegment) -> RelayResult<TranscriptionResult> {
            Err(RelayError::Transport("nope".into()))
        }
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl ReplayHandler for CountingHandler {
        async fn replay(&self, _segment: &AudioSegment) -> RelayResult<TranscriptionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TranscriptionResult::default())
        }
    }

    fn seg(priority: SegmentPriority) -> AudioSegment {
        AudioSegment::new(Bytes::from(vec![0u8; 4]), Duration::from_millis(200), priority)
    }

    #[tokio::test]
    async fn successful_replay_marks_processed_and_emits_event() {
        let buffer = Arc::new(AudioSegmentBuffer::new(BufferConfig::default()));
        let inserted = buffer.append(seg(SegmentPriority::Normal));
        let (tx, mut rx) = mpsc::channel(8);
        let engine = ReplayEngine::new(ReplayConfig::default(), buffer.clone(), tx);

        engine.run_replay_cycle(&AlwaysOk).await;

        assert!(buffer.get(inserted.id).unwrap().is_processed);
        assert!(matches!(rx.recv().await, Some(ReplayEvent::SegmentReplayed { .. })));
    }

    #[tokio::test]
    async fn failed_replay_stays_unprocessed_and_emits_failure() {
        let buffer = Arc::new(AudioSegmentBuffer::new(BufferConfig::default()));
        let inserted = buffer.append(seg(SegmentPriority::Low));
        let (tx, mut rx) = mpsc::channel(8);
        let engine = ReplayEngine::new(ReplayConfig::default(), buffer.clone(), tx);

        engine.run_replay_cycle(&AlwaysFail).await;

        assert!(!buffer.get(inserted.id).unwrap().is_processed);
        assert_eq!(buffer.get(inserted.id).unwrap().retry_count, 1);
        assert!(matches!(rx.recv().await, Some(ReplayEvent::SegmentFailed { .. })));
    }

    #[tokio::test]
    async fn processed_segments_are_never_replayed_again() {
        let buffer = Arc::new(AudioSegmentBuffer::new(BufferConfig::default()));
        buffer.append(seg(SegmentPriority::Critical));
        let (tx, _rx) = mpsc::channel(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = ReplayEngine::new(ReplayConfig::default(), buffer.clone(), tx);

        engine.run_replay_cycle(&CountingHandler { calls: calls.clone() }).await;
        engine.run_replay_cycle(&CountingHandler { calls: calls.clone() }).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
