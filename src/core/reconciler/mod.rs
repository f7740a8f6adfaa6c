//! Merges transcript fragments produced by one or more transports into a single,
//! continuous, per-utterance ordered stream.
//!
//! Session and utterance identity persist across transport switches; the
//! [`FallbackManager`](crate::core::fallback::FallbackManager) stamps the
//! reconciler with switch boundaries so downstream consumers can correlate
//! gaps in the transcript with the transport change that caused them.

mod session;
mod strategy;

pub use session::SessionContext;
pub use strategy::ConflictResolutionStrategy;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::transport::TransportId;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub max_segment_buffer: usize,
    pub merge_overlap_threshold: Duration,
    pub max_timestamp_drift: Duration,
    pub strategy: ConflictResolutionStrategy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_segment_buffer: 200,
            merge_overlap_threshold: Duration::from_millis(500),
            max_timestamp_drift: Duration::from_millis(2000),
            strategy: ConflictResolutionStrategy::Confidence,
        }
    }
}

/// A raw transcript fragment as reported by a transport, prior to reconciliation.
#[derive(Debug, Clone)]
pub struct RawTranscriptEvent {
    pub session_id: Option<String>,
    pub utterance_id: Option<Uuid>,
    pub text: String,
    pub confidence: f64,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub is_partial: bool,
    pub is_final: bool,
    pub origin_transport: TransportId,
}

/// One reconciled transcript segment, ready for delivery to consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub id: Uuid,
    pub session_id: String,
    pub utterance_id: Uuid,
    pub sequence_number: u64,
    pub text: String,
    pub confidence: f64,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    #[serde(skip, default = "Instant::now")]
    pub timestamp: Instant,
    pub is_partial: bool,
    pub is_final: bool,
    pub origin_transport: TransportId,
    pub merge_history: Vec<Uuid>,
    pub transport_switch_point: bool,
}

impl TranscriptSegment {
    fn overlaps(&self, other: &TranscriptSegment, threshold: Duration) -> bool {
        let threshold_ms = threshold.as_millis() as i64;
        let a = (self.start_time_ms as i64, self.end_time_ms as i64);
        let b = (other.start_time_ms as i64, other.end_time_ms as i64);
        let overlap = a.1.min(b.1) - a.0.max(b.0);
        overlap > -threshold_ms
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReconciliationResult {
    pub segments: Vec<TranscriptSegment>,
    pub conflicts_resolved: u64,
    pub segments_merged: u64,
    pub continuity_maintained: bool,
    pub errors: Vec<String>,
}

struct Inner {
    context: Option<SessionContext>,
    buffer: VecDeque<TranscriptSegment>,
    last_switch_at: Option<Instant>,
}

/// Owns the single active [`SessionContext`] and the per-session reconciliation
/// window. One instance per [`FallbackManager`](crate::core::fallback::FallbackManager).
pub struct TranscriptReconciler {
    config: ReconcilerConfig,
    inner: Mutex<Inner>,
}

impl TranscriptReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner { context: None, buffer: VecDeque::new(), last_switch_at: None }),
        }
    }

    /// Starts (or restarts) a session, resetting utterance and sequence state.
    pub fn start_session(&self, session_id: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.context = Some(SessionContext::new(session_id.into()));
        inner.buffer.clear();
        inner.last_switch_at = None;
    }

    pub fn end_session(&self) {
        let mut inner = self.inner.lock();
        inner.context = None;
        inner.buffer.clear();
    }

    /// Starts a new utterance within the current session, preserving session identity.
    pub fn roll_over_utterance(&self) -> Option<Uuid> {
        let mut inner = self.inner.lock();
        let ctx = inner.context.as_mut()?;
        Some(ctx.roll_over_utterance())
    }

    /// Assigns session/utterance/sequence identity to a raw event and buffers it.
    /// Returns the buffered segment (not yet reconciled).
    pub fn ingest(&self, event: RawTranscriptEvent) -> Option<TranscriptSegment> {
        let mut inner = self.inner.lock();
        let ctx = inner.context.as_mut()?;

        let session_id = event.session_id.clone().unwrap_or_else(|| ctx.session_id.clone());
        let utterance_id = event.utterance_id.unwrap_or(ctx.current_utterance_id);
        let sequence_number = ctx.next_sequence();

        let segment = TranscriptSegment {
            id: Uuid::new_v4(),
            session_id,
            utterance_id,
            sequence_number,
            text: event.text,
            confidence: event.confidence,
            start_time_ms: event.start_time_ms,
            end_time_ms: event.end_time_ms,
            timestamp: Instant::now(),
            is_partial: event.is_partial,
            is_final: event.is_final,
            origin_transport: event.origin_transport,
            merge_history: Vec::new(),
            transport_switch_point: false,
        };

        if inner.buffer.len() >= self.config.max_segment_buffer {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(segment.clone());
        Some(segment)
    }

    /// Stamps segments buffered within the last two seconds before `switch_at`
    /// (or now, if unset) as overlapping a transport transition.
    pub fn mark_transport_switch(&self, switch_at: Instant) {
        let mut inner = self.inner.lock();
        inner.last_switch_at = Some(switch_at);
        let window = Duration::from_secs(2);
        for segment in inner.buffer.iter_mut() {
            if switch_at.saturating_duration_since(segment.timestamp) <= window {
                segment.transport_switch_point = true;
            }
        }
    }

    /// Resolves overlaps within a single utterance's buffered segments and
    /// returns the most recent consolidated one, for delivering a live,
    /// already-reconciled update right after an [`ingest`](Self::ingest)
    /// rather than waiting on a full [`reconcile`](Self::reconcile) pass.
    pub fn reconcile_utterance(&self, utterance_id: Uuid) -> Option<TranscriptSegment> {
        let inner = self.inner.lock();
        let mut group: Vec<TranscriptSegment> =
            inner.buffer.iter().filter(|s| s.utterance_id == utterance_id).cloned().collect();
        drop(inner);

        if group.is_empty() {
            return None;
        }
        group.sort_by(|a, b| a.start_time_ms.cmp(&b.start_time_ms).then(a.sequence_number.cmp(&b.sequence_number)));

        let mut scratch = ReconciliationResult::default();
        let resolved = resolve_overlaps(group, self.config.merge_overlap_threshold, self.config.strategy, &mut scratch);
        resolved.into_iter().max_by_key(|s| s.start_time_ms)
    }

    /// Groups the buffered segments by utterance, resolves overlaps per the
    /// configured strategy, and checks inter-segment continuity.
    pub fn reconcile(&self) -> ReconciliationResult {
        let inner = self.inner.lock();
        let mut result = ReconciliationResult { continuity_maintained: true, ..Default::default() };

        let mut by_utterance: std::collections::HashMap<Uuid, Vec<TranscriptSegment>> =
            std::collections::HashMap::new();
        for seg in inner.buffer.iter() {
            by_utterance.entry(seg.utterance_id).or_default().push(seg.clone());
        }
        drop(inner);

        let mut emitted = Vec::new();
        for (_, mut group) in by_utterance {
            group.sort_by(|a, b| {
                a.start_time_ms.cmp(&b.start_time_ms).then(a.sequence_number.cmp(&b.sequence_number))
            });

            let resolved = resolve_overlaps(
                group,
                self.config.merge_overlap_threshold,
                self.config.strategy,
                &mut result,
            );
            emitted.extend(resolved);
        }

        emitted.sort_by(|a, b| a.start_time_ms.cmp(&b.start_time_ms).then(a.sequence_number.cmp(&b.sequence_number)));

        for window in emitted.windows(2) {
            let gap = window[1].start_time_ms as i64 - window[0].end_time_ms as i64;
            if gap.unsigned_abs() as u64 > self.config.max_timestamp_drift.as_millis() as u64 {
                result.continuity_maintained = false;
                result.errors.push(format!(
                    "continuity broken between segments {} and {}: gap {}ms",
                    window[0].id, window[1].id, gap
                ));
                warn!(gap_ms = gap, "reconciler detected broken continuity");
            }
        }

        result.segments = emitted;
        debug!(
            segments = result.segments.len(),
            conflicts = result.conflicts_resolved,
            merged = result.segments_merged,
            "reconciliation pass complete"
        );
        result
    }
}

fn resolve_overlaps(
    mut group: Vec<TranscriptSegment>,
    threshold: Duration,
    strategy: ConflictResolutionStrategy,
    result: &mut ReconciliationResult,
) -> Vec<TranscriptSegment> {
    let mut resolved: Vec<TranscriptSegment> = Vec::new();

    while let Some(mut candidate) = group.pop() {
        let mut cluster = vec![candidate.clone()];
        group.retain(|other| {
            if candidate.overlaps(other, threshold) {
                cluster.push(other.clone());
                false
            } else {
                true
            }
        });

        if cluster.len() > 1 {
            result.conflicts_resolved += 1;
            candidate = strategy.resolve(cluster);
            result.segments_merged += (candidate.merge_history.len()) as u64;
        }

        resolved.push(candidate);
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(utterance: Uuid, start_ms: u64, confidence: f64, text: &str) -> RawTranscriptEvent {
        RawTranscriptEvent {
            session_id: None,
            utterance_id: Some(utterance),
            text: text.to_string(),
            confidence,
            start_time_ms: start_ms,
            end_time_ms: start_ms + 400,
            is_partial: false,
            is_final: true,
            origin_transport: TransportId::Websocket,
        }
    }

    #[test]
    fn confidence_strategy_keeps_highest_confidence_and_records_history() {
        let reconciler = TranscriptReconciler::new(ReconcilerConfig::default());
        reconciler.start_session("sess-1");
        let utterance = reconciler.roll_over_utterance().unwrap();

        let low = reconciler.ingest(event(utterance, 0, 0.6, "hello wrld")).unwrap();
        reconciler.ingest(event(utterance, 200, 0.9, "hello world")).unwrap();

        let result = reconciler.reconcile();
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].text, "hello world");
        assert_eq!(result.segments[0].merge_history, vec![low.id]);
        assert_eq!(result.conflicts_resolved, 1);
    }

    #[test]
    fn non_overlapping_segments_both_emitted() {
        let reconciler = TranscriptReconciler::new(ReconcilerConfig::default());
        reconciler.start_session("sess-1");
        let utterance = reconciler.roll_over_utterance().unwrap();

        reconciler.ingest(event(utterance, 0, 0.9, "first")).unwrap();
        reconciler.ingest(event(utterance, 5000, 0.9, "second")).unwrap();

        let result = reconciler.reconcile();
        assert_eq!(result.segments.len(), 2);
        assert_eq!(result.conflicts_resolved, 0);
    }

    #[test]
    fn reconcile_utterance_returns_only_the_latest_cluster_for_that_utterance() {
        let reconciler = TranscriptReconciler::new(ReconcilerConfig::default());
        reconciler.start_session("sess-1");
        let utterance = reconciler.roll_over_utterance().unwrap();
        let other_utterance = reconciler.roll_over_utterance().unwrap();

        reconciler.ingest(event(other_utterance, 0, 0.9, "unrelated")).unwrap();
        reconciler.ingest(event(utterance, 0, 0.6, "hello wrld")).unwrap();
        reconciler.ingest(event(utterance, 200, 0.9, "hello world")).unwrap();

        let resolved = reconciler.reconcile_utterance(utterance).unwrap();
        assert_eq!(resolved.text, "hello world");
        assert_eq!(resolved.utterance_id, utterance);
    }

    #[test]
    fn transport_switch_stamps_recent_segments() {
        let reconciler = TranscriptReconciler::new(ReconcilerConfig::default());
        reconciler.start_session("sess-1");
        let utterance = reconciler.roll_over_utterance().unwrap();
        reconciler.ingest(event(utterance, 0, 0.9, "before switch")).unwrap();

        reconciler.mark_transport_switch(Instant::now());
        let result = reconciler.reconcile();
        assert!(result.segments[0].transport_switch_point);
    }
}
