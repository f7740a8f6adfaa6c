//! Bounded, priority-ordered buffer of audio segments awaiting transport
//! acknowledgement. Survives transport switches so the [`crate::core::replay::ReplayEngine`]
//! can resubmit whatever the old transport never confirmed.

mod segment;

pub use segment::{AudioSegment, AudioSegmentMetadata, SegmentPriority};

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    pub max_segments: usize,
    pub max_memory_bytes: usize,
    pub max_age_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { max_segments: 500, max_memory_bytes: 32 * 1024 * 1024, max_age_ms: 60_000 }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BufferStats {
    pub item_count: usize,
    pub memory_bytes: usize,
    pub overflow_evictions: u64,
    pub retention_evictions: u64,
}

struct Inner {
    segments: VecDeque<AudioSegment>,
    memory_bytes: usize,
    next_sequence_id: u64,
    overflow_evictions: u64,
    retention_evictions: u64,
}

/// Single-writer buffer: all mutation goes through the owning [`crate::core::replay::ReplayEngine`].
pub struct AudioSegmentBuffer {
    config: BufferConfig,
    inner: Mutex<Inner>,
}

impl AudioSegmentBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                segments: VecDeque::new(),
                memory_bytes: 0,
                next_sequence_id: 0,
                overflow_evictions: 0,
                retention_evictions: 0,
            }),
        }
    }

    /// Appends a segment, assigning its `sequence_id`, evicting as needed to
    /// respect the configured caps *before* the new segment is stored.
    pub fn append(&self, mut segment: AudioSegment) -> AudioSegment {
        let mut inner = self.inner.lock();
        inner.next_sequence_id += 1;
        segment.sequence_id = inner.next_sequence_id;

        if inner.segments.len() + 1 > self.config.max_segments {
            evict_oldest(&mut inner);
        }

        let incoming_len = segment.payload.len();
        if inner.memory_bytes + incoming_len > self.config.max_memory_bytes {
            evict_for_memory(&mut inner, self.config.max_memory_bytes, incoming_len);
        }

        inner.memory_bytes += incoming_len;
        inner.segments.push_back(segment.clone());
        segment
    }

    pub fn get(&self, id: Uuid) -> Option<AudioSegment> {
        self.inner.lock().segments.iter().find(|s| s.id == id).cloned()
    }

    /// Marks a segment processed (or failed, incrementing its retry count).
    pub fn mark_processed(&self, id: Uuid, success: bool) {
        let mut inner = self.inner.lock();
        if let Some(seg) = inner.segments.iter_mut().find(|s| s.id == id) {
            if success {
                seg.is_processed = true;
            } else {
                seg.retry_count += 1;
            }
        }
    }

    /// Snapshot of unprocessed segments in replay order: priority descending,
    /// then oldest first. `limit` caps how many are returned.
    pub fn unprocessed_by_priority(&self, limit: Option<usize>) -> Vec<AudioSegment> {
        let inner = self.inner.lock();
        let mut unprocessed: Vec<AudioSegment> =
            inner.segments.iter().filter(|s| !s.is_processed).cloned().collect();
        unprocessed.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at))
        });
        if let Some(limit) = limit {
            unprocessed.truncate(limit);
        }
        unprocessed
    }

    pub fn oldest_unprocessed_age(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .segments
            .iter()
            .filter(|s| !s.is_processed)
            .map(|s| s.created_at.elapsed())
            .max()
    }

    /// Periodic retention pass: drops segments older than a priority-dependent
    /// maximum age. Processed segments age out twice as fast as unprocessed ones.
    pub fn run_retention(&self) -> usize {
        let mut inner = self.inner.lock();
        let base_max_age = Duration::from_millis(self.config.max_age_ms);
        let before = inner.segments.len();

        inner.segments.retain(|seg| {
            let max_age = if seg.is_processed {
                base_max_age / 2
            } else {
                match seg.priority {
                    SegmentPriority::Critical => base_max_age * 2,
                    SegmentPriority::High => base_max_age + base_max_age / 2,
                    SegmentPriority::Normal => base_max_age,
                    SegmentPriority::Low => base_max_age / 2,
                }
            };
            seg.created_at.elapsed() < max_age
        });

        let removed = before - inner.segments.len();
        inner.retention_evictions += removed as u64;
        inner.memory_bytes = inner.segments.iter().map(|s| s.payload.len()).sum();
        if removed > 0 {
            debug!(removed, "buffer retention pass evicted aged segments");
        }
        removed
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            item_count: inner.segments.len(),
            memory_bytes: inner.memory_bytes,
            overflow_evictions: inner.overflow_evictions,
            retention_evictions: inner.retention_evictions,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.segments.clear();
        inner.memory_bytes = 0;
    }

    /// Drains the buffer oldest-first down to `cap` items, independent of the
    /// configured `max_segments`/retention caps. Used by callers that enforce
    /// their own smaller, deterministic item cap (e.g. the fallback manager's
    /// replay-buffer cap).
    pub fn enforce_item_cap(&self, cap: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut evicted = 0;
        while inner.segments.len() > cap {
            evict_oldest(&mut inner);
            evicted += 1;
        }
        evicted
    }

    /// Removes every segment matching `predicate`. Triggers the same
    /// compaction a retention pass does once more than 10% of the buffer is
    /// removed in one call.
    pub fn remove_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&AudioSegment) -> bool,
    {
        let mut inner = self.inner.lock();
        let before = inner.segments.len();
        inner.segments.retain(|seg| !predicate(seg));
        let removed = before - inner.segments.len();

        if removed > 0 {
            inner.memory_bytes = inner.segments.iter().map(|s| s.payload.len()).sum();
            if before > 0 && removed * 10 > before {
                debug!(removed, before, "remove_where triggered compaction");
                inner.segments.shrink_to_fit();
            }
        }
        removed
    }
}

fn evict_oldest(inner: &mut Inner) {
    if let Some(pos) = inner
        .segments
        .iter()
        .enumerate()
        .min_by_key(|(_, s)| s.created_at)
        .map(|(i, _)| i)
    {
        if let Some(removed) = inner.segments.remove(pos) {
            inner.memory_bytes = inner.memory_bytes.saturating_sub(removed.payload.len());
            inner.overflow_evictions += 1;
        }
    }
}

fn evict_for_memory(inner: &mut Inner, cap: usize, incoming_len: usize) {
    let target = (cap as f64 * 0.8) as usize;
    while inner.memory_bytes + incoming_len > target && !inner.segments.is_empty() {
        if let Some(pos) = inner
            .segments
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at))
            })
            .map(|(i, _)| i)
        {
            if let Some(removed) = inner.segments.remove(pos) {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(removed.payload.len());
                inner.overflow_evictions += 1;
            }
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn segment(priority: SegmentPriority, bytes: usize) -> AudioSegment {
        AudioSegment::new(Bytes::from(vec![0u8; bytes]), Duration::from_millis(500), priority)
    }

    #[test]
    fn sequence_ids_increase_in_insertion_order() {
        let buffer = AudioSegmentBuffer::new(BufferConfig::default());
        let s1 = buffer.append(segment(SegmentPriority::Normal, 10));
        let s2 = buffer.append(segment(SegmentPriority::Normal, 10));
        assert!(s2.sequence_id > s1.sequence_id);
    }

    #[test]
    fn count_overflow_evicts_oldest() {
        let config = BufferConfig { max_segments: 3, max_memory_bytes: 1_000_000, max_age_ms: 60_000 };
        let buffer = AudioSegmentBuffer::new(config);
        buffer.append(segment(SegmentPriority::Low, 10));
        buffer.append(segment(SegmentPriority::High, 10));
        buffer.append(segment(SegmentPriority::Critical, 10));
        buffer.append(segment(SegmentPriority::Normal, 10));

        let stats = buffer.stats();
        assert_eq!(stats.item_count, 3);
        assert_eq!(stats.overflow_evictions, 1);

        let remaining = buffer.unprocessed_by_priority(None);
        let priorities: Vec<_> = remaining.iter().map(|s| s.priority).collect();
        assert!(!priorities.contains(&SegmentPriority::Low));
    }

    #[test]
    fn memory_overflow_evicts_lowest_priority_then_oldest() {
        let config = BufferConfig { max_segments: 100, max_memory_bytes: 100, max_age_ms: 60_000 };
        let buffer = AudioSegmentBuffer::new(config);
        buffer.append(segment(SegmentPriority::Low, 40));
        buffer.append(segment(SegmentPriority::Critical, 40));
        buffer.append(segment(SegmentPriority::Normal, 40));

        let stats = buffer.stats();
        assert!(stats.memory_bytes <= 100);
        let remaining = buffer.unprocessed_by_priority(None);
        assert!(remaining.iter().any(|s| s.priority == SegmentPriority::Critical));
    }

    #[test]
    fn processed_segments_are_excluded_from_replay() {
        let buffer = AudioSegmentBuffer::new(BufferConfig::default());
        let seg = buffer.append(segment(SegmentPriority::Normal, 10));
        buffer.mark_processed(seg.id, true);
        assert!(buffer.unprocessed_by_priority(None).is_empty());
    }

    #[test]
    fn remove_where_drops_matching_segments_and_updates_memory() {
        let buffer = AudioSegmentBuffer::new(BufferConfig::default());
        let low = buffer.append(segment(SegmentPriority::Low, 10));
        buffer.append(segment(SegmentPriority::Critical, 10));

        let removed = buffer.remove_where(|s| s.id == low.id);
        assert_eq!(removed, 1);
        assert_eq!(buffer.stats().item_count, 1);
        assert!(buffer.get(low.id).is_none());
    }
}
