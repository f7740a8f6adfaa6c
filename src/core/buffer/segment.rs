use std::time::{Duration, Instant};

use bytes::Bytes;
use uuid::Uuid;

use crate::core::transport::TransportId;

/// Replay priority, highest first. Derived at construction time from
/// voice-activity and duration hints — see [`AudioSegment::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SegmentPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Default)]
pub struct AudioSegmentMetadata {
    pub session_id: Option<String>,
    pub chunk_index: Option<u64>,
    pub has_voice_activity: bool,
    pub origin_transport: Option<TransportId>,
    pub fallback_reason: Option<String>,
}

/// One chunk of audio awaiting transport acknowledgement.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    pub id: Uuid,
    pub sequence_id: u64,
    pub created_at: Instant,
    pub duration: Duration,
    pub payload: Bytes,
    pub priority: SegmentPriority,
    pub is_processed: bool,
    pub retry_count: u32,
    pub metadata: AudioSegmentMetadata,
}

impl AudioSegment {
    /// `sequence_id` is assigned by the owning buffer at insertion time, so it
    /// starts at zero here.
    pub fn new(payload: Bytes, duration: Duration, priority: SegmentPriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_id: 0,
            created_at: Instant::now(),
            duration,
            payload,
            priority,
            is_processed: false,
            retry_count: 0,
            metadata: AudioSegmentMetadata::default(),
        }
    }

    /// Derives priority from voice-activity and duration, per the ingest rule:
    /// Critical if voice and short (<2s), High if voice, Normal if long (>1s),
    /// Low otherwise.
    pub fn derive_priority(has_voice_activity: bool, duration: Duration) -> SegmentPriority {
        if has_voice_activity && duration < Duration::from_millis(2000) {
            SegmentPriority::Critical
        } else if has_voice_activity {
            SegmentPriority::High
        } else if duration > Duration::from_millis(1000) {
            SegmentPriority::Normal
        } else {
            SegmentPriority::Low
        }
    }

    pub fn with_metadata(mut self, metadata: AudioSegmentMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_derivation_matches_rule_table() {
        assert_eq!(
            AudioSegment::derive_priority(true, Duration::from_millis(500)),
            SegmentPriority::Critical
        );
        assert_eq!(
            AudioSegment::derive_priority(true, Duration::from_millis(3000)),
            SegmentPriority::High
        );
        assert_eq!(
            AudioSegment::derive_priority(false, Duration::from_millis(1500)),
            SegmentPriority::Normal
        );
        assert_eq!(
            AudioSegment::derive_priority(false, Duration::from_millis(200)),
            SegmentPriority::Low
        );
    }

    #[test]
    fn priority_ordering_is_critical_highest() {
        assert!(SegmentPriority::Critical > SegmentPriority::High);
        assert!(SegmentPriority::High > SegmentPriority::Normal);
        assert!(SegmentPriority::Normal > SegmentPriority::Low);
    }
}
