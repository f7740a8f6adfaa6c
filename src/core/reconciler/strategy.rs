use super::TranscriptSegment;

/// How overlapping transcript segments for the same utterance are collapsed
/// into one. Configured via `reconciler.conflict_resolution_strategy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolutionStrategy {
    /// Keep the highest-confidence segment; record the rest in `merge_history`.
    Confidence,
    /// Keep the earliest segment.
    Timestamp,
    /// Prefer socket over http-stream over batch.
    Transport,
    /// Combine texts (longest of the distinct variants), max confidence, earliest timestamp.
    Merge,
}

impl ConflictResolutionStrategy {
    /// Collapses an overlapping cluster (len > 1) into one winning segment,
    /// recording the losers' ids in `merge_history`.
    pub fn resolve(&self, mut cluster: Vec<TranscriptSegment>) -> TranscriptSegment {
        debug_assert!(!cluster.is_empty());
        match self {
            ConflictResolutionStrategy::Confidence => {
                cluster.sort_by(|a, b| {
                    b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal)
                });
                let mut winner = cluster.remove(0);
                winner.merge_history.extend(cluster.into_iter().map(|s| s.id));
                winner
            }
            ConflictResolutionStrategy::Timestamp => {
                cluster.sort_by_key(|s| s.start_time_ms);
                let mut winner = cluster.remove(0);
                winner.merge_history.extend(cluster.into_iter().map(|s| s.id));
                winner
            }
            ConflictResolutionStrategy::Transport => {
                cluster.sort_by_key(|s| s.origin_transport.priority());
                let mut winner = cluster.remove(0);
                winner.merge_history.extend(cluster.into_iter().map(|s| s.id));
                winner
            }
            ConflictResolutionStrategy::Merge => {
                let earliest = cluster.iter().map(|s| s.start_time_ms).min().unwrap_or(0);
                let latest_end = cluster.iter().map(|s| s.end_time_ms).max().unwrap_or(0);
                let max_confidence =
                    cluster.iter().map(|s| s.confidence).fold(0.0_f64, f64::max);
                let longest_text = cluster
                    .iter()
                    .map(|s| s.text.clone())
                    .max_by_key(|t| t.len())
                    .unwrap_or_default();

                cluster.sort_by_key(|s| s.start_time_ms);
                let mut winner = cluster.remove(0);
                let losers: Vec<_> = cluster.into_iter().map(|s| s.id).collect();
                winner.merge_history.extend(losers);
                winner.text = longest_text;
                winner.confidence = max_confidence;
                winner.start_time_ms = earliest;
                winner.end_time_ms = latest_end;
                winner
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::TransportId;
    use std::time::Instant;
    use uuid::Uuid;

    fn seg(text: &str, confidence: f64, transport: TransportId, start_ms: u64) -> TranscriptSegment {
        TranscriptSegment {
            id: Uuid::new_v4(),
            session_id: "s".into(),
            utterance_id: Uuid::new_v4(),
            sequence_number: 0,
            text: text.to_string(),
            confidence,
            start_time_ms: start_ms,
            end_time_ms: start_ms + 300,
            timestamp: Instant::now(),
            is_partial: false,
            is_final: true,
            origin_transport: transport,
            merge_history: Vec::new(),
            transport_switch_point: false,
        }
    }

    #[test]
    fn transport_strategy_prefers_socket_over_batch() {
        let cluster = vec![
            seg("from batch", 0.5, TransportId::Batch, 0),
            seg("from socket", 0.4, TransportId::Websocket, 0),
        ];
        let winner = ConflictResolutionStrategy::Transport.resolve(cluster);
        assert_eq!(winner.text, "from socket");
        assert_eq!(winner.merge_history.len(), 1);
    }

    #[test]
    fn merge_strategy_picks_longest_text_and_widest_span() {
        let cluster = vec![
            seg("short", 0.5, TransportId::Websocket, 100),
            seg("a much longer transcript", 0.4, TransportId::Websocket, 0),
        ];
        let winner = ConflictResolutionStrategy::Merge.resolve(cluster);
        assert_eq!(winner.text, "a much longer transcript");
        assert_eq!(winner.confidence, 0.5);
        assert_eq!(winner.start_time_ms, 0);
    }
}
