use uuid::Uuid;

/// Identity that persists across transport switches: one active session at a
/// time, owned exclusively by the [`super::TranscriptReconciler`].
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub current_utterance_id: Uuid,
    sequence_counter: u64,
}

impl SessionContext {
    pub fn new(session_id: String) -> Self {
        Self { session_id, current_utterance_id: Uuid::new_v4(), sequence_counter: 0 }
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence_counter += 1;
        self.sequence_counter
    }

    /// Starts a new utterance, returning its id. Session identity is unaffected.
    pub fn roll_over_utterance(&mut self) -> Uuid {
        self.current_utterance_id = Uuid::new_v4();
        self.current_utterance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase_monotonically() {
        let mut ctx = SessionContext::new("s1".to_string());
        assert_eq!(ctx.next_sequence(), 1);
        assert_eq!(ctx.next_sequence(), 2);
    }

    #[test]
    fn rollover_changes_utterance_not_session() {
        let mut ctx = SessionContext::new("s1".to_string());
        let first = ctx.current_utterance_id;
        let second = ctx.roll_over_utterance();
        assert_ne!(first, second);
        assert_eq!(ctx.session_id, "s1");
    }
}
