use chrono::{DateTime, Utc};

use super::message::{temp_id_pair, Message, Role};

/// The user message and in-progress assistant reply shown before the
/// backend confirms either of them.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticPair {
    pub user: Message,
    pub assistant: Message,
}

/// Holds zero or one optimistic pair for a session.
///
/// Chunks are applied by delivery sequence number so replaying the same
/// delivery is a no-op while a genuine redelivery still appends.
#[derive(Debug, Default)]
pub struct OptimisticOverlay {
    pair: Option<OptimisticPair>,
    last_applied_seq: u64,
}

impl OptimisticOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new pair, discarding any previous one.
    pub fn begin_send(&mut self, conversation_id: &str, content: &str) -> &OptimisticPair {
        self.begin_send_at(conversation_id, content, Utc::now())
    }

    pub fn begin_send_at(
        &mut self,
        conversation_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> &OptimisticPair {
        let (user_id, assistant_id) = temp_id_pair(now);
        self.last_applied_seq = 0;
        self.pair.insert(OptimisticPair {
            user: Message::new(user_id, conversation_id, Role::User, content, now),
            assistant: Message::new(assistant_id, conversation_id, Role::Assistant, "", now),
        })
    }

    /// Append `text` for delivery `seq`. Returns whether anything changed.
    pub fn apply_chunk(&mut self, seq: u64, text: &str) -> bool {
        let Some(pair) = self.pair.as_mut() else {
            return false;
        };
        if seq <= self.last_applied_seq {
            return false;
        }
        self.last_applied_seq = seq;
        pair.assistant.content.push_str(text);
        true
    }

    pub fn clear(&mut self) {
        self.pair = None;
        self.last_applied_seq = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.pair.is_none()
    }

    /// Pending messages in display order; empty or exactly two entries.
    pub fn messages(&self) -> Vec<Message> {
        self.pair
            .as_ref()
            .map(|pair| vec![pair.user.clone(), pair.assistant.clone()])
            .unwrap_or_default()
    }
}
