//! Room chat: a bounded history of recent lines.
//!
//! Chat rides alongside the table but outside it. Lines get their own
//! sequence, never move the room version, and are not persisted; a room
//! rehydrated from storage starts with an empty history.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use tavern_protocol::{ChatEntry, ChatKind, UserId};

/// Longest accepted chat line, in characters, after trimming.
pub const MAX_CHAT_LEN: usize = 1000;

/// Why a chat line was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatRejection {
    #[error("message is empty")]
    Empty,

    #[error("message is {0} characters, the limit is {MAX_CHAT_LEN}")]
    TooLong(usize),
}

/// The most recent chat lines of one room, oldest first.
#[derive(Debug, Clone)]
pub struct ChatLog {
    entries: VecDeque<ChatEntry>,
    capacity: usize,
    next_seq: u64,
}

impl ChatLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_seq: 1,
        }
    }

    /// Records a member's line. Surrounding whitespace is trimmed.
    ///
    /// # Errors
    /// [`ChatRejection`] if the trimmed text is empty or too long. The log
    /// is untouched.
    pub fn post(&mut self, user_id: UserId, text: &str) -> Result<ChatEntry, ChatRejection> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatRejection::Empty);
        }
        let len = text.chars().count();
        if len > MAX_CHAT_LEN {
            return Err(ChatRejection::TooLong(len));
        }
        Ok(self.push(ChatKind::Text, Some(user_id), text.to_owned()))
    }

    /// Records a system notice such as a join or leave.
    pub fn notice(&mut self, text: impl Into<String>) -> ChatEntry {
        self.push(ChatKind::System, None, text.into())
    }

    /// Up to `limit` of the newest lines, oldest first. `None` returns the
    /// whole history.
    pub fn recent(&self, limit: Option<usize>) -> Vec<ChatEntry> {
        let skip = limit.map_or(0, |n| self.entries.len().saturating_sub(n));
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, kind: ChatKind, user_id: Option<UserId>, text: String) -> ChatEntry {
        let entry = ChatEntry {
            seq: self.next_seq,
            kind,
            user_id,
            text,
            sent_at: now_millis(),
        };
        self.next_seq += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());
        entry
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserId {
        UserId::new(name)
    }

    #[test]
    fn test_post_trims_and_numbers_lines() {
        let mut log = ChatLog::new(8);
        let first = log.post(user("u"), "  hello  ").unwrap();
        let second = log.post(user("v"), "hi").unwrap();

        assert_eq!(first.text, "hello");
        assert_eq!(first.kind, ChatKind::Text);
        assert_eq!(first.user_id, Some(user("u")));
        assert_eq!((first.seq, second.seq), (1, 2));
        assert!(first.sent_at > 0);
    }

    #[test]
    fn test_post_rejects_blank_and_overlong() {
        let mut log = ChatLog::new(8);
        assert_eq!(log.post(user("u"), " \n\t"), Err(ChatRejection::Empty));
        assert_eq!(
            log.post(user("u"), &"x".repeat(MAX_CHAT_LEN + 1)),
            Err(ChatRejection::TooLong(MAX_CHAT_LEN + 1))
        );
        assert!(log.is_empty());
    }

    #[test]
    fn test_length_limit_counts_characters_not_bytes() {
        let mut log = ChatLog::new(8);
        assert!(log.post(user("u"), &"é".repeat(MAX_CHAT_LEN)).is_ok());
    }

    #[test]
    fn test_history_is_bounded_and_keeps_newest() {
        let mut log = ChatLog::new(3);
        for i in 0..5 {
            log.post(user("u"), &format!("line {i}")).unwrap();
        }
        let seqs: Vec<u64> = log.recent(None).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        let newest: Vec<u64> = log.recent(Some(2)).iter().map(|e| e.seq).collect();
        assert_eq!(newest, vec![4, 5]);
        assert_eq!(log.recent(Some(10)).len(), 3);
    }

    #[test]
    fn test_notice_has_no_author() {
        let mut log = ChatLog::new(4);
        let entry = log.notice("v has joined.");
        assert_eq!(entry.kind, ChatKind::System);
        assert_eq!(entry.user_id, None);
        assert_eq!(log.len(), 1);
    }
}
