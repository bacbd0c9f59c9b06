use crate::models::{ChatTurn, Role};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;

pub const DEFAULT_HISTORY_TURNS: usize = 10;
pub const DEFAULT_MAX_CLIENTS: usize = 1024;

/// Per-client chat history kept in process memory. Each client keeps at
/// most `max_turns` turns; the least recently active client is evicted once
/// `max_clients` are tracked.
#[derive(Debug)]
pub struct ConversationLog {
    turns: Mutex<LruCache<String, VecDeque<ChatTurn>>>,
    max_turns: usize,
}

impl Default for ConversationLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_TURNS, DEFAULT_MAX_CLIENTS)
    }
}

impl ConversationLog {
    pub fn new(max_turns: usize, max_clients: usize) -> Self {
        let capacity = NonZeroUsize::new(max_clients).unwrap_or(NonZeroUsize::MIN);
        Self {
            turns: Mutex::new(LruCache::new(capacity)),
            max_turns,
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn record_exchange(&self, client_id: &str, query: &str, answer: &str) {
        if self.max_turns == 0 {
            return;
        }
        let mut turns = self.turns.lock();
        let history = turns.get_or_insert_mut(client_id.to_string(), VecDeque::new);
        history.push_back(ChatTurn {
            role: Role::User,
            content: query.to_string(),
        });
        history.push_back(ChatTurn {
            role: Role::Assistant,
            content: answer.to_string(),
        });
        while history.len() > self.max_turns {
            history.pop_front();
        }
    }

    pub fn recent(&self, client_id: &str, max_turns: usize) -> Vec<ChatTurn> {
        let mut turns = self.turns.lock();
        turns
            .get(client_id)
            .map(|history| {
                let skip = history.len().saturating_sub(max_turns);
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn stored_turns(&self, client_id: &str) -> usize {
        self.turns
            .lock()
            .peek(client_id)
            .map_or(0, VecDeque::len)
    }

    pub fn client_count(&self) -> usize {
        self.turns.lock().len()
    }

    /// Returns false when the client had no history.
    pub fn clear(&self, client_id: &str) -> bool {
        self.turns.lock().pop(client_id).is_some()
    }
}
