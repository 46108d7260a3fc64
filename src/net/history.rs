//! Bounded chat history (read model for UIs)

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// One delivered or sent chat line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_own: bool,
    pub is_private: bool,
}

/// Ring buffer of the most recent messages; the oldest entry is evicted first
pub struct ChatHistory {
    capacity: usize,
    messages: RwLock<VecDeque<ChatMessage>>,
}

impl ChatHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            messages: RwLock::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub async fn push(&self, msg: ChatMessage) {
        let mut messages = self.messages.write().await;
        while messages.len() >= self.capacity {
            messages.pop_front();
        }
        messages.push_back(msg);
    }

    /// Oldest first
    pub async fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.read().await.iter().cloned().collect()
    }
}
