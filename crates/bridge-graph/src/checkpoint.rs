use bridge_core::ids::ConversationId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    /// A `user` turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An `assistant` turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-thread message history, kept for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    threads: DashMap<ConversationId, Vec<ChatMessage>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the thread's history. Empty for unknown threads.
    pub fn history(&self, thread_id: &ConversationId) -> Vec<ChatMessage> {
        self.threads
            .get(thread_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Append `messages` to the thread, creating it if needed.
    pub fn append(&self, thread_id: &ConversationId, messages: impl IntoIterator<Item = ChatMessage>) {
        self.threads
            .entry(thread_id.clone())
            .or_default()
            .extend(messages);
    }

    /// Number of threads with stored history.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Drop a thread's history. Returns whether it existed.
    pub fn clear(&self, thread_id: &ConversationId) -> bool {
        self.threads.remove(thread_id).is_some()
    }
}
