//! Live session tracking.

use bridge_core::ids::{ConnectionId, ConversationId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEntry {
    pub conversation_id: Option<ConversationId>,
    pub connected_at: DateTime<Utc>,
}

/// Open sessions keyed by connection id. Each session owns its own entry;
/// the registry only exists for observation.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly accepted connection.
    pub fn register(&self, connection_id: &ConnectionId) {
        self.sessions.insert(
            connection_id.clone(),
            SessionEntry {
                conversation_id: None,
                connected_at: Utc::now(),
            },
        );
    }

    /// Forget a connection, returning its last entry.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<SessionEntry> {
        self.sessions.remove(connection_id).map(|(_, entry)| entry)
    }

    /// Remember the conversation a connection last named.
    pub fn set_conversation(&self, connection_id: &ConnectionId, conversation_id: &ConversationId) {
        if let Some(mut entry) = self.sessions.get_mut(connection_id) {
            entry.conversation_id = Some(conversation_id.clone());
        }
    }

    /// Snapshot of one connection's entry.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<SessionEntry> {
        self.sessions.get(connection_id).map(|e| e.clone())
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions currently bound to `conversation_id`.
    pub fn count_for(&self, conversation_id: &ConversationId) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.conversation_id.as_ref() == Some(conversation_id))
            .count()
    }
}
