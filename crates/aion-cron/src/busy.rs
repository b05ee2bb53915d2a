//! Tracks which conversations are currently processing a message, so a
//! fire does not interleave with an agent turn already in progress.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::schedule::now_ms;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversationActivity {
    pub is_processing: bool,
    pub last_active_at: i64,
}

#[derive(Default)]
pub struct BusyGuard {
    states: RwLock<HashMap<String, ConversationActivity>>,
}

impl BusyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_processing(&self, conversation_id: &str) -> bool {
        self.states
            .read()
            .await
            .get(conversation_id)
            .is_some_and(|s| s.is_processing)
    }

    /// Mark the start (`true`) or end (`false`) of an agent turn.
    pub async fn set_processing(&self, conversation_id: &str, processing: bool) {
        let mut states = self.states.write().await;
        let state = states.entry(conversation_id.to_string()).or_default();
        state.is_processing = processing;
        if processing {
            state.last_active_at = now_ms();
        }
        tracing::debug!(conversation_id, processing, "Conversation activity changed");
    }

    /// Drop idle entries not active for `older_than_ms`. Returns how many were removed.
    pub async fn cleanup(&self, older_than_ms: i64) -> usize {
        let now = now_ms();
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, s| s.is_processing || now - s.last_active_at <= older_than_ms);
        before - states.len()
    }

    pub async fn remove(&self, conversation_id: &str) {
        self.states.write().await.remove(conversation_id);
    }
}
