//! Agent connector backed by the conversation store.
//!
//! Deliveries are appended to the conversation as user messages tagged with
//! source `cron` and published as `conversation.onMessage`, where the agent
//! runtime picks them up.

use std::sync::Arc;

use async_trait::async_trait;

use aion_cron::dispatcher::{AgentConnector, Delivery};
use aion_events::{AppEvent, EventBus};
use aion_storage::ConversationStorage;
use aion_types::{ConversationMessage, MessageKind};

pub const CRON_SOURCE: &str = "cron";

pub struct StorageConnector {
    storage: Arc<ConversationStorage>,
    events: Arc<EventBus>,
}

impl StorageConnector {
    pub fn new(storage: Arc<ConversationStorage>, events: Arc<EventBus>) -> Self {
        Self { storage, events }
    }

    async fn append(&self, message: ConversationMessage) -> anyhow::Result<()> {
        self.storage.add_message(&message).await?;
        self.events.emit(AppEvent::MessageAdded(message));
        Ok(())
    }
}

#[async_trait]
impl AgentConnector for StorageConnector {
    async fn conversation_exists(&self, conversation_id: &str) -> anyhow::Result<bool> {
        Ok(self.storage.get_conversation(conversation_id).await?.is_some())
    }

    async fn deliver(&self, delivery: &Delivery) -> anyhow::Result<()> {
        self.append(ConversationMessage {
            id: delivery.msg_id.clone(),
            conversation_id: delivery.conversation_id.clone(),
            kind: MessageKind::User,
            content: delivery.text.clone(),
            source: Some(CRON_SOURCE.to_string()),
            created_at: chrono::Utc::now().timestamp_millis(),
        })
        .await
    }

    async fn post_notice(&self, conversation_id: &str, text: &str) -> anyhow::Result<()> {
        self.append(ConversationMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            kind: MessageKind::Tips,
            content: text.to_string(),
            source: Some(CRON_SOURCE.to_string()),
            created_at: chrono::Utc::now().timestamp_millis(),
        })
        .await
    }

    async fn touch_conversation(&self, conversation_id: &str) -> anyhow::Result<()> {
        self.storage.touch_conversation(conversation_id).await?;
        Ok(())
    }
}
