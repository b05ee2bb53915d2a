//! Delivery of fired jobs into their conversations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use aion_events::{AppEvent, EventBus};
use aion_types::CronJob;

use crate::CronError;

/// A single message delivery produced by a fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: String,
    pub conversation_id: String,
    pub agent_type: String,
    pub text: String,
    pub msg_id: String,
    pub triggered_at: i64,
}

/// The agent side of the system: conversations and the backends behind them.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn conversation_exists(&self, conversation_id: &str) -> anyhow::Result<bool>;

    /// Send a job's message to the conversation's agent. Fails when the
    /// conversation or its agent is unavailable.
    async fn deliver(&self, delivery: &Delivery) -> anyhow::Result<()>;

    /// Post an informational notice (not sent to the agent) into a conversation.
    async fn post_notice(&self, conversation_id: &str, text: &str) -> anyhow::Result<()>;

    /// Bump the conversation's modification time so it sorts as recently active.
    async fn touch_conversation(&self, conversation_id: &str) -> anyhow::Result<()>;
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

pub struct Dispatcher {
    connector: Arc<dyn AgentConnector>,
    events: Arc<EventBus>,
}

impl Dispatcher {
    pub fn new(connector: Arc<dyn AgentConnector>, events: Arc<EventBus>) -> Self {
        Self { connector, events }
    }

    pub fn connector(&self) -> &Arc<dyn AgentConnector> {
        &self.connector
    }

    /// Deliver `job`'s payload. Failures are reported in the result and as a
    /// `cron.onJobFailed` event; this never returns an error.
    pub async fn dispatch(&self, job: &CronJob, triggered_at: i64) -> DispatchResult {
        let delivery = Delivery {
            job_id: job.id.clone(),
            conversation_id: job.conversation_id.clone(),
            agent_type: job.agent_type.clone(),
            text: job.payload.text().to_string(),
            msg_id: uuid::Uuid::new_v4().to_string(),
            triggered_at,
        };

        match self.connector.deliver(&delivery).await {
            Ok(()) => {
                tracing::info!(
                    job_id = %job.id,
                    conversation_id = %job.conversation_id,
                    "Cron job delivered"
                );
                self.events
                    .emit(AppEvent::JobExecuted {
                        job_id: job.id.clone(),
                        conversation_id: job.conversation_id.clone(),
                        triggered_at,
                    });
                DispatchResult::ok()
            }
            Err(e) => {
                let error = CronError::Dispatch(format!("{e:#}")).to_string();
                tracing::warn!(
                    job_id = %job.id,
                    conversation_id = %job.conversation_id,
                    "Cron job dispatch failed: {error}"
                );
                self.events
                    .emit(AppEvent::JobFailed {
                        job_id: job.id.clone(),
                        conversation_id: job.conversation_id.clone(),
                        triggered_at,
                        error: error.clone(),
                    });
                DispatchResult::failed(error)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    /// Connector that records deliveries and fails for unknown conversations.
    #[derive(Default)]
    pub struct RecordingConnector {
        pub conversations: Mutex<HashSet<String>>,
        pub failing: Mutex<HashSet<String>>,
        pub deliveries: Mutex<Vec<Delivery>>,
        pub notices: Mutex<Vec<(String, String)>>,
        pub touched: Mutex<Vec<String>>,
    }

    impl RecordingConnector {
        pub fn with_conversations(ids: &[&str]) -> Arc<Self> {
            let connector = Self::default();
            connector
                .conversations
                .lock()
                .unwrap()
                .extend(ids.iter().map(|s| s.to_string()));
            Arc::new(connector)
        }

        pub fn fail_job(&self, job_id: &str) {
            self.failing.lock().unwrap().insert(job_id.to_string());
        }

        pub fn delivered_job_ids(&self) -> Vec<String> {
            self.deliveries
                .lock()
                .unwrap()
                .iter()
                .map(|d| d.job_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl AgentConnector for RecordingConnector {
        async fn conversation_exists(&self, conversation_id: &str) -> anyhow::Result<bool> {
            Ok(self.conversations.lock().unwrap().contains(conversation_id))
        }

        async fn deliver(&self, delivery: &Delivery) -> anyhow::Result<()> {
            self.deliveries.lock().unwrap().push(delivery.clone());
            if self.failing.lock().unwrap().contains(&delivery.job_id) {
                anyhow::bail!("agent unavailable");
            }
            if !self
                .conversations
                .lock()
                .unwrap()
                .contains(&delivery.conversation_id)
            {
                anyhow::bail!("Conversation not found: {}", delivery.conversation_id);
            }
            Ok(())
        }

        async fn post_notice(&self, conversation_id: &str, text: &str) -> anyhow::Result<()> {
            self.notices
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn touch_conversation(&self, conversation_id: &str) -> anyhow::Result<()> {
            self.touched.lock().unwrap().push(conversation_id.to_string());
            Ok(())
        }
    }
}
