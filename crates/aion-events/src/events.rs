//! Event types pushed to UI listeners.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use aion_types::{ConversationMessage, CronJob};

/// Events that listeners can subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum AppEvent {
    /// A job was created through the bridge.
    #[serde(rename = "cron.onJobCreated")]
    JobCreated(CronJob),
    /// A job changed (edit, fire outcome, expiry).
    #[serde(rename = "cron.onJobUpdated")]
    JobUpdated(CronJob),
    /// A job was removed.
    #[serde(rename = "cron.onJobRemoved", rename_all = "camelCase")]
    JobRemoved { job_id: String },
    /// A fired job was delivered to its conversation.
    #[serde(rename = "cron.onJobExecuted", rename_all = "camelCase")]
    JobExecuted {
        job_id: String,
        conversation_id: String,
        triggered_at: i64,
    },
    /// A fired job could not be delivered.
    #[serde(rename = "cron.onJobFailed", rename_all = "camelCase")]
    JobFailed {
        job_id: String,
        conversation_id: String,
        triggered_at: i64,
        error: String,
    },
    /// A message landed in a conversation.
    #[serde(rename = "conversation.onMessage")]
    MessageAdded(ConversationMessage),
}

impl AppEvent {
    /// Routing name, also used as the JSON-RPC notification method.
    pub fn name(&self) -> &'static str {
        match self {
            AppEvent::JobCreated(_) => "cron.onJobCreated",
            AppEvent::JobUpdated(_) => "cron.onJobUpdated",
            AppEvent::JobRemoved { .. } => "cron.onJobRemoved",
            AppEvent::JobExecuted { .. } => "cron.onJobExecuted",
            AppEvent::JobFailed { .. } => "cron.onJobFailed",
            AppEvent::MessageAdded(_) => "conversation.onMessage",
        }
    }

    /// Event body without the name tag.
    pub fn payload(&self) -> Value {
        match self {
            AppEvent::JobCreated(job) | AppEvent::JobUpdated(job) => {
                serde_json::to_value(job).unwrap_or(Value::Null)
            }
            AppEvent::JobRemoved { job_id } => json!({ "jobId": job_id }),
            AppEvent::JobExecuted {
                job_id,
                conversation_id,
                triggered_at,
            } => json!({
                "jobId": job_id,
                "conversationId": conversation_id,
                "triggeredAt": triggered_at,
            }),
            AppEvent::JobFailed {
                job_id,
                conversation_id,
                triggered_at,
                error,
            } => json!({
                "jobId": job_id,
                "conversationId": conversation_id,
                "triggeredAt": triggered_at,
                "error": error,
            }),
            AppEvent::MessageAdded(message) => {
                serde_json::to_value(message).unwrap_or(Value::Null)
            }
        }
    }

    /// Job id this event is about, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            AppEvent::JobCreated(job) | AppEvent::JobUpdated(job) => Some(&job.id),
            AppEvent::JobRemoved { job_id }
            | AppEvent::JobExecuted { job_id, .. }
            | AppEvent::JobFailed { job_id, .. } => Some(job_id),
            AppEvent::MessageAdded(_) => None,
        }
    }
}
