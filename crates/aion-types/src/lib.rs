use serde::{Deserialize, Serialize};

// ──────────────────── Cron Types ────────────────────

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CronSchedule {
    /// Fire exactly once at an epoch-millisecond timestamp.
    #[serde(rename_all = "camelCase")]
    At { at_ms: i64 },
    /// Fire repeatedly with a fixed interval.
    #[serde(rename_all = "camelCase")]
    Every { every_ms: u64 },
    /// Fire on a cron expression, evaluated in `tz` (UTC when absent).
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
        /// Human-readable summary shown in the UI (e.g. "Every Monday at 9:00").
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl CronSchedule {
    /// Whether this schedule fires only once.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, CronSchedule::At { .. })
    }
}

/// What a job delivers when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CronPayload {
    /// A chat message sent into the owning conversation.
    Message { text: String },
}

impl CronPayload {
    pub fn text(&self) -> &str {
        match self {
            CronPayload::Message { text } => text,
        }
    }
}

/// Who created a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobCreator {
    #[default]
    User,
    Agent,
}

/// Outcome of the most recent trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
    Skipped,
    Missed,
}

/// Lifecycle phase of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    /// Retained but never scheduled.
    #[default]
    Disabled,
    /// Waiting on a timer.
    Scheduled,
    /// A dispatch is in flight.
    Firing,
    /// One-shot job that has fired.
    Completed,
    /// One-shot job whose timestamp passed before it could be scheduled.
    Expired,
}

/// Derived runtime state of a job, recomputed after every fire or edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    /// Next fire time (unix millis). Always `None` unless the job is scheduled.
    #[serde(default)]
    pub next_run_at: Option<i64>,
    /// Last time the job fired (unix millis).
    #[serde(default)]
    pub last_triggered_at: Option<i64>,
    #[serde(default)]
    pub last_status: Option<RunStatus>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub run_count: u64,
    /// Busy-conversation retries used for the current occurrence.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub phase: JobPhase,
}

/// A persisted scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_title: Option<String>,
    /// Agent backend of the owning conversation (e.g. "gemini", "codex").
    #[serde(default)]
    pub agent_type: String,
    #[serde(default)]
    pub created_by: JobCreator,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    pub enabled: bool,
    #[serde(default)]
    pub state: CronJobState,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Parameters of `cron.addJob`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCronJob {
    pub name: String,
    pub schedule: CronSchedule,
    pub message: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_title: Option<String>,
    #[serde(default)]
    pub agent_type: String,
    #[serde(default)]
    pub created_by: JobCreator,
}

/// User-editable fields of `cron.updateJob`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<CronSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

// ──────────────────── Conversation Types ────────────────────

/// A conversation that jobs deliver into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub agent_type: String,
    pub created_at: i64,
    /// Bumped whenever something lands in the conversation, so lists sort by activity.
    pub modify_time: i64,
}

/// Kind of a stored conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Text sent to the agent.
    User,
    /// Informational notice rendered in the middle of the conversation.
    Tips,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::User => "user",
            MessageKind::Tips => "tips",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageKind::User),
            "tips" => Ok(MessageKind::Tips),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// A message stored in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub conversation_id: String,
    pub kind: MessageKind,
    pub content: String,
    /// Origin of the message (e.g. "cron").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub created_at: i64,
}
