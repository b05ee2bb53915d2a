//! Request/response surface of the scheduler.
//!
//! Reads go straight to the service. Mutations go through the service and
//! then publish the matching `cron.onJob*` event.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use aion_events::{AppEvent, EventBus};
use aion_types::{CreateCronJob, CronJob, CronJobUpdate, CronSchedule, JobCreator};

use crate::commands::{CronCommand, detect_cron_commands, has_cron_commands, strip_cron_commands};
use crate::service::CronService;
use crate::CronError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Method not found: {0}")]
    UnknownMethod(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Cron(#[from] CronError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobRequest {
    pub job_id: String,
    #[serde(default)]
    pub updates: CronJobUpdate,
}

/// An agent reply to scan for scheduling commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageRequest {
    pub conversation_id: String,
    #[serde(default)]
    pub agent_type: String,
    #[serde(default)]
    pub conversation_title: Option<String>,
    /// IANA timezone for expressions the agent writes. UTC when absent.
    #[serde(default)]
    pub timezone: Option<String>,
    pub content: String,
}

/// Result of executing one detected command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum CommandOutcome {
    Created { job: CronJob },
    Listed { jobs: Vec<CronJob> },
    Deleted { job_id: String },
    Failed { command: CronCommand, error: String },
}

/// What `cron.applyAgentMessage` did with one agent reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageOutcome {
    /// The reply with command markup removed, as shown to the user.
    pub display_content: String,
    pub outcomes: Vec<CommandOutcome>,
}

pub struct CronBridge {
    service: Arc<CronService>,
    events: Arc<EventBus>,
}

impl CronBridge {
    pub fn new(service: Arc<CronService>) -> Self {
        let events = service.events().clone();
        Self { service, events }
    }

    pub fn service(&self) -> &Arc<CronService> {
        &self.service
    }

    pub async fn list_jobs(&self) -> Result<Vec<CronJob>, BridgeError> {
        Ok(self.service.list_jobs().await?)
    }

    pub async fn list_jobs_by_conversation(
        &self,
        req: ConversationRef,
    ) -> Result<Vec<CronJob>, BridgeError> {
        Ok(self
            .service
            .list_jobs_by_conversation(&req.conversation_id)
            .await?)
    }

    pub async fn get_job(&self, req: JobRef) -> Result<Option<CronJob>, BridgeError> {
        Ok(self.service.get_job(&req.job_id).await?)
    }

    pub async fn add_job(&self, params: CreateCronJob) -> Result<CronJob, BridgeError> {
        let job = self.service.add_job(params).await?;
        self.events.emit(AppEvent::JobCreated(job.clone()));
        Ok(job)
    }

    pub async fn update_job(&self, req: UpdateJobRequest) -> Result<CronJob, BridgeError> {
        let job = self.service.update_job(&req.job_id, req.updates).await?;
        self.events.emit(AppEvent::JobUpdated(job.clone()));
        Ok(job)
    }

    pub async fn remove_job(&self, req: JobRef) -> Result<(), BridgeError> {
        self.service.remove_job(&req.job_id).await?;
        self.events.emit(AppEvent::JobRemoved { job_id: req.job_id });
        Ok(())
    }

    /// Remove every job of a deleted conversation.
    pub async fn remove_jobs_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<String>, BridgeError> {
        let removed = self
            .service
            .remove_jobs_by_conversation(conversation_id)
            .await?;
        for job_id in &removed {
            self.events.emit(AppEvent::JobRemoved {
                job_id: job_id.clone(),
            });
        }
        Ok(removed)
    }

    /// Execute the scheduling commands found in an agent reply.
    ///
    /// A failing command does not stop the ones after it.
    pub async fn apply_agent_message(&self, req: AgentMessageRequest) -> AgentMessageOutcome {
        if !has_cron_commands(&req.content) {
            return AgentMessageOutcome {
                display_content: req.content,
                outcomes: Vec::new(),
            };
        }

        let commands = detect_cron_commands(&req.content);
        let mut outcomes = Vec::with_capacity(commands.len());

        for command in commands {
            let result = match &command {
                CronCommand::Create {
                    name,
                    schedule,
                    schedule_description,
                    message,
                } => self
                    .add_job(CreateCronJob {
                        name: name.clone(),
                        schedule: CronSchedule::Cron {
                            expr: schedule.clone(),
                            tz: req.timezone.clone(),
                            description: Some(schedule_description.clone()),
                        },
                        message: message.clone(),
                        conversation_id: req.conversation_id.clone(),
                        conversation_title: req.conversation_title.clone(),
                        agent_type: req.agent_type.clone(),
                        created_by: JobCreator::Agent,
                    })
                    .await
                    .map(|job| CommandOutcome::Created { job }),
                CronCommand::List => self
                    .list_jobs_by_conversation(ConversationRef {
                        conversation_id: req.conversation_id.clone(),
                    })
                    .await
                    .map(|jobs| CommandOutcome::Listed { jobs }),
                CronCommand::Delete { job_id } => {
                    self.delete_own_job(&req.conversation_id, job_id).await
                }
            };

            outcomes.push(result.unwrap_or_else(|e| {
                tracing::warn!(
                    conversation_id = %req.conversation_id,
                    "Agent cron command failed: {e}"
                );
                CommandOutcome::Failed {
                    command,
                    error: e.to_string(),
                }
            }));
        }
        AgentMessageOutcome {
            display_content: strip_cron_commands(&req.content),
            outcomes,
        }
    }

    /// Agents may only delete jobs of their own conversation.
    async fn delete_own_job(
        &self,
        conversation_id: &str,
        job_id: &str,
    ) -> Result<CommandOutcome, BridgeError> {
        match self.service.get_job(job_id).await? {
            Some(job) if job.conversation_id == conversation_id => {
                self.remove_job(JobRef {
                    job_id: job_id.to_string(),
                })
                .await?;
                Ok(CommandOutcome::Deleted {
                    job_id: job_id.to_string(),
                })
            }
            _ => Err(CronError::NotFound(job_id.to_string()).into()),
        }
    }

    /// Route a JSON request by method name.
    pub async fn handle(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        match method {
            "cron.listJobs" => to_value(self.list_jobs().await?),
            "cron.listJobsByConversation" => {
                to_value(self.list_jobs_by_conversation(parse(params)?).await?)
            }
            "cron.getJob" => to_value(self.get_job(parse(params)?).await?),
            "cron.addJob" => to_value(self.add_job(parse(params)?).await?),
            "cron.updateJob" => to_value(self.update_job(parse(params)?).await?),
            "cron.removeJob" => {
                self.remove_job(parse(params)?).await?;
                Ok(Value::Null)
            }
            "cron.applyAgentMessage" => to_value(self.apply_agent_message(parse(params)?).await),
            other => Err(BridgeError::UnknownMethod(other.to_string())),
        }
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, BridgeError> {
    serde_json::from_value(params).map_err(|e| BridgeError::InvalidParams(e.to_string()))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|e| BridgeError::Cron(CronError::Serde(e)))
}
