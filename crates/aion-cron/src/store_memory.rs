//! In-memory [`JobStore`], used by tests and when no database is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use aion_types::CronJob;

use crate::store::{JobPatch, JobStore, NewJob};
use crate::{CronError, Result, schedule::now_ms};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, CronJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn collect(&self, filter: impl Fn(&CronJob) -> bool) -> Vec<CronJob> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<CronJob> = jobs.values().filter(|j| filter(j)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list(&self) -> Result<Vec<CronJob>> {
        Ok(self.collect(|_| true).await)
    }

    async fn list_by_conversation(&self, conversation_id: &str) -> Result<Vec<CronJob>> {
        Ok(self.collect(|j| j.conversation_id == conversation_id).await)
    }

    async fn list_enabled(&self) -> Result<Vec<CronJob>> {
        Ok(self.collect(|j| j.enabled).await)
    }

    async fn get(&self, id: &str) -> Result<Option<CronJob>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn create(&self, job: NewJob) -> Result<CronJob> {
        let job = job.into_job(now_ms());
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn update(&self, id: &str, patch: JobPatch) -> Result<CronJob> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;
        patch.apply(job, now_ms());
        Ok(job.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.jobs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CronError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aion_types::{CronJobState, CronPayload, CronSchedule, JobCreator};

    fn new_job(conversation_id: &str, enabled: bool) -> NewJob {
        NewJob {
            name: "ping".into(),
            conversation_id: conversation_id.into(),
            conversation_title: None,
            agent_type: "codex".into(),
            created_by: JobCreator::User,
            schedule: CronSchedule::At { at_ms: i64::MAX },
            payload: CronPayload::Message { text: "hi".into() },
            enabled,
            state: CronJobState::default(),
        }
    }

    #[tokio::test]
    async fn test_crud() {
        let store = MemoryJobStore::new();
        let job = store.create(new_job("c1", true)).await.unwrap();
        assert_eq!(store.get(&job.id).await.unwrap(), Some(job.clone()));

        let renamed = store
            .update(
                &job.id,
                JobPatch {
                    name: Some("pong".into()),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "pong");

        store.delete(&job.id).await.unwrap();
        assert!(store.get(&job.id).await.unwrap().is_none());
        assert!(matches!(store.delete(&job.id).await, Err(CronError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_filters() {
        let store = MemoryJobStore::new();
        store.create(new_job("c1", true)).await.unwrap();
        store.create(new_job("c1", false)).await.unwrap();
        store.create(new_job("c2", true)).await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 3);
        assert_eq!(store.list_by_conversation("c1").await.unwrap().len(), 2);
        assert_eq!(store.list_enabled().await.unwrap().len(), 2);
        assert!(store.list_by_conversation("none").await.unwrap().is_empty());
    }
}
