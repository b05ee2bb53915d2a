//! Cron service: owns one timer per enabled job and drives fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aion_config::CronConfig;
use aion_events::{AppEvent, EventBus};
use aion_types::{
    CreateCronJob, CronJob, CronJobState, CronJobUpdate, CronPayload, CronSchedule, JobPhase,
    RunStatus,
};

use crate::busy::BusyGuard;
use crate::dispatcher::{AgentConnector, DispatchResult, Dispatcher};
use crate::schedule::{self, next_run_after, now_ms};
use crate::store::{JobPatch, JobStore, NewJob};
use crate::timers::{DueTimer, TimerRegistry};
use crate::{CronError, Result};

/// Upper bound on one idle sleep, so wall-clock jumps are noticed.
const MAX_IDLE: Duration = Duration::from_secs(60);

/// What caused a state recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanTrigger {
    /// add/update/enable.
    Edit,
    /// A dispatch completed.
    Fire,
    /// An occurrence was skipped because the conversation stayed busy.
    Skip,
    /// An occurrence was missed while the process was down or asleep.
    Catchup,
}

/// Recompute `enabled`/`state` for `schedule` at `now`.
fn plan(
    schedule: &CronSchedule,
    enabled: &mut bool,
    state: &mut CronJobState,
    now: i64,
    trigger: PlanTrigger,
) -> Result<()> {
    if !*enabled {
        state.phase = JobPhase::Disabled;
        state.next_run_at = None;
        return Ok(());
    }
    if schedule.is_one_shot() && trigger == PlanTrigger::Fire {
        *enabled = false;
        state.phase = JobPhase::Completed;
        state.next_run_at = None;
        return Ok(());
    }

    match next_run_after(schedule, now)? {
        Some(next) => {
            state.phase = JobPhase::Scheduled;
            state.next_run_at = Some(next);
        }
        None => {
            *enabled = false;
            state.phase = JobPhase::Expired;
            state.next_run_at = None;
            if trigger == PlanTrigger::Edit {
                state.last_status = Some(RunStatus::Skipped);
                state.last_error = Some(if schedule.is_one_shot() {
                    "Scheduled time has passed".to_string()
                } else {
                    "Schedule has no future occurrences".to_string()
                });
            }
        }
    }
    Ok(())
}

/// Like [`plan`], but a schedule that can no longer be evaluated disables the job.
fn plan_or_disable(
    schedule: &CronSchedule,
    enabled: &mut bool,
    state: &mut CronJobState,
    now: i64,
    trigger: PlanTrigger,
) {
    if let Err(e) = plan(schedule, enabled, state, now, trigger) {
        *enabled = false;
        state.phase = JobPhase::Disabled;
        state.next_run_at = None;
        state.last_status = Some(RunStatus::Error);
        state.last_error = Some(e.to_string());
    }
}

fn arm(timers: &mut TimerRegistry, job_id: &str, state: &CronJobState) -> bool {
    match (state.phase, state.next_run_at) {
        (JobPhase::Scheduled, Some(next)) => {
            timers.schedule(job_id, next);
            true
        }
        _ => false,
    }
}

fn format_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn require_text(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CronError::validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// Schedules jobs and records fire outcomes.
pub struct CronService {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    busy: Arc<BusyGuard>,
    events: Arc<EventBus>,
    config: CronConfig,
    timers: Mutex<TimerRegistry>,
    wake: Notify,
    /// Serializes every read-modify-write of job records.
    edit_lock: Mutex<()>,
    initialized: AtomicBool,
    runner: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CronService {
    pub fn new(
        store: Arc<dyn JobStore>,
        connector: Arc<dyn AgentConnector>,
        busy: Arc<BusyGuard>,
        events: Arc<EventBus>,
        config: CronConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            dispatcher: Dispatcher::new(connector, events.clone()),
            busy,
            events,
            config,
            timers: Mutex::new(TimerRegistry::new()),
            wake: Notify::new(),
            edit_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            runner: Mutex::new(None),
        })
    }

    pub fn busy(&self) -> &Arc<BusyGuard> {
        &self.busy
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Number of armed timers.
    pub async fn pending_timers(&self) -> usize {
        self.timers.lock().await.len()
    }

    // ──────────────────── Lifecycle ────────────────────

    /// Reload enabled jobs, apply catch-up, and start the scheduler loop.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let missed = match self.reconcile().await {
            Ok(missed) => missed,
            Err(e) => {
                self.initialized.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run_loop(token.clone()));
        *self.runner.lock().await = Some((token, handle));

        let timers = self.pending_timers().await;
        info!(timers, missed, "Cron service started");
        Ok(())
    }

    /// Re-evaluate every enabled job after the host woke from sleep.
    ///
    /// Returns the number of jobs whose run was missed.
    pub async fn handle_system_resume(&self) -> Result<usize> {
        if !self.is_initialized() {
            return Ok(0);
        }
        info!("System resumed, checking for missed cron jobs");
        self.reconcile().await
    }

    /// Stop the scheduler loop and disarm every timer.
    ///
    /// Dispatches already in flight run to completion.
    pub async fn shutdown(&self) {
        if let Some((token, handle)) = self.runner.lock().await.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Cron scheduler loop ended abnormally: {e}");
            }
        }
        let mut timers = self.timers.lock().await;
        if !timers.is_empty() {
            debug!(timers = timers.len(), "Disarming pending cron timers");
        }
        timers.clear();
        drop(timers);
        self.initialized.store(false, Ordering::SeqCst);
        info!("Cron service stopped");
    }

    // ──────────────────── Job operations ────────────────────

    pub async fn list_jobs(&self) -> Result<Vec<CronJob>> {
        self.store.list().await
    }

    pub async fn list_jobs_by_conversation(&self, conversation_id: &str) -> Result<Vec<CronJob>> {
        self.store.list_by_conversation(conversation_id).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<CronJob>> {
        self.store.get(job_id).await
    }

    /// Validate, persist, and schedule a new job.
    pub async fn add_job(&self, params: CreateCronJob) -> Result<CronJob> {
        let name = require_text("name", &params.name)?;
        let message = require_text("message", &params.message)?;
        let conversation_id = require_text("conversationId", &params.conversation_id)?;
        schedule::validate(&params.schedule)?;

        if !self
            .dispatcher
            .connector()
            .conversation_exists(&conversation_id)
            .await?
        {
            return Err(CronError::validation(format!(
                "Conversation not found: {conversation_id}"
            )));
        }

        let _guard = self.edit_lock.lock().await;

        let limit = self.config.max_jobs_per_conversation;
        if limit > 0 {
            let existing = self.store.list_by_conversation(&conversation_id).await?;
            if existing.len() >= limit {
                let first = &existing[0];
                return Err(CronError::validation(format!(
                    "This conversation already has a scheduled task \"{}\" (ID: {}). \
                     Please delete it first before creating a new one, or use [CRON_LIST] to view existing tasks.",
                    first.name, first.id
                )));
            }
        }

        let mut enabled = true;
        let mut state = CronJobState::default();
        plan(
            &params.schedule,
            &mut enabled,
            &mut state,
            now_ms(),
            PlanTrigger::Edit,
        )?;

        let job = self
            .store
            .create(NewJob {
                name,
                conversation_id,
                conversation_title: params.conversation_title,
                agent_type: params.agent_type,
                created_by: params.created_by,
                schedule: params.schedule,
                payload: CronPayload::Message { text: message },
                enabled,
                state,
            })
            .await?;

        if let Err(e) = self
            .dispatcher
            .connector()
            .touch_conversation(&job.conversation_id)
            .await
        {
            warn!(job_id = %job.id, "Failed to touch conversation: {e:#}");
        }

        if arm(&mut *self.timers.lock().await, &job.id, &job.state) {
            self.wake.notify_one();
        }

        info!(
            job_id = %job.id,
            conversation_id = %job.conversation_id,
            next_run_at = ?job.state.next_run_at,
            "Cron job created"
        );
        Ok(job)
    }

    /// Apply a user edit. Schedule changes and enable/disable recompute the next run.
    pub async fn update_job(&self, job_id: &str, update: CronJobUpdate) -> Result<CronJob> {
        let _guard = self.edit_lock.lock().await;

        let existing = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| CronError::NotFound(job_id.to_string()))?;

        let name = update
            .name
            .as_deref()
            .map(|n| require_text("name", n))
            .transpose()?;
        let message = update
            .message
            .as_deref()
            .map(|m| require_text("message", m))
            .transpose()?;
        if let Some(schedule) = &update.schedule {
            schedule::validate(schedule)?;
        }

        let schedule = update
            .schedule
            .clone()
            .unwrap_or_else(|| existing.schedule.clone());
        let mut enabled = update.enabled.unwrap_or(existing.enabled);
        let replan = update.schedule.is_some() || enabled != existing.enabled;

        let mut patch = JobPatch {
            name,
            schedule: update.schedule,
            payload: message.map(|text| CronPayload::Message { text }),
            ..JobPatch::default()
        };
        if replan {
            let mut state = existing.state.clone();
            state.retry_count = 0;
            plan(
                &schedule,
                &mut enabled,
                &mut state,
                now_ms(),
                PlanTrigger::Edit,
            )?;
            patch.enabled = Some(enabled);
            patch.state = Some(state);
        }

        let job = self.store.update(job_id, patch).await?;

        if replan {
            let mut timers = self.timers.lock().await;
            timers.cancel(job_id);
            arm(&mut timers, job_id, &job.state);
            drop(timers);
            self.wake.notify_one();
        }

        info!(
            job_id,
            enabled = job.enabled,
            next_run_at = ?job.state.next_run_at,
            "Cron job updated"
        );
        Ok(job)
    }

    /// Cancel the pending timer and delete the job.
    pub async fn remove_job(&self, job_id: &str) -> Result<()> {
        let _guard = self.edit_lock.lock().await;
        if self.store.get(job_id).await?.is_none() {
            return Err(CronError::NotFound(job_id.to_string()));
        }
        self.timers.lock().await.forget(job_id);
        self.store.delete(job_id).await?;
        self.wake.notify_one();
        info!(job_id, "Cron job removed");
        Ok(())
    }

    /// Remove every job of a conversation. Returns the removed ids.
    pub async fn remove_jobs_by_conversation(&self, conversation_id: &str) -> Result<Vec<String>> {
        let _guard = self.edit_lock.lock().await;
        let jobs = self.store.list_by_conversation(conversation_id).await?;
        let mut removed = Vec::with_capacity(jobs.len());
        for job in jobs {
            self.timers.lock().await.forget(&job.id);
            self.store.delete(&job.id).await?;
            removed.push(job.id);
        }
        if !removed.is_empty() {
            self.wake.notify_one();
            info!(conversation_id, count = removed.len(), "Cron jobs removed with conversation");
        }
        Ok(removed)
    }

    // ──────────────────── Catch-up ────────────────────

    async fn reconcile(&self) -> Result<usize> {
        let _guard = self.edit_lock.lock().await;
        let now = now_ms();
        let jobs = self.store.list_enabled().await?;

        let mut missed = 0;
        for job in jobs {
            if self.timers.lock().await.is_in_flight(&job.id) {
                continue;
            }
            let job_id = job.id.clone();
            match self.reconcile_job(job, now).await {
                Ok(true) => missed += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, "Failed to reconcile cron job: {e}"),
            }
        }
        self.wake.notify_one();
        Ok(missed)
    }

    /// Bring one enabled job's state up to `now`. Returns whether a run was missed.
    async fn reconcile_job(&self, job: CronJob, now: i64) -> Result<bool> {
        let mut enabled = job.enabled;
        let mut state = job.state.clone();

        let overdue = state.next_run_at.filter(|at| *at <= now);
        if let Some(at) = overdue {
            state.last_status = Some(RunStatus::Missed);
            state.last_error = Some(format!("Missed scheduled run at {}", format_ms(at)));
            state.retry_count = 0;
            plan_or_disable(
                &job.schedule,
                &mut enabled,
                &mut state,
                now,
                PlanTrigger::Catchup,
            );
        } else if state.phase == JobPhase::Firing {
            // Interrupted mid-dispatch: count the run as fired.
            plan_or_disable(
                &job.schedule,
                &mut enabled,
                &mut state,
                now,
                PlanTrigger::Fire,
            );
        } else if state.phase != JobPhase::Scheduled || state.next_run_at.is_none() {
            plan_or_disable(
                &job.schedule,
                &mut enabled,
                &mut state,
                now,
                PlanTrigger::Edit,
            );
        }

        {
            let mut timers = self.timers.lock().await;
            timers.cancel(&job.id);
            arm(&mut timers, &job.id, &state);
        }

        if enabled != job.enabled || state != job.state {
            let updated = self
                .store
                .update(
                    &job.id,
                    JobPatch {
                        enabled: Some(enabled),
                        state: Some(state),
                        ..JobPatch::default()
                    },
                )
                .await?;
            self.events.emit(AppEvent::JobUpdated(updated));
        }

        if let Some(at) = overdue {
            warn!(job_id = %job.id, scheduled_at = at, "Cron job missed its scheduled run");
            let notice = format!(
                "Scheduled task \"{}\" was not executed at its scheduled time ({}).\n\
                 The timer has been restarted and will run at the next scheduled time.",
                job.name,
                format_ms(at)
            );
            if let Err(e) = self
                .dispatcher
                .connector()
                .post_notice(&job.conversation_id, &notice)
                .await
            {
                warn!(job_id = %job.id, "Failed to post missed-run notice: {e:#}");
            }
        }
        Ok(overdue.is_some())
    }

    // ──────────────────── Scheduler loop ────────────────────

    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        debug!("Cron scheduler loop started");
        loop {
            let deadline = self.timers.lock().await.next_deadline();
            let sleep_for = match deadline {
                Some(at) => Duration::from_millis((at - now_ms()).max(0) as u64).min(MAX_IDLE),
                None => MAX_IDLE,
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wake.notified() => continue,
                _ = tokio::time::sleep(sleep_for) => {}
            }

            self.fire_due().await;
        }
        debug!("Cron scheduler loop stopped");
    }

    /// Start every due fire. Dispatches of one batch start in `(fire_at, id)` order.
    async fn fire_due(self: &Arc<Self>) {
        let now = now_ms();
        let due = self.timers.lock().await.take_due(now);
        if due.is_empty() {
            return;
        }

        let mut batch = Vec::with_capacity(due.len());
        for timer in due {
            match self.prepare_fire(&timer, now).await {
                Ok(Some(job)) => batch.push((timer, job)),
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %timer.job_id, "Failed to prepare cron fire: {e}");
                    self.timers.lock().await.finish(&timer.job_id);
                }
            }
        }
        if batch.is_empty() {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let fires = batch
                .into_iter()
                .map(|(timer, job)| this.run_fire(timer, job, now));
            join_all(fires).await;
        });
    }

    /// Mark a due job as firing, or handle a busy conversation.
    ///
    /// Returns the job to dispatch, or `None` when nothing should be sent now.
    async fn prepare_fire(&self, timer: &DueTimer, now: i64) -> Result<Option<CronJob>> {
        let _guard = self.edit_lock.lock().await;

        let Some(job) = self.store.get(&timer.job_id).await? else {
            self.timers.lock().await.finish(&timer.job_id);
            return Ok(None);
        };

        {
            let mut timers = self.timers.lock().await;
            if timers.epoch(&job.id) != timer.epoch || !job.enabled {
                // Edited since the timer was taken; the edit armed its own timer.
                if timers.finish(&job.id) {
                    arm(&mut timers, &job.id, &job.state);
                }
                return Ok(None);
            }
        }

        let mut enabled = job.enabled;
        let mut state = job.state.clone();

        if self.busy.is_processing(&job.conversation_id).await {
            state.retry_count += 1;
            if state.retry_count > self.config.max_retries {
                state.last_status = Some(RunStatus::Skipped);
                state.last_error = Some(format!(
                    "Conversation busy after {} retries",
                    self.config.max_retries
                ));
                state.retry_count = 0;
                plan_or_disable(&job.schedule, &mut enabled, &mut state, now, PlanTrigger::Skip);
                info!(job_id = %job.id, "Conversation still busy, skipping cron occurrence");
            } else {
                let retry_at = now.saturating_add(self.config.busy_retry_delay_ms as i64);
                state.phase = JobPhase::Scheduled;
                state.next_run_at = Some(retry_at);
                debug!(
                    job_id = %job.id,
                    retry = state.retry_count,
                    retry_at,
                    "Conversation busy, retrying cron fire later"
                );
            }

            {
                let mut timers = self.timers.lock().await;
                timers.finish(&job.id);
                arm(&mut timers, &job.id, &state);
            }
            let updated = self
                .store
                .update(
                    &job.id,
                    JobPatch {
                        enabled: Some(enabled),
                        state: Some(state),
                        ..JobPatch::default()
                    },
                )
                .await?;
            self.events.emit(AppEvent::JobUpdated(updated));
            return Ok(None);
        }

        state.phase = JobPhase::Firing;
        state.next_run_at = None;
        state.last_triggered_at = Some(now);
        state.run_count += 1;
        let job = self.store.update(&job.id, JobPatch::state(state)).await?;
        Ok(Some(job))
    }

    async fn run_fire(&self, timer: DueTimer, job: CronJob, triggered_at: i64) {
        debug!(job_id = %job.id, fire_at = timer.fire_at, "Firing cron job");
        let result = self.dispatcher.dispatch(&job, triggered_at).await;
        if let Err(e) = self.complete_fire(&timer, result).await {
            warn!(job_id = %timer.job_id, "Failed to record cron fire outcome: {e}");
            self.timers.lock().await.finish(&timer.job_id);
        }
    }

    /// Record the outcome of a dispatch and schedule the following occurrence.
    async fn complete_fire(&self, timer: &DueTimer, result: DispatchResult) -> Result<()> {
        let _guard = self.edit_lock.lock().await;

        let Some(job) = self.store.get(&timer.job_id).await? else {
            self.timers.lock().await.finish(&timer.job_id);
            debug!(job_id = %timer.job_id, "Cron job removed during dispatch, discarding outcome");
            return Ok(());
        };

        let mut enabled = job.enabled;
        let mut state = job.state.clone();
        state.last_status = Some(if result.ok {
            RunStatus::Ok
        } else {
            RunStatus::Error
        });
        state.last_error = result.error;
        state.retry_count = 0;

        let now = now_ms();
        {
            let mut timers = self.timers.lock().await;
            let deferred = timers.finish(&job.id);
            let stale = timers.epoch(&job.id) != timer.epoch;
            if !stale || state.phase == JobPhase::Firing {
                plan_or_disable(&job.schedule, &mut enabled, &mut state, now, PlanTrigger::Fire);
                if !stale {
                    arm(&mut timers, &job.id, &state);
                }
            } else if deferred {
                arm(&mut timers, &job.id, &state);
            }
        }
        self.wake.notify_one();

        let updated = self
            .store
            .update(
                &job.id,
                JobPatch {
                    enabled: Some(enabled),
                    state: Some(state),
                    ..JobPatch::default()
                },
            )
            .await?;
        debug!(
            job_id = %updated.id,
            status = ?updated.state.last_status,
            next_run_at = ?updated.state.next_run_at,
            "Cron fire recorded"
        );
        self.events.emit(AppEvent::JobUpdated(updated));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use crate::dispatcher::Delivery;
    use crate::dispatcher::testing::RecordingConnector;
    use crate::store_memory::MemoryJobStore;
    use aion_types::JobCreator;
    use tokio::sync::broadcast;

    struct Harness {
        service: Arc<CronService>,
        connector: Arc<RecordingConnector>,
        store: Arc<MemoryJobStore>,
        events: Arc<EventBus>,
    }

    fn harness_with(config: CronConfig, conversations: &[&str]) -> Harness {
        let connector = RecordingConnector::with_conversations(conversations);
        let store = Arc::new(MemoryJobStore::new());
        let events = Arc::new(EventBus::default());
        let service = CronService::new(
            store.clone(),
            connector.clone(),
            Arc::new(BusyGuard::new()),
            events.clone(),
            config,
        );
        Harness {
            service,
            connector,
            store,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(CronConfig::default(), &["c1", "c2", "c3"])
    }

    fn create(conversation_id: &str, schedule: CronSchedule) -> CreateCronJob {
        CreateCronJob {
            name: "reminder".into(),
            schedule,
            message: "stand-up time".into(),
            conversation_id: conversation_id.into(),
            conversation_title: None,
            agent_type: "gemini".into(),
            created_by: JobCreator::User,
        }
    }

    /// Wait for the next event matching `pred`.
    async fn next_event(
        rx: &mut broadcast::Receiver<AppEvent>,
        pred: impl Fn(&AppEvent) -> bool,
    ) -> AppEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[test]
    fn test_plan_one_shot() {
        let at = CronSchedule::At { at_ms: 1_000 };
        let mut enabled = true;
        let mut state = CronJobState::default();
        plan(&at, &mut enabled, &mut state, 500, PlanTrigger::Edit).unwrap();
        assert_eq!(state.phase, JobPhase::Scheduled);
        assert_eq!(state.next_run_at, Some(1_000));

        plan(&at, &mut enabled, &mut state, 1_000, PlanTrigger::Fire).unwrap();
        assert!(!enabled);
        assert_eq!(state.phase, JobPhase::Completed);
        assert_eq!(state.next_run_at, None);
    }

    #[test]
    fn test_plan_disabled_clears_next() {
        let every = CronSchedule::Every { every_ms: 10 };
        let mut enabled = false;
        let mut state = CronJobState {
            next_run_at: Some(99),
            phase: JobPhase::Scheduled,
            ..CronJobState::default()
        };
        plan(&every, &mut enabled, &mut state, 0, PlanTrigger::Edit).unwrap();
        assert_eq!(state.phase, JobPhase::Disabled);
        assert_eq!(state.next_run_at, None);
    }

    #[tokio::test]
    async fn test_one_shot_fires_exactly_once() {
        let h = harness();
        let mut rx = h.events.subscribe();
        h.service.init().await.unwrap();

        let job = h
            .service
            .add_job(create("c1", CronSchedule::At { at_ms: now_ms() + 100 }))
            .await
            .unwrap();
        assert_eq!(job.state.phase, JobPhase::Scheduled);

        let executed = next_event(&mut rx, |e| matches!(e, AppEvent::JobExecuted { .. })).await;
        assert_eq!(executed.job_id(), Some(job.id.as_str()));

        let updated = next_event(&mut rx, |e| matches!(e, AppEvent::JobUpdated(_))).await;
        let AppEvent::JobUpdated(updated) = updated else {
            unreachable!()
        };
        assert_eq!(updated.state.phase, JobPhase::Completed);
        assert_eq!(updated.state.last_status, Some(RunStatus::Ok));
        assert_eq!(updated.state.run_count, 1);
        assert!(!updated.enabled);
        assert_eq!(updated.state.next_run_at, None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.connector.delivered_job_ids(), vec![job.id.clone()]);
        assert_eq!(h.service.pending_timers().await, 0);
        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_keep_recurring_job_scheduled() {
        let h = harness();
        let mut rx = h.events.subscribe();
        h.service.init().await.unwrap();

        let job = h
            .service
            .add_job(create("c1", CronSchedule::Every { every_ms: 100 }))
            .await
            .unwrap();
        h.connector.fail_job(&job.id);

        let mut failures = 0;
        let mut last = None;
        while failures < 2 {
            let event = next_event(&mut rx, |e| matches!(e, AppEvent::JobUpdated(_))).await;
            if let AppEvent::JobUpdated(updated) = event {
                if updated.state.last_status == Some(RunStatus::Error) {
                    failures += 1;
                    last = Some(updated);
                }
            }
        }
        let last = last.unwrap();
        assert!(last.enabled);
        assert_eq!(last.state.phase, JobPhase::Scheduled);
        assert!(last.state.last_error.as_deref().unwrap().contains("agent unavailable"));
        assert!(last.state.next_run_at.unwrap() > last.state.last_triggered_at.unwrap());
        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_instant_dispatches_in_id_order() {
        let h = harness_with(
            CronConfig {
                max_jobs_per_conversation: 0,
                ..CronConfig::default()
            },
            &["c1"],
        );
        let mut rx = h.events.subscribe();
        h.service.init().await.unwrap();

        let at = now_ms() + 150;
        let mut ids = Vec::new();
        for _ in 0..4 {
            let job = h
                .service
                .add_job(create("c1", CronSchedule::At { at_ms: at }))
                .await
                .unwrap();
            ids.push(job.id);
        }
        ids.sort();

        for _ in 0..4 {
            next_event(&mut rx, |e| matches!(e, AppEvent::JobExecuted { .. })).await;
        }
        assert_eq!(h.connector.delivered_job_ids(), ids);
        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_prevents_dispatch() {
        let h = harness();
        h.service.init().await.unwrap();

        let job = h
            .service
            .add_job(create("c1", CronSchedule::At { at_ms: now_ms() + 150 }))
            .await
            .unwrap();
        h.service.remove_job(&job.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(h.connector.delivered_job_ids().is_empty());
        assert!(h.service.get_job(&job.id).await.unwrap().is_none());
        assert!(matches!(
            h.service.remove_job(&job.id).await,
            Err(CronError::NotFound(_))
        ));
        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_disable_clears_next_run() {
        let h = harness();
        h.service.init().await.unwrap();

        let job = h
            .service
            .add_job(create("c1", CronSchedule::Every { every_ms: 60_000 }))
            .await
            .unwrap();
        assert!(job.state.next_run_at.is_some());
        assert_eq!(h.service.pending_timers().await, 1);

        let disabled = h
            .service
            .update_job(
                &job.id,
                CronJobUpdate {
                    enabled: Some(false),
                    ..CronJobUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.state.next_run_at, None);
        assert_eq!(disabled.state.phase, JobPhase::Disabled);
        assert_eq!(h.service.pending_timers().await, 0);

        let enabled = h
            .service
            .update_job(
                &job.id,
                CronJobUpdate {
                    enabled: Some(true),
                    ..CronJobUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(enabled.state.phase, JobPhase::Scheduled);
        assert!(enabled.state.next_run_at.is_some());
        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_rename_keeps_schedule() {
        let h = harness();
        let job = h
            .service
            .add_job(create("c1", CronSchedule::Every { every_ms: 60_000 }))
            .await
            .unwrap();
        let renamed = h
            .service
            .update_job(
                &job.id,
                CronJobUpdate {
                    name: Some("  evening  ".into()),
                    message: Some("wrap up".into()),
                    ..CronJobUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "evening");
        assert_eq!(renamed.payload.text(), "wrap up");
        assert_eq!(renamed.state.next_run_at, job.state.next_run_at);
    }

    #[tokio::test]
    async fn test_list_is_idempotent() {
        let h = harness();
        h.service
            .add_job(create("c1", CronSchedule::Every { every_ms: 60_000 }))
            .await
            .unwrap();
        h.service
            .add_job(create("c2", CronSchedule::Every { every_ms: 60_000 }))
            .await
            .unwrap();

        let first = h.service.list_jobs().await.unwrap();
        let second = h.service.list_jobs().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(
            h.service.list_jobs_by_conversation("c2").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_past_one_shot_is_expired() {
        let h = harness();
        let job = h
            .service
            .add_job(create("c1", CronSchedule::At { at_ms: now_ms() - 1_000 }))
            .await
            .unwrap();
        assert!(!job.enabled);
        assert_eq!(job.state.phase, JobPhase::Expired);
        assert_eq!(job.state.last_status, Some(RunStatus::Skipped));
        assert_eq!(
            job.state.last_error.as_deref(),
            Some("Scheduled time has passed")
        );
        assert_eq!(h.service.pending_timers().await, 0);
    }

    #[tokio::test]
    async fn test_add_validation() {
        let h = harness();

        let err = h
            .service
            .add_job(create("ghost", CronSchedule::Every { every_ms: 1_000 }))
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::Validation(ref m) if m.contains("Conversation not found")));

        let bad_cron = CronSchedule::Cron {
            expr: "61 * * * *".into(),
            tz: None,
            description: None,
        };
        assert!(matches!(
            h.service.add_job(create("c1", bad_cron)).await,
            Err(CronError::Validation(_))
        ));

        let mut blank = create("c1", CronSchedule::Every { every_ms: 1_000 });
        blank.name = "   ".into();
        assert!(matches!(
            h.service.add_job(blank).await,
            Err(CronError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_one_job_per_conversation() {
        let h = harness();
        let first = h
            .service
            .add_job(create("c1", CronSchedule::Every { every_ms: 60_000 }))
            .await
            .unwrap();
        let err = h
            .service
            .add_job(create("c1", CronSchedule::Every { every_ms: 60_000 }))
            .await
            .unwrap_err();
        match err {
            CronError::Validation(message) => {
                assert!(message.contains(&first.id));
                assert!(message.contains("[CRON_LIST]"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let h = harness();
        assert!(matches!(
            h.service
                .update_job("cron_missing", CronJobUpdate::default())
                .await,
            Err(CronError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_busy_conversation_retries_then_skips() {
        let h = harness_with(
            CronConfig {
                max_retries: 1,
                busy_retry_delay_ms: 50,
                ..CronConfig::default()
            },
            &["c1"],
        );
        let mut rx = h.events.subscribe();
        h.service.busy().set_processing("c1", true).await;
        h.service.init().await.unwrap();

        let job = h
            .service
            .add_job(create("c1", CronSchedule::At { at_ms: now_ms() + 50 }))
            .await
            .unwrap();

        let retry = next_event(&mut rx, |e| matches!(e, AppEvent::JobUpdated(_))).await;
        let AppEvent::JobUpdated(retry) = retry else {
            unreachable!()
        };
        assert_eq!(retry.state.retry_count, 1);
        assert_eq!(retry.state.phase, JobPhase::Scheduled);

        let skipped = next_event(&mut rx, |e| matches!(e, AppEvent::JobUpdated(_))).await;
        let AppEvent::JobUpdated(skipped) = skipped else {
            unreachable!()
        };
        assert_eq!(skipped.id, job.id);
        assert_eq!(skipped.state.last_status, Some(RunStatus::Skipped));
        assert_eq!(skipped.state.retry_count, 0);
        assert_eq!(skipped.state.phase, JobPhase::Expired);
        assert!(h.connector.delivered_job_ids().is_empty());
        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_init_marks_overdue_jobs_missed() {
        let h = harness();
        let now = now_ms();
        let job = h
            .store
            .create(NewJob {
                name: "nightly".into(),
                conversation_id: "c1".into(),
                conversation_title: None,
                agent_type: "gemini".into(),
                created_by: JobCreator::User,
                schedule: CronSchedule::Every { every_ms: 60_000 },
                payload: CronPayload::Message { text: "go".into() },
                enabled: true,
                state: CronJobState {
                    next_run_at: Some(now - 5_000),
                    phase: JobPhase::Scheduled,
                    ..CronJobState::default()
                },
            })
            .await
            .unwrap();

        h.service.init().await.unwrap();

        let reloaded = h.service.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state.last_status, Some(RunStatus::Missed));
        assert!(reloaded.state.next_run_at.unwrap() > now);
        assert_eq!(reloaded.state.phase, JobPhase::Scheduled);

        let notices = h.connector.notices.lock().unwrap().clone();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, "c1");
        assert!(notices[0].1.contains("nightly"));
        assert!(h.connector.delivered_job_ids().is_empty());

        assert_eq!(h.service.handle_system_resume().await.unwrap(), 0);
        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_clears_timers() {
        let h = harness();
        h.service.init().await.unwrap();
        h.service
            .add_job(create("c1", CronSchedule::Every { every_ms: 60_000 }))
            .await
            .unwrap();
        assert_eq!(h.service.pending_timers().await, 1);

        h.service.shutdown().await;
        assert_eq!(h.service.pending_timers().await, 0);
        assert!(!h.service.is_initialized());
        assert_eq!(h.service.handle_system_resume().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_jobs_by_conversation() {
        let h = harness();
        let job = h
            .service
            .add_job(create("c1", CronSchedule::Every { every_ms: 60_000 }))
            .await
            .unwrap();
        h.service
            .add_job(create("c2", CronSchedule::Every { every_ms: 60_000 }))
            .await
            .unwrap();

        let removed = h.service.remove_jobs_by_conversation("c1").await.unwrap();
        assert_eq!(removed, vec![job.id]);
        assert_eq!(h.service.list_jobs().await.unwrap().len(), 1);
        assert_eq!(h.service.pending_timers().await, 1);
    }

    #[tokio::test]
    async fn test_add_touches_conversation() {
        let h = harness();
        h.service
            .add_job(create("c2", CronSchedule::Every { every_ms: 60_000 }))
            .await
            .unwrap();
        assert_eq!(h.connector.touched.lock().unwrap().clone(), vec!["c2"]);
    }

    #[tokio::test]
    async fn test_init_completes_one_shot_interrupted_mid_fire() {
        let h = harness();
        let job = h
            .store
            .create(NewJob {
                name: "once".into(),
                conversation_id: "c1".into(),
                conversation_title: None,
                agent_type: "gemini".into(),
                created_by: JobCreator::User,
                schedule: CronSchedule::At {
                    at_ms: now_ms() - 5_000,
                },
                payload: CronPayload::Message { text: "go".into() },
                enabled: true,
                state: CronJobState {
                    phase: JobPhase::Firing,
                    next_run_at: None,
                    run_count: 1,
                    ..CronJobState::default()
                },
            })
            .await
            .unwrap();

        h.service.init().await.unwrap();

        let reloaded = h.service.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state.phase, JobPhase::Completed);
        assert!(!reloaded.enabled);
        assert_ne!(reloaded.state.last_status, Some(RunStatus::Skipped));
        assert_eq!(reloaded.state.run_count, 1);
        assert_eq!(h.service.pending_timers().await, 0);
        assert!(h.connector.delivered_job_ids().is_empty());
        h.service.shutdown().await;
    }

    /// Connector whose deliveries take `delay` and which tracks concurrency.
    struct SlowConnector {
        delay: Duration,
        delivered: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl SlowConnector {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                delivered: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }

        fn delivered(&self) -> usize {
            self.delivered.load(Ordering::SeqCst)
        }

        fn active(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentConnector for SlowConnector {
        async fn conversation_exists(&self, _conversation_id: &str) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn deliver(&self, _delivery: &Delivery) -> anyhow::Result<()> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            self.delivered.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn post_notice(&self, _conversation_id: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn touch_conversation(&self, _conversation_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn slow_service(connector: Arc<SlowConnector>) -> (Arc<CronService>, Arc<EventBus>) {
        let events = Arc::new(EventBus::default());
        let service = CronService::new(
            Arc::new(MemoryJobStore::new()),
            connector,
            Arc::new(BusyGuard::new()),
            events.clone(),
            CronConfig::default(),
        );
        (service, events)
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_remove_during_dispatch_discards_outcome() {
        let connector = SlowConnector::new(Duration::from_millis(200));
        let (service, _events) = slow_service(connector.clone());
        service.init().await.unwrap();

        let job = service
            .add_job(create("c1", CronSchedule::Every { every_ms: 50 }))
            .await
            .unwrap();

        wait_until(|| connector.delivered() >= 3 && connector.active() == 1).await;
        service.remove_job(&job.id).await.unwrap();
        let delivered = connector.delivered();

        wait_until(|| connector.active() == 0).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(connector.delivered(), delivered);
        assert_eq!(connector.max_active.load(Ordering::SeqCst), 1);
        assert!(service.get_job(&job.id).await.unwrap().is_none());
        assert_eq!(service.pending_timers().await, 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_edit_during_dispatch_fires_after_completion() {
        let connector = SlowConnector::new(Duration::from_millis(300));
        let (service, events) = slow_service(connector.clone());
        let mut rx = events.subscribe();
        service.init().await.unwrap();

        let job = service
            .add_job(create("c1", CronSchedule::At { at_ms: now_ms() + 50 }))
            .await
            .unwrap();

        wait_until(|| connector.active() == 1).await;
        service
            .update_job(
                &job.id,
                CronJobUpdate {
                    schedule: Some(CronSchedule::At { at_ms: now_ms() + 50 }),
                    ..CronJobUpdate::default()
                },
            )
            .await
            .unwrap();

        let done = next_event(&mut rx, |e| {
            matches!(e, AppEvent::JobUpdated(j) if j.state.phase == JobPhase::Completed)
        })
        .await;
        let AppEvent::JobUpdated(done) = done else {
            unreachable!()
        };
        assert_eq!(done.state.run_count, 2);
        assert!(!done.enabled);
        assert_eq!(connector.delivered(), 2);
        assert_eq!(connector.max_active.load(Ordering::SeqCst), 1);
        service.shutdown().await;
    }
}
