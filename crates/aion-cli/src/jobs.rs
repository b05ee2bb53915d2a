use anyhow::{Context, Result};
use chrono::{Local, TimeZone};

use aion_config::AionConfig;
use aion_cron::store::{JobStore, SqliteJobStore};
use aion_types::{CronJob, CronSchedule};

/// Print stored jobs without going through a running Gateway.
pub async fn run_jobs(config: AionConfig, conversation: Option<String>) -> Result<()> {
    let db_path = config.database_path()?;
    if !db_path.exists() {
        println!("No database at {}", db_path.display());
        return Ok(());
    }

    let store = SqliteJobStore::open(&db_path)
        .with_context(|| format!("Failed to open {}", db_path.display()))?;
    let jobs = match &conversation {
        Some(id) => store.list_by_conversation(id).await?,
        None => store.list().await?,
    };

    if jobs.is_empty() {
        println!("No scheduled jobs");
        return Ok(());
    }
    for job in &jobs {
        println!("{}", describe_job(job));
    }
    Ok(())
}

fn describe_job(job: &CronJob) -> String {
    let phase = serde_json::to_value(job.state.phase)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();
    let next = job
        .state
        .next_run_at
        .map(format_time)
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:<24}  {:<28}  {:<9}  next {}  runs {}  conv {}",
        job.id,
        job.name,
        describe_schedule(&job.schedule),
        phase,
        next,
        job.state.run_count,
        job.conversation_id,
    )
}

fn describe_schedule(schedule: &CronSchedule) -> String {
    match schedule {
        CronSchedule::At { at_ms } => format!("at {}", format_time(*at_ms)),
        CronSchedule::Every { every_ms } => format!("every {}s", every_ms / 1000),
        CronSchedule::Cron { expr, tz, .. } => match tz {
            Some(tz) => format!("cron {expr} ({tz})"),
            None => format!("cron {expr}"),
        },
    }
}

fn format_time(ms: i64) -> String {
    Local
        .timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}
