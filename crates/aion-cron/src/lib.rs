//! aion-cron: Scheduled jobs that deliver messages into conversations.
//!
//! - [`store`]: durable job records (SQLite or in-memory).
//! - [`schedule`]: pure next-fire computation for `at` / `every` / `cron` schedules.
//! - [`service`]: owns one timer per enabled job and drives fires.
//! - [`dispatcher`]: delivers fired jobs through an [`dispatcher::AgentConnector`].
//! - [`bridge`]: request/response + event surface used by the gateway.

pub mod bridge;
pub mod busy;
pub mod commands;
pub mod dispatcher;
pub mod error;
pub mod schedule;
pub mod service;
pub mod store;
pub mod store_memory;
pub mod timers;

pub use error::{CronError, Result};
