//! # vigil-core
//!
//! Core library for vigil, a periodic condition monitor and escalation engine.
//!
//! This library provides:
//! - Domain types for watched entities, milestones, findings and escalation rules
//! - The evaluation pass: condition evaluation, daily dedup, dispatch, escalation and actions
//! - Database storage layer with SQLite
//! - A cron-driven scheduler
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! A pass reads a snapshot of entities and milestones through the collaborator
//! traits in [`store`], produces fresh [`Finding`]s, and persists each one at
//! most once per recipient, subject, check and calendar day. Overdue milestones
//! climb a ladder of escalation levels, gated by a cool-down window per
//! (rule, milestone, level). Escalations may trigger side-effecting actions,
//! each isolated from the others' failures.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vigil_core::{CancelToken, Config, Database, MonitorEngine};
//!
//! let config = Config::load().expect("failed to load config");
//!
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let engine = MonitorEngine::from_config(Arc::new(db), &config).expect("invalid config");
//! let report = engine.run_pass(chrono::Utc::now(), &CancelToken::new());
//! println!("created {} notifications", report.created);
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::{Database, ImportBundle, ImportSummary};
pub use engine::{CancelToken, MonitorEngine, PassReport, PassStage};
pub use error::{Error, Result};
pub use scheduler::{Scheduler, SchedulerStatus};
pub use types::*;

// Public modules
pub mod actions;
pub mod calendar;
pub mod config;
pub mod db;
pub mod dedup;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod evaluator;
pub mod http;
pub mod logging;
pub mod rules;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod types;
