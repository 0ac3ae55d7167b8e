//! Database layer for vigil
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Implementations of every collaborator trait in [`crate::store`]
//! - Uniqueness constraints backing the notification and escalation idempotency guarantees

pub mod repo;
pub mod schema;

pub use repo::{Database, ImportBundle, ImportSummary};
