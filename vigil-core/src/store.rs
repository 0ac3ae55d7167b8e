//! Collaborator interfaces consumed by the engine
//!
//! The engine never assumes a storage format. Everything it reads or writes
//! goes through these traits; [`crate::db::Database`] implements all of them on
//! SQLite, and tests can substitute their own.

use chrono::{DateTime, NaiveDate, Utc};

use crate::actions::ActionLogEntry;
use crate::error::Result;
use crate::types::{
    CheckType, EntityStatus, EscalationHistoryEntry, EscalationLevel, EscalationRule, Milestone,
    NewNotification, TeamMember, WatchedEntity,
};

/// Source of watched entities.
pub trait WatchedEntityRepository: Send + Sync {
    /// Entities eligible for monitoring: in progress and not soft-deleted.
    fn list_active(&self) -> Result<Vec<WatchedEntity>>;

    fn get(&self, id: &str) -> Result<Option<WatchedEntity>>;

    /// Write the status field back. Used only by configured actions.
    fn set_status(&self, id: &str, status: &EntityStatus) -> Result<()>;
}

/// Source of milestones.
pub trait MilestoneRepository: Send + Sync {
    /// Milestones past due at `now` and not completed.
    fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Milestone>>;

    /// Milestones due after `now` and no later than `within_days` ahead, not completed.
    fn list_upcoming(&self, now: DateTime<Utc>, within_days: i64) -> Result<Vec<Milestone>>;
}

/// Persisted notification records.
pub trait NotificationStore: Send + Sync {
    fn exists_today(
        &self,
        recipient_id: &str,
        subject_id: &str,
        check_type: CheckType,
        day: NaiveDate,
    ) -> Result<bool>;

    /// Persist a record and return its id.
    ///
    /// Returns [`crate::Error::Duplicate`] when a record with the same
    /// recipient, subject, check type and day already exists.
    fn create(&self, record: &NewNotification) -> Result<i64>;
}

/// The escalation ladder's append-only ledger.
pub trait EscalationHistoryStore: Send + Sync {
    fn exists_within_window(
        &self,
        rule_id: &str,
        milestone_id: &str,
        level: EscalationLevel,
        window_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    fn append(&self, entry: &EscalationHistoryEntry) -> Result<()>;

    /// Check the window and append in one atomic step.
    ///
    /// Returns `false` when an entry for the same rule, milestone and level
    /// already exists within `window_hours` of `entry.created_at`.
    fn append_if_absent(&self, entry: &EscalationHistoryEntry, window_hours: i64) -> Result<bool> {
        if self.exists_within_window(
            &entry.rule_id,
            &entry.milestone_id,
            entry.level,
            window_hours,
            entry.created_at,
        )? {
            return Ok(false);
        }
        self.append(entry)?;
        Ok(true)
    }
}

/// Escalation rule configuration.
pub trait RuleRepository: Send + Sync {
    /// Rules attached to a subject (project). Includes inactive rules.
    fn rules_for(&self, subject_id: &str) -> Result<Vec<EscalationRule>>;
}

/// Resolves escalation roles to people.
pub trait TeamDirectory: Send + Sync {
    fn members_with_role(&self, project_id: &str, role: &str) -> Result<Vec<TeamMember>>;
}

/// Optional sink for action execution results.
pub trait ActionLogStore: Send + Sync {
    fn record_action(&self, entry: &ActionLogEntry) -> Result<()>;
}

/// Everything a full evaluation pass needs from storage.
pub trait MonitorStore:
    WatchedEntityRepository
    + MilestoneRepository
    + NotificationStore
    + EscalationHistoryStore
    + RuleRepository
    + TeamDirectory
    + ActionLogStore
{
}

impl<T> MonitorStore for T where
    T: WatchedEntityRepository
        + MilestoneRepository
        + NotificationStore
        + EscalationHistoryStore
        + RuleRepository
        + TeamDirectory
        + ActionLogStore
{
}
