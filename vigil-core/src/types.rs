//! Core domain types for vigil
//!
//! These types describe what the engine watches and what it produces.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **WatchedEntity** | A business object (a project) whose progress, budget and deadlines are evaluated |
//! | **Milestone** | A dated sub-entity of a project; overdue milestones feed the escalation ladder |
//! | **Finding** | A condition that currently holds, produced fresh on every pass |
//! | **NotificationRecord** | A persisted finding, created at most once per recipient/subject/check per day |
//! | **EscalationRule** | Ordered levels (manager, director, admin, owner) gated by days overdue |
//! | **EscalationHistoryEntry** | Append-only ledger row written when a level fires |
//!
//! The engine only reads entities. The single exception is a configured action
//! (`pause_project`, `update_project_status`) writing the status field back.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::actions::ActionConfig;
use crate::error::{Error, Result};

// ============================================
// Watched entities
// ============================================

/// Lifecycle status of a watched entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Planning,
    InProgress,
    OnHold,
    Paused,
    AtRisk,
    Completed,
    /// Any status written by the surrounding system that we do not model
    #[serde(untagged)]
    Other(String),
}

impl EntityStatus {
    pub fn as_str(&self) -> &str {
        match self {
            EntityStatus::Planning => "planning",
            EntityStatus::InProgress => "in_progress",
            EntityStatus::OnHold => "on_hold",
            EntityStatus::Paused => "paused",
            EntityStatus::AtRisk => "at_risk",
            EntityStatus::Completed => "completed",
            EntityStatus::Other(s) => s,
        }
    }

    /// Only in-progress entities are eligible for monitoring.
    pub fn is_active(&self) -> bool {
        matches!(self, EntityStatus::InProgress)
    }
}

impl std::str::FromStr for EntityStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "planning" => EntityStatus::Planning,
            "in_progress" => EntityStatus::InProgress,
            "on_hold" => EntityStatus::OnHold,
            "paused" => EntityStatus::Paused,
            "at_risk" => EntityStatus::AtRisk,
            "completed" => EntityStatus::Completed,
            other => EntityStatus::Other(other.to_string()),
        })
    }
}

/// The business object being monitored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedEntity {
    /// Unique identifier
    pub id: String,
    /// Display name used in titles and messages
    pub name: String,
    /// Lifecycle status
    pub status: EntityStatus,
    /// Completion percentage in `[0, 100]`
    pub progress: f64,
    /// Planned budget (monetary), if tracked
    #[serde(default)]
    pub budget: Option<f64>,
    /// Cost incurred so far, if tracked
    #[serde(default)]
    pub actual_cost: Option<f64>,
    /// Scheduled end date
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Contractual deadline
    #[serde(default)]
    pub contract_deadline: Option<DateTime<Utc>>,
    /// Owner / responsible person, recipient of generic findings
    pub owner_id: String,
    /// Soft-delete marker
    #[serde(default)]
    pub deleted: bool,
}

impl WatchedEntity {
    /// Check the numeric invariants: progress in `[0, 100]`, budget non-negative.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.progress) {
            return Err(Error::Config(format!(
                "entity {}: progress {} outside [0, 100]",
                self.id, self.progress
            )));
        }
        if let Some(budget) = self.budget {
            if budget < 0.0 {
                return Err(Error::Config(format!(
                    "entity {}: negative budget {}",
                    self.id, budget
                )));
            }
        }
        Ok(())
    }
}

// ============================================
// Milestones and teams
// ============================================

/// Status of a milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Overdue,
    Completed,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::InProgress => "in_progress",
            MilestoneStatus::Overdue => "overdue",
            MilestoneStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for MilestoneStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MilestoneStatus::Pending),
            "in_progress" => Ok(MilestoneStatus::InProgress),
            "overdue" => Ok(MilestoneStatus::Overdue),
            "completed" => Ok(MilestoneStatus::Completed),
            _ => Err(format!("unknown milestone status: {}", s)),
        }
    }
}

/// A dated sub-entity of a watched entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    /// Owning watched entity
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub due_date: DateTime<Utc>,
    pub status: MilestoneStatus,
}

impl Milestone {
    /// Whole days elapsed since the due date, rounded down.
    ///
    /// Negative when the due date is still in the future.
    pub fn days_overdue(&self, now: DateTime<Utc>) -> i64 {
        (now - self.due_date).num_seconds().div_euclid(SECONDS_PER_DAY)
    }

    /// Escalation candidates are not completed and past due.
    pub fn is_escalation_candidate(&self, now: DateTime<Utc>) -> bool {
        self.status != MilestoneStatus::Completed && self.due_date <= now
    }

    /// Not completed and due after `now` but within `within_days`.
    pub fn is_upcoming(&self, now: DateTime<Utc>, within_days: i64) -> bool {
        self.status != MilestoneStatus::Completed
            && self.due_date > now
            && self.due_date <= now + chrono::Duration::days(within_days)
    }
}

/// A project team member, used to resolve escalation recipients by role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub project_id: String,
    pub member_id: String,
    pub name: String,
    /// Role name, e.g. "manager", "director", "admin"
    pub role: String,
}

pub(crate) const SECONDS_PER_DAY: i64 = 86_400;

// ============================================
// Findings
// ============================================

/// What kind of subject a finding is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Project,
    Milestone,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Project => "project",
            SubjectType::Milestone => "milestone",
        }
    }
}

impl std::str::FromStr for SubjectType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "project" => Ok(SubjectType::Project),
            "milestone" => Ok(SubjectType::Milestone),
            _ => Err(format!("unknown subject type: {}", s)),
        }
    }
}

/// The check that produced a finding. Part of the daily dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckType {
    Progress,
    Deadline,
    ContractDeadline,
    Budget,
    /// Milestone due within the warning window
    MilestoneUpcoming,
    MilestoneOverdue,
    /// Notification sent to one recipient of an escalation level
    Escalation(EscalationLevel),
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Progress => "progress",
            CheckType::Deadline => "deadline",
            CheckType::ContractDeadline => "contract_deadline",
            CheckType::Budget => "budget",
            CheckType::MilestoneUpcoming => "milestone_upcoming",
            CheckType::MilestoneOverdue => "milestone_overdue",
            CheckType::Escalation(EscalationLevel::Manager) => "escalation.manager",
            CheckType::Escalation(EscalationLevel::Director) => "escalation.director",
            CheckType::Escalation(EscalationLevel::Admin) => "escalation.admin",
            CheckType::Escalation(EscalationLevel::Owner) => "escalation.owner",
        }
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "progress" => Ok(CheckType::Progress),
            "deadline" => Ok(CheckType::Deadline),
            "contract_deadline" => Ok(CheckType::ContractDeadline),
            "budget" => Ok(CheckType::Budget),
            "milestone_upcoming" => Ok(CheckType::MilestoneUpcoming),
            "milestone_overdue" => Ok(CheckType::MilestoneOverdue),
            other => match other.strip_prefix("escalation.") {
                Some(level) => level.parse().map(CheckType::Escalation),
                None => Err(format!("unknown check type: {}", s)),
            },
        }
    }
}

/// Notification category stored with the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    System,
    DeadlineWarning,
    ProjectDelayed,
    BudgetExceeded,
    MilestoneDue,
    MilestoneOverdue,
    Escalation,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::System => "system",
            NotificationKind::DeadlineWarning => "deadline_warning",
            NotificationKind::ProjectDelayed => "project_delayed",
            NotificationKind::BudgetExceeded => "budget_exceeded",
            NotificationKind::MilestoneDue => "milestone_due",
            NotificationKind::MilestoneOverdue => "milestone_overdue",
            NotificationKind::Escalation => "escalation",
        }
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(NotificationKind::System),
            "deadline_warning" => Ok(NotificationKind::DeadlineWarning),
            "project_delayed" => Ok(NotificationKind::ProjectDelayed),
            "budget_exceeded" => Ok(NotificationKind::BudgetExceeded),
            "milestone_due" => Ok(NotificationKind::MilestoneDue),
            "milestone_overdue" => Ok(NotificationKind::MilestoneOverdue),
            "escalation" => Ok(NotificationKind::Escalation),
            _ => Err(format!("unknown notification kind: {}", s)),
        }
    }
}

/// Severity of a finding, persisted as the notification priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {}", s)),
        }
    }
}

/// A condition detected during one evaluation pass. Never persisted directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub subject_id: String,
    pub subject_type: SubjectType,
    pub check_type: CheckType,
    pub kind: NotificationKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub recipient_id: String,
    /// Relative link into the surrounding UI
    pub link_hint: Option<String>,
}

// ============================================
// Notifications
// ============================================

/// A notification about to be persisted.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient_id: String,
    pub subject_id: String,
    pub subject_type: SubjectType,
    pub check_type: CheckType,
    pub kind: NotificationKind,
    pub priority: Severity,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    /// Local calendar day the record belongs to (dedup window)
    pub day: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl NewNotification {
    pub fn from_finding(finding: &Finding, day: NaiveDate, created_at: DateTime<Utc>) -> Self {
        Self {
            recipient_id: finding.recipient_id.clone(),
            subject_id: finding.subject_id.clone(),
            subject_type: finding.subject_type,
            check_type: finding.check_type,
            kind: finding.kind,
            priority: finding.severity,
            title: finding.title.clone(),
            message: finding.message.clone(),
            link: finding.link_hint.clone(),
            day,
            created_at,
        }
    }
}

/// A persisted notification.
///
/// The read flag is owned by the UI; the engine never mutates a record after creation.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub id: i64,
    pub recipient_id: String,
    pub subject_id: String,
    pub subject_type: SubjectType,
    pub check_type: CheckType,
    pub kind: NotificationKind,
    pub priority: Severity,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub is_read: bool,
    pub day: NaiveDate,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Escalation
// ============================================

/// One rung of the escalation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    Manager,
    Director,
    Admin,
    Owner,
}

impl EscalationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationLevel::Manager => "manager",
            EscalationLevel::Director => "director",
            EscalationLevel::Admin => "admin",
            EscalationLevel::Owner => "owner",
        }
    }

    /// Human-readable label used in escalation messages.
    pub fn label(&self) -> &'static str {
        match self {
            EscalationLevel::Manager => "Manager",
            EscalationLevel::Director => "Director",
            EscalationLevel::Admin => "Administrator",
            EscalationLevel::Owner => "Owner",
        }
    }

    /// Team role resolved for this level. `Owner` maps to the owner channel instead.
    pub fn team_role(&self) -> Option<&'static str> {
        match self {
            EscalationLevel::Manager => Some("manager"),
            EscalationLevel::Director => Some("director"),
            EscalationLevel::Admin => Some("admin"),
            EscalationLevel::Owner => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            EscalationLevel::Manager => Severity::High,
            _ => Severity::Critical,
        }
    }

    pub fn all() -> [EscalationLevel; 4] {
        [
            EscalationLevel::Manager,
            EscalationLevel::Director,
            EscalationLevel::Admin,
            EscalationLevel::Owner,
        ]
    }
}

impl std::str::FromStr for EscalationLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manager" => Ok(EscalationLevel::Manager),
            "director" => Ok(EscalationLevel::Director),
            "admin" => Ok(EscalationLevel::Admin),
            "owner" => Ok(EscalationLevel::Owner),
            _ => Err(format!("unknown escalation level: {}", s)),
        }
    }
}

/// Configuration of a single escalation level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationLevelConfig {
    pub level: EscalationLevel,
    /// Days overdue at which this level fires
    pub days_overdue: i64,
    /// Extra team roles notified alongside the level's own role
    #[serde(default)]
    pub notify_roles: Vec<String>,
    /// Custom message appended to the escalation body
    #[serde(default)]
    pub message: Option<String>,
}

/// Escalation rule as stored. Validated by the rule catalog before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub escalation_levels: Vec<EscalationLevelConfig>,
    /// Side-effecting actions fired whenever a level of this rule escalates
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

fn default_true() -> bool {
    true
}

/// Append-only ledger entry written when a level fires.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationHistoryEntry {
    pub id: String,
    pub rule_id: String,
    pub milestone_id: String,
    pub level: EscalationLevel,
    pub days_overdue: i64,
    pub created_at: DateTime<Utc>,
}

impl EscalationHistoryEntry {
    pub fn new(
        rule_id: &str,
        milestone_id: &str,
        level: EscalationLevel,
        days_overdue: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("esc_{}", uuid::Uuid::new_v4().simple()),
            rule_id: rule_id.to_string(),
            milestone_id: milestone_id.to_string(),
            level,
            days_overdue,
            created_at,
        }
    }
}

/// Escalation counts for a project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscalationStats {
    /// Milestones of the project that are past due and not completed
    pub overdue_count: i64,
    /// Escalations recorded in the last 30 days
    pub recent_escalations: i64,
    /// Breakdown of recent escalations by level
    pub by_level: Vec<(EscalationLevel, i64)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn milestone(due_date: DateTime<Utc>, status: MilestoneStatus) -> Milestone {
        Milestone {
            id: "m-1".to_string(),
            project_id: "p-1".to_string(),
            name: "Foundations".to_string(),
            description: None,
            due_date,
            status,
        }
    }

    #[test]
    fn test_days_overdue_rounds_down() {
        let now = Utc::now();
        let m = milestone(now - Duration::hours(8 * 24 + 23), MilestoneStatus::InProgress);
        assert_eq!(m.days_overdue(now), 8);

        let m = milestone(now - Duration::hours(5), MilestoneStatus::InProgress);
        assert_eq!(m.days_overdue(now), 0);
    }

    #[test]
    fn test_completed_milestone_is_not_candidate() {
        let now = Utc::now();
        let m = milestone(now - Duration::days(3), MilestoneStatus::Completed);
        assert!(!m.is_escalation_candidate(now));

        let m = milestone(now + Duration::days(3), MilestoneStatus::Pending);
        assert!(!m.is_escalation_candidate(now));

        let m = milestone(now - Duration::days(3), MilestoneStatus::Pending);
        assert!(m.is_escalation_candidate(now));
    }

    #[test]
    fn test_upcoming_window() {
        let now = Utc::now();
        assert!(milestone(now + Duration::days(7), MilestoneStatus::Pending).is_upcoming(now, 7));
        assert!(!milestone(now + Duration::days(8), MilestoneStatus::Pending).is_upcoming(now, 7));
        assert!(!milestone(now - Duration::hours(1), MilestoneStatus::Pending).is_upcoming(now, 7));
        assert!(!milestone(now + Duration::days(2), MilestoneStatus::Completed).is_upcoming(now, 7));
    }

    #[test]
    fn test_check_type_roundtrip_names() {
        for check in [
            CheckType::Progress,
            CheckType::ContractDeadline,
            CheckType::MilestoneUpcoming,
            CheckType::Escalation(EscalationLevel::Director),
        ] {
            assert_eq!(check.as_str().parse::<CheckType>().unwrap(), check);
        }
        assert!("escalation.ceo".parse::<CheckType>().is_err());
    }

    #[test]
    fn test_entity_validation() {
        let mut entity = WatchedEntity {
            id: "p-1".to_string(),
            name: "Tower".to_string(),
            status: EntityStatus::InProgress,
            progress: 50.0,
            budget: Some(1000.0),
            actual_cost: None,
            end_date: None,
            contract_deadline: None,
            owner_id: "u-1".to_string(),
            deleted: false,
        };
        assert!(entity.validate().is_ok());

        entity.progress = 120.0;
        assert!(entity.validate().is_err());

        entity.progress = 10.0;
        entity.budget = Some(-1.0);
        assert!(entity.validate().is_err());
    }

    #[test]
    fn test_unknown_status_is_preserved() {
        let status: EntityStatus = "archived".parse().unwrap();
        assert_eq!(status, EntityStatus::Other("archived".to_string()));
        assert_eq!(status.as_str(), "archived");
        assert!(!status.is_active());
    }
}
