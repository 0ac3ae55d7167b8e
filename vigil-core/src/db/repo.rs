//! Database repository layer
//!
//! Implements the collaborator traits from [`crate::store`] on SQLite, plus the
//! import and query helpers used by the CLI.

use crate::actions::ActionLogEntry;
use crate::error::{Error, Result};
use crate::store::{
    ActionLogStore, EscalationHistoryStore, MilestoneRepository, NotificationStore,
    RuleRepository, TeamDirectory, WatchedEntityRepository,
};
use crate::types::*;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Deserialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Window for "recent" escalations in [`Database::escalation_stats`].
const RECENT_ESCALATION_DAYS: i64 = 30;

/// Data loaded by `vigil import`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportBundle {
    #[serde(default)]
    pub projects: Vec<WatchedEntity>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub team: Vec<TeamMember>,
    #[serde(default)]
    pub rules: Vec<EscalationRule>,
}

/// Row counts written by an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub projects: usize,
    pub milestones: usize,
    pub team_members: usize,
    pub rules: usize,
}

/// Fixed-width UTC timestamp; lexicographic order equals chronological order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn day_str(day: &NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn conversion_error(message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(message.into()),
    )
}

fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(format!("invalid timestamp {}: {}", value, e)))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(value: &str) -> rusqlite::Result<T> {
    value.parse::<T>().map_err(conversion_error)
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Database handle (single connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, std::time::Duration::from_secs(5))
    }

    /// Open a database whose lock waits are bounded by `busy_timeout`.
    pub fn open_with_timeout(path: &Path, busy_timeout: std::time::Duration) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        conn.busy_timeout(busy_timeout)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ============================================
    // Import
    // ============================================

    /// Load projects, milestones, team members and rules in one transaction.
    ///
    /// Existing rows with the same keys are replaced.
    pub fn import(&self, bundle: &ImportBundle) -> Result<ImportSummary> {
        for project in &bundle.projects {
            project.validate()?;
        }

        let mut conn = self.connection();
        let tx = conn.transaction()?;
        let now = ts(&Utc::now());

        for project in &bundle.projects {
            tx.execute(
                r#"
                INSERT INTO projects (id, name, status, progress, budget, actual_cost, end_date,
                                      contract_deadline, owner_id, deleted, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    status = excluded.status,
                    progress = excluded.progress,
                    budget = excluded.budget,
                    actual_cost = excluded.actual_cost,
                    end_date = excluded.end_date,
                    contract_deadline = excluded.contract_deadline,
                    owner_id = excluded.owner_id,
                    deleted = excluded.deleted,
                    updated_at = excluded.updated_at
                "#,
                params![
                    project.id,
                    project.name,
                    project.status.as_str(),
                    project.progress,
                    project.budget,
                    project.actual_cost,
                    project.end_date.as_ref().map(ts),
                    project.contract_deadline.as_ref().map(ts),
                    project.owner_id,
                    project.deleted,
                    now,
                ],
            )?;
        }

        for milestone in &bundle.milestones {
            tx.execute(
                r#"
                INSERT INTO milestones (id, project_id, name, description, due_date, status)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    project_id = excluded.project_id,
                    name = excluded.name,
                    description = excluded.description,
                    due_date = excluded.due_date,
                    status = excluded.status
                "#,
                params![
                    milestone.id,
                    milestone.project_id,
                    milestone.name,
                    milestone.description,
                    ts(&milestone.due_date),
                    milestone.status.as_str(),
                ],
            )?;
        }

        for member in &bundle.team {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO team_members (project_id, member_id, name, role)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![member.project_id, member.member_id, member.name, member.role],
            )?;
        }

        for rule in &bundle.rules {
            tx.execute(
                r#"
                INSERT INTO escalation_rules (id, project_id, name, description, is_active,
                                              escalation_levels, actions)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(id) DO UPDATE SET
                    project_id = excluded.project_id,
                    name = excluded.name,
                    description = excluded.description,
                    is_active = excluded.is_active,
                    escalation_levels = excluded.escalation_levels,
                    actions = excluded.actions
                "#,
                params![
                    rule.id,
                    rule.project_id,
                    rule.name,
                    rule.description,
                    rule.is_active,
                    serde_json::to_string(&rule.escalation_levels)?,
                    serde_json::to_string(&rule.actions)?,
                ],
            )?;
        }

        tx.commit()?;

        let summary = ImportSummary {
            projects: bundle.projects.len(),
            milestones: bundle.milestones.len(),
            team_members: bundle.team.len(),
            rules: bundle.rules.len(),
        };
        tracing::info!(?summary, "Import complete");
        Ok(summary)
    }

    // ============================================
    // Project operations
    // ============================================

    fn row_to_project(row: &Row) -> rusqlite::Result<WatchedEntity> {
        let status: String = row.get("status")?;
        let end_date: Option<String> = row.get("end_date")?;
        let contract_deadline: Option<String> = row.get("contract_deadline")?;

        Ok(WatchedEntity {
            id: row.get("id")?,
            name: row.get("name")?,
            status: parse_enum(&status)?,
            progress: row.get("progress")?,
            budget: row.get("budget")?,
            actual_cost: row.get("actual_cost")?,
            end_date: end_date.as_deref().map(parse_ts).transpose()?,
            contract_deadline: contract_deadline.as_deref().map(parse_ts).transpose()?,
            owner_id: row.get("owner_id")?,
            deleted: row.get("deleted")?,
        })
    }

    // ============================================
    // Milestone operations
    // ============================================

    fn row_to_milestone(row: &Row) -> rusqlite::Result<Milestone> {
        let due_date: String = row.get("due_date")?;
        let status: String = row.get("status")?;

        Ok(Milestone {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            due_date: parse_ts(&due_date)?,
            status: parse_enum(&status)?,
        })
    }

    /// Get a milestone by ID
    pub fn get_milestone(&self, id: &str) -> Result<Option<Milestone>> {
        let conn = self.connection();
        conn.query_row(
            "SELECT * FROM milestones WHERE id = ?",
            [id],
            Self::row_to_milestone,
        )
        .optional()
        .map_err(Error::from)
    }

    // ============================================
    // Rule operations
    // ============================================

    fn row_to_rule(row: &Row) -> rusqlite::Result<EscalationRule> {
        let levels: String = row.get("escalation_levels")?;
        let actions: String = row.get("actions")?;

        Ok(EscalationRule {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            is_active: row.get("is_active")?,
            escalation_levels: serde_json::from_str(&levels)
                .map_err(|e| conversion_error(format!("invalid escalation_levels: {}", e)))?,
            actions: serde_json::from_str(&actions)
                .map_err(|e| conversion_error(format!("invalid actions: {}", e)))?,
        })
    }

    /// All escalation rules, ordered by project and id
    pub fn list_rules(&self) -> Result<Vec<EscalationRule>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("SELECT * FROM escalation_rules ORDER BY project_id, id")?;
        let rules = stmt
            .query_map([], Self::row_to_rule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    // ============================================
    // Notification operations
    // ============================================

    fn row_to_notification(row: &Row) -> rusqlite::Result<NotificationRecord> {
        let subject_type: String = row.get("subject_type")?;
        let check_type: String = row.get("check_type")?;
        let kind: String = row.get("kind")?;
        let priority: String = row.get("priority")?;
        let day: String = row.get("day")?;
        let created_at: String = row.get("created_at")?;

        Ok(NotificationRecord {
            id: row.get("id")?,
            recipient_id: row.get("recipient_id")?,
            subject_id: row.get("subject_id")?,
            subject_type: parse_enum(&subject_type)?,
            check_type: parse_enum(&check_type)?,
            kind: parse_enum(&kind)?,
            priority: parse_enum(&priority)?,
            title: row.get("title")?,
            message: row.get("message")?,
            link: row.get("link")?,
            is_read: row.get("is_read")?,
            day: NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                .map_err(|e| conversion_error(format!("invalid day {}: {}", day, e)))?,
            created_at: parse_ts(&created_at)?,
        })
    }

    /// Notifications, newest first, optionally for one recipient
    pub fn list_notifications(
        &self,
        recipient_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM notifications
            WHERE (?1 IS NULL OR recipient_id = ?1)
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let records = stmt
            .query_map(params![recipient_id, limit as i64], Self::row_to_notification)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Total notification records
    pub fn count_notifications(&self) -> Result<i64> {
        let conn = self.connection();
        let count = conn.query_row("SELECT COUNT(*) FROM notifications", [], |r| r.get(0))?;
        Ok(count)
    }

    // ============================================
    // Escalation operations
    // ============================================

    fn row_to_history(row: &Row) -> rusqlite::Result<EscalationHistoryEntry> {
        let level: String = row.get("level")?;
        let created_at: String = row.get("created_at")?;

        Ok(EscalationHistoryEntry {
            id: row.get("id")?,
            rule_id: row.get("rule_id")?,
            milestone_id: row.get("milestone_id")?,
            level: parse_enum(&level)?,
            days_overdue: row.get("days_overdue")?,
            created_at: parse_ts(&created_at)?,
        })
    }

    fn insert_history(conn: &Connection, entry: &EscalationHistoryEntry) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO escalation_history (id, rule_id, milestone_id, level, days_overdue, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.id,
                entry.rule_id,
                entry.milestone_id,
                entry.level.as_str(),
                entry.days_overdue,
                ts(&entry.created_at),
            ],
        )?;
        Ok(())
    }

    fn history_exists(
        conn: &Connection,
        rule_id: &str,
        milestone_id: &str,
        level: EscalationLevel,
        window_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let since = now - Duration::hours(window_hours);
        let exists: bool = conn.query_row(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM escalation_history
                WHERE rule_id = ?1 AND milestone_id = ?2 AND level = ?3 AND created_at > ?4
            )
            "#,
            params![rule_id, milestone_id, level.as_str(), ts(&since)],
            |r| r.get(0),
        )?;
        Ok(exists)
    }

    /// Escalation history for a milestone, newest first
    pub fn list_escalation_history(&self, milestone_id: &str) -> Result<Vec<EscalationHistoryEntry>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM escalation_history
            WHERE milestone_id = ?
            ORDER BY created_at DESC
            "#,
        )?;
        let entries = stmt
            .query_map([milestone_id], Self::row_to_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Overdue milestones and recent escalation counts for a project
    pub fn escalation_stats(&self, project_id: &str, now: DateTime<Utc>) -> Result<EscalationStats> {
        let conn = self.connection();

        let overdue_count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM milestones
            WHERE project_id = ?1 AND due_date <= ?2 AND status != 'completed'
            "#,
            params![project_id, ts(&now)],
            |r| r.get(0),
        )?;

        let since = now - Duration::days(RECENT_ESCALATION_DAYS);
        let mut stmt = conn.prepare(
            r#"
            SELECT h.level, COUNT(*) FROM escalation_history h
            JOIN milestones m ON m.id = h.milestone_id
            WHERE m.project_id = ?1 AND h.created_at >= ?2
            GROUP BY h.level
            "#,
        )?;
        let counts = stmt
            .query_map(params![project_id, ts(&since)], |row| {
                let level: String = row.get(0)?;
                Ok((parse_enum::<EscalationLevel>(&level)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let by_level: Vec<(EscalationLevel, i64)> = EscalationLevel::all()
            .into_iter()
            .map(|level| {
                let count = counts
                    .iter()
                    .find(|(l, _)| *l == level)
                    .map(|(_, c)| *c)
                    .unwrap_or(0);
                (level, count)
            })
            .collect();

        Ok(EscalationStats {
            overdue_count,
            recent_escalations: by_level.iter().map(|(_, c)| c).sum(),
            by_level,
        })
    }

    // ============================================
    // Action log operations
    // ============================================

    /// Action results recorded for a milestone, oldest first
    pub fn list_action_log(&self, milestone_id: &str) -> Result<Vec<ActionLogEntry>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT * FROM action_log WHERE milestone_id = ? ORDER BY executed_at, rowid",
        )?;
        let entries = stmt
            .query_map([milestone_id], |row| {
                let result: Option<String> = row.get("result")?;
                let executed_at: String = row.get("executed_at")?;
                Ok(ActionLogEntry {
                    id: row.get("id")?,
                    rule_id: row.get("rule_id")?,
                    milestone_id: row.get("milestone_id")?,
                    project_id: row.get("project_id")?,
                    action: row.get("action")?,
                    success: row.get("success")?,
                    result: result.and_then(|s| serde_json::from_str(&s).ok()),
                    error: row.get("error")?,
                    executed_at: parse_ts(&executed_at)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

// ============================================
// Collaborator trait implementations
// ============================================

impl WatchedEntityRepository for Database {
    fn list_active(&self) -> Result<Vec<WatchedEntity>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT * FROM projects WHERE status = 'in_progress' AND deleted = 0 ORDER BY id",
        )?;
        let projects = stmt
            .query_map([], Self::row_to_project)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    fn get(&self, id: &str) -> Result<Option<WatchedEntity>> {
        let conn = self.connection();
        conn.query_row("SELECT * FROM projects WHERE id = ?", [id], |row| {
            Self::row_to_project(row)
        })
        .optional()
        .map_err(Error::from)
    }

    fn set_status(&self, id: &str, status: &EntityStatus) -> Result<()> {
        let conn = self.connection();
        let changed = conn.execute(
            "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), ts(&Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("project {}", id)));
        }
        Ok(())
    }
}

impl MilestoneRepository for Database {
    fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Milestone>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM milestones
            WHERE due_date <= ?1 AND status != 'completed'
            ORDER BY due_date, id
            "#,
        )?;
        let milestones = stmt
            .query_map([ts(&now)], Self::row_to_milestone)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(milestones)
    }

    fn list_upcoming(&self, now: DateTime<Utc>, within_days: i64) -> Result<Vec<Milestone>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM milestones
            WHERE due_date > ?1 AND due_date <= ?2 AND status != 'completed'
            ORDER BY due_date, id
            "#,
        )?;
        let horizon = now + Duration::days(within_days);
        let milestones = stmt
            .query_map(params![ts(&now), ts(&horizon)], Self::row_to_milestone)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(milestones)
    }
}

impl NotificationStore for Database {
    fn exists_today(
        &self,
        recipient_id: &str,
        subject_id: &str,
        check_type: CheckType,
        day: NaiveDate,
    ) -> Result<bool> {
        let conn = self.connection();
        let exists: bool = conn.query_row(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM notifications
                WHERE recipient_id = ?1 AND subject_id = ?2 AND check_type = ?3 AND day = ?4
            )
            "#,
            params![recipient_id, subject_id, check_type.as_str(), day_str(&day)],
            |r| r.get(0),
        )?;
        Ok(exists)
    }

    fn create(&self, record: &NewNotification) -> Result<i64> {
        let conn = self.connection();
        let inserted = conn.execute(
            r#"
            INSERT INTO notifications (recipient_id, subject_id, subject_type, check_type, kind,
                                       priority, title, message, link, is_read, day, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)
            "#,
            params![
                record.recipient_id,
                record.subject_id,
                record.subject_type.as_str(),
                record.check_type.as_str(),
                record.kind.as_str(),
                record.priority.as_str(),
                record.title,
                record.message,
                record.link,
                day_str(&record.day),
                ts(&record.created_at),
            ],
        );

        match inserted {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_constraint_violation(&e) => Err(Error::Duplicate(format!(
                "{}/{}/{}/{}",
                record.recipient_id,
                record.subject_id,
                record.check_type,
                day_str(&record.day)
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

impl EscalationHistoryStore for Database {
    fn exists_within_window(
        &self,
        rule_id: &str,
        milestone_id: &str,
        level: EscalationLevel,
        window_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.connection();
        Self::history_exists(&conn, rule_id, milestone_id, level, window_hours, now)
    }

    fn append(&self, entry: &EscalationHistoryEntry) -> Result<()> {
        let conn = self.connection();
        Self::insert_history(&conn, entry)
    }

    /// Check and insert inside one immediate transaction.
    fn append_if_absent(&self, entry: &EscalationHistoryEntry, window_hours: i64) -> Result<bool> {
        let mut conn = self.connection();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if Self::history_exists(
            &tx,
            &entry.rule_id,
            &entry.milestone_id,
            entry.level,
            window_hours,
            entry.created_at,
        )? {
            return Ok(false);
        }
        Self::insert_history(&tx, entry)?;
        tx.commit()?;
        Ok(true)
    }
}

impl RuleRepository for Database {
    fn rules_for(&self, subject_id: &str) -> Result<Vec<EscalationRule>> {
        let conn = self.connection();
        let mut stmt =
            conn.prepare("SELECT * FROM escalation_rules WHERE project_id = ? ORDER BY id")?;
        let mut rules = Vec::new();
        let rows = stmt.query_map([subject_id], Self::row_to_rule)?;
        for row in rows {
            match row {
                Ok(rule) => rules.push(rule),
                // A row whose JSON no longer parses is a configuration error for that rule only
                Err(e) => tracing::warn!(subject_id, error = %e, "Skipping unreadable escalation rule"),
            }
        }
        Ok(rules)
    }
}

impl TeamDirectory for Database {
    fn members_with_role(&self, project_id: &str, role: &str) -> Result<Vec<TeamMember>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT project_id, member_id, name, role FROM team_members
            WHERE project_id = ?1 AND role = ?2
            ORDER BY member_id
            "#,
        )?;
        let members = stmt
            .query_map(params![project_id, role], |row| {
                Ok(TeamMember {
                    project_id: row.get(0)?,
                    member_id: row.get(1)?,
                    name: row.get(2)?,
                    role: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }
}

impl ActionLogStore for Database {
    fn record_action(&self, entry: &ActionLogEntry) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO action_log (id, rule_id, milestone_id, project_id, action, success,
                                    result, error, executed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                entry.id,
                entry.rule_id,
                entry.milestone_id,
                entry.project_id,
                entry.action,
                entry.success,
                entry.result.as_ref().map(|v| v.to_string()),
                entry.error,
                ts(&entry.executed_at),
            ],
        )?;
        Ok(())
    }
}
