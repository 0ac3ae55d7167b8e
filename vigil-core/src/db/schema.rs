//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that string
//! comparison orders them chronologically.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: watched entities, rules, notifications, escalation ledger
    r#"
    -- ============================================
    -- Watched data (owned by the surrounding system)
    -- ============================================

    CREATE TABLE IF NOT EXISTS projects (
        id                TEXT PRIMARY KEY,
        name              TEXT NOT NULL,
        status            TEXT NOT NULL,
        progress          REAL NOT NULL DEFAULT 0,
        budget            REAL,
        actual_cost       REAL,
        end_date          TEXT,
        contract_deadline TEXT,
        owner_id          TEXT NOT NULL,
        deleted           INTEGER NOT NULL DEFAULT 0,
        updated_at        TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status, deleted);

    CREATE TABLE IF NOT EXISTS milestones (
        id          TEXT PRIMARY KEY,
        project_id  TEXT NOT NULL REFERENCES projects(id),
        name        TEXT NOT NULL,
        description TEXT,
        due_date    TEXT NOT NULL,
        status      TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_milestones_due ON milestones(due_date, status);
    CREATE INDEX IF NOT EXISTS idx_milestones_project ON milestones(project_id);

    CREATE TABLE IF NOT EXISTS team_members (
        project_id TEXT NOT NULL,
        member_id  TEXT NOT NULL,
        name       TEXT NOT NULL,
        role       TEXT NOT NULL,
        PRIMARY KEY (project_id, member_id, role)
    );

    CREATE TABLE IF NOT EXISTS escalation_rules (
        id                TEXT PRIMARY KEY,
        project_id        TEXT NOT NULL,
        name              TEXT NOT NULL,
        description       TEXT,
        is_active         INTEGER NOT NULL DEFAULT 1,
        escalation_levels JSON NOT NULL,
        actions           JSON NOT NULL DEFAULT '[]'
    );

    CREATE INDEX IF NOT EXISTS idx_escalation_rules_project ON escalation_rules(project_id);

    -- ============================================
    -- Engine output
    -- ============================================

    CREATE TABLE IF NOT EXISTS notifications (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        recipient_id TEXT NOT NULL,
        subject_id   TEXT NOT NULL,
        subject_type TEXT NOT NULL,
        check_type   TEXT NOT NULL,
        kind         TEXT NOT NULL,
        priority     TEXT NOT NULL,
        title        TEXT NOT NULL,
        message      TEXT NOT NULL,
        link         TEXT,
        is_read      INTEGER NOT NULL DEFAULT 0,
        day          TEXT NOT NULL,
        created_at   TEXT NOT NULL
    );

    -- One record per recipient, subject and check per calendar day
    CREATE UNIQUE INDEX IF NOT EXISTS idx_notifications_dedup
        ON notifications(recipient_id, subject_id, check_type, day);
    CREATE INDEX IF NOT EXISTS idx_notifications_recipient
        ON notifications(recipient_id, created_at);

    CREATE TABLE IF NOT EXISTS escalation_history (
        id           TEXT PRIMARY KEY,
        rule_id      TEXT NOT NULL,
        milestone_id TEXT NOT NULL,
        level        TEXT NOT NULL,
        days_overdue INTEGER NOT NULL,
        created_at   TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_escalation_history_key
        ON escalation_history(rule_id, milestone_id, level, created_at);
    CREATE INDEX IF NOT EXISTS idx_escalation_history_milestone
        ON escalation_history(milestone_id, created_at);
    "#,
    // Version 2: action execution log
    r#"
    CREATE TABLE IF NOT EXISTS action_log (
        id           TEXT PRIMARY KEY,
        rule_id      TEXT NOT NULL,
        milestone_id TEXT NOT NULL,
        project_id   TEXT NOT NULL,
        action       TEXT NOT NULL,
        success      INTEGER NOT NULL,
        result       JSON,
        error        TEXT,
        executed_at  TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_action_log_milestone ON action_log(milestone_id, executed_at);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "projects",
            "milestones",
            "team_members",
            "escalation_rules",
            "notifications",
            "escalation_history",
            "action_log",
        ];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_notification_dedup_index_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let insert = r#"
            INSERT INTO notifications (recipient_id, subject_id, subject_type, check_type, kind,
                                       priority, title, message, day, created_at)
            VALUES ('u-1', 'p-1', 'project', 'budget', 'budget_exceeded', 'high', 't', 'm',
                    '2026-01-01', '2026-01-01T08:00:00.000000Z')
        "#;
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
