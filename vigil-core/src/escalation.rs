//! Escalation ladder for overdue milestones
//!
//! State is derived on every pass, never stored as a status field:
//!
//! - *not yet due*: the milestone is completed or its due date is in the future
//! - *due, unescalated*: no history entry for the selected level inside the cool-down window
//! - *escalated at level L*: a history entry for (rule, milestone, L) exists inside the window
//!
//! The selected level is the one with the **maximum** `days_overdue` threshold
//! that is `<=` the milestone's whole days overdue, regardless of the order the
//! levels were configured in. A milestone stays eligible every cool-down window
//! until it is completed.
//!
//! A pass that computes a lower level than one recorded earlier (for example
//! after a rule edit raised the thresholds) fires that lower level. The ladder
//! does not clamp to the highest level ever reached.

use chrono::{DateTime, Utc};

use crate::actions::{ActionContext, ActionExecutor, ActionResult};
use crate::dispatch::NotificationDispatcher;
use crate::rules::ResolvedRule;
use crate::store::{EscalationHistoryStore, TeamDirectory};
use crate::types::{
    CheckType, EscalationHistoryEntry, EscalationLevel, EscalationLevelConfig, Finding, Milestone,
    NotificationKind, SubjectType,
};

/// Pick the level to escalate to for `days_overdue` whole days.
///
/// Among levels whose threshold is satisfied (`threshold <= days_overdue`),
/// returns the one with the largest threshold. Equal thresholds resolve to the
/// higher level in the chain.
pub fn select_level(
    levels: &[EscalationLevelConfig],
    days_overdue: i64,
) -> Option<&EscalationLevelConfig> {
    levels
        .iter()
        .filter(|level| level.days_overdue <= days_overdue)
        .max_by(|a, b| {
            a.days_overdue
                .cmp(&b.days_overdue)
                .then_with(|| a.level.cmp(&b.level))
        })
}

/// Body of the escalation notification.
pub fn format_escalation_message(
    milestone: &Milestone,
    project_name: &str,
    level: &EscalationLevelConfig,
    days_overdue: i64,
) -> String {
    let mut message = format!(
        "**Overdue milestone - {} escalation**\n\n\
         **Milestone:** {}\n\
         **Project:** {}\n\
         **Due date:** {}\n\
         **Days overdue:** {} days\n\
         **Status:** {}\n\
         **Description:** {}\n",
        level.level.label(),
        milestone.name,
        project_name,
        milestone.due_date.format("%Y-%m-%d"),
        days_overdue,
        milestone.status.as_str(),
        milestone.description.as_deref().unwrap_or("N/A"),
    );

    if let Some(custom) = &level.message {
        message.push_str(&format!("\n**Custom message:** {}\n", custom));
    }

    message.push_str(
        "\n**Recommended actions:**\n\
         - Review the milestone status\n\
         - Update the team about the delay\n\
         - Take steps to recover the schedule\n\
         - Notify the client if applicable\n",
    );
    message
}

/// What the ladder did for one milestone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LadderReport {
    /// Rules that transitioned to a level on this call
    pub escalated: Vec<(String, EscalationLevel)>,
    /// Rules whose selected level was still inside the cool-down window
    pub cooled_down: usize,
    pub notifications_created: usize,
    pub notifications_skipped: usize,
    pub notifications_failed: usize,
    pub action_results: Vec<ActionResult>,
    /// Rules that could not be processed because storage failed
    pub failed_rules: usize,
}

impl LadderReport {
    pub fn actions_failed(&self) -> usize {
        self.action_results.iter().filter(|r| !r.success).count()
    }
}

pub struct EscalationLadder<'a> {
    history: &'a dyn EscalationHistoryStore,
    team: &'a dyn TeamDirectory,
    dispatcher: &'a NotificationDispatcher<'a>,
    executor: &'a ActionExecutor,
    owner_recipient: &'a str,
    window_hours: i64,
}

impl<'a> EscalationLadder<'a> {
    pub fn new(
        history: &'a dyn EscalationHistoryStore,
        team: &'a dyn TeamDirectory,
        dispatcher: &'a NotificationDispatcher<'a>,
        executor: &'a ActionExecutor,
        owner_recipient: &'a str,
        window_hours: i64,
    ) -> Self {
        Self {
            history,
            team,
            dispatcher,
            executor,
            owner_recipient,
            window_hours,
        }
    }

    /// Evaluate every rule against one milestone. Rules are independent.
    pub fn escalate(
        &self,
        milestone: &Milestone,
        project_name: &str,
        rules: &[ResolvedRule],
        now: DateTime<Utc>,
    ) -> LadderReport {
        let mut report = LadderReport::default();

        if !milestone.is_escalation_candidate(now) {
            return report;
        }
        let days_overdue = milestone.days_overdue(now);

        for rule in rules {
            let Some(level) = select_level(rule.levels(), days_overdue) else {
                continue;
            };

            let entry = EscalationHistoryEntry::new(
                rule.id(),
                &milestone.id,
                level.level,
                days_overdue,
                now,
            );
            match self.history.append_if_absent(&entry, self.window_hours) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        rule_id = rule.id(),
                        milestone_id = %milestone.id,
                        level = level.level.as_str(),
                        "Escalation inside cool-down window"
                    );
                    report.cooled_down += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        rule_id = rule.id(),
                        milestone_id = %milestone.id,
                        error = %e,
                        "Failed to record escalation"
                    );
                    report.failed_rules += 1;
                    continue;
                }
            }

            tracing::info!(
                rule_id = rule.id(),
                milestone_id = %milestone.id,
                level = level.level.as_str(),
                days_overdue,
                "Milestone escalated"
            );
            report
                .escalated
                .push((rule.id().to_string(), level.level));

            self.notify_level(milestone, project_name, level, days_overdue, now, &mut report);

            if !rule.actions.is_empty() {
                let ctx = ActionContext {
                    rule_id: rule.id().to_string(),
                    project_id: milestone.project_id.clone(),
                    project_name: project_name.to_string(),
                    milestone_id: milestone.id.clone(),
                    milestone_name: milestone.name.clone(),
                    now,
                };
                report
                    .action_results
                    .extend(self.executor.run(&rule.actions, &ctx));
            }
        }

        report
    }

    fn notify_level(
        &self,
        milestone: &Milestone,
        project_name: &str,
        level: &EscalationLevelConfig,
        days_overdue: i64,
        now: DateTime<Utc>,
        report: &mut LadderReport,
    ) {
        let message = format_escalation_message(milestone, project_name, level, days_overdue);
        let title = format!(
            "Escalation: overdue milestone {} ({} level)",
            milestone.name,
            level.level.label()
        );

        for recipient in self.resolve_targets(&milestone.project_id, level) {
            let finding = Finding {
                subject_id: milestone.id.clone(),
                subject_type: SubjectType::Milestone,
                check_type: CheckType::Escalation(level.level),
                kind: NotificationKind::Escalation,
                severity: level.level.severity(),
                title: title.clone(),
                message: message.clone(),
                recipient_id: recipient,
                link_hint: Some(format!(
                    "/projects/{}?tab=milestones&milestone={}",
                    milestone.project_id, milestone.id
                )),
            };
            match self.dispatcher.dispatch(&finding, now) {
                Ok(result) if result.created => report.notifications_created += 1,
                Ok(_) => report.notifications_skipped += 1,
                Err(e) => {
                    tracing::warn!(
                        milestone_id = %milestone.id,
                        recipient = %finding.recipient_id,
                        error = %e,
                        "Failed to persist escalation notification"
                    );
                    report.notifications_failed += 1;
                }
            }
        }
    }

    /// Recipients for a level: its own role, any extra roles, and the owner channel.
    fn resolve_targets(&self, project_id: &str, level: &EscalationLevelConfig) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        let mut roles: Vec<&str> = level.level.team_role().into_iter().collect();
        roles.extend(level.notify_roles.iter().map(String::as_str));

        for role in roles {
            if role == EscalationLevel::Owner.as_str() {
                continue;
            }
            match self.team.members_with_role(project_id, role) {
                Ok(members) => {
                    for member in members {
                        if !targets.contains(&member.member_id) {
                            targets.push(member.member_id);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(project_id, role, error = %e, "Team lookup failed");
                }
            }
        }

        // The owner channel hears about every level.
        let owner = self.owner_recipient.to_string();
        if !targets.contains(&owner) {
            targets.push(owner);
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, PauseParams};
    use crate::calendar::CalendarZone;
    use crate::dedup::DeduplicationGuard;
    use crate::error::Result;
    use crate::sink::testing::RecordingSink;
    use crate::store::NotificationStore;
    use crate::types::{EscalationRule, MilestoneStatus, NewNotification, TeamMember};
    use chrono::{Duration, NaiveDate};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Memory {
        history: Mutex<Vec<EscalationHistoryEntry>>,
        notifications: Mutex<Vec<NewNotification>>,
        team: Vec<TeamMember>,
    }

    impl EscalationHistoryStore for Memory {
        fn exists_within_window(
            &self,
            rule_id: &str,
            milestone_id: &str,
            level: EscalationLevel,
            window_hours: i64,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            let since = now - Duration::hours(window_hours);
            Ok(self.history.lock().unwrap().iter().any(|e| {
                e.rule_id == rule_id
                    && e.milestone_id == milestone_id
                    && e.level == level
                    && e.created_at > since
            }))
        }

        fn append(&self, entry: &EscalationHistoryEntry) -> Result<()> {
            self.history.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    impl TeamDirectory for Memory {
        fn members_with_role(&self, project_id: &str, role: &str) -> Result<Vec<TeamMember>> {
            Ok(self
                .team
                .iter()
                .filter(|m| m.project_id == project_id && m.role == role)
                .cloned()
                .collect())
        }
    }

    impl NotificationStore for Memory {
        fn exists_today(
            &self,
            recipient_id: &str,
            subject_id: &str,
            check_type: CheckType,
            day: NaiveDate,
        ) -> Result<bool> {
            Ok(self.notifications.lock().unwrap().iter().any(|n| {
                n.recipient_id == recipient_id
                    && n.subject_id == subject_id
                    && n.check_type == check_type
                    && n.day == day
            }))
        }

        fn create(&self, record: &NewNotification) -> Result<i64> {
            let mut notifications = self.notifications.lock().unwrap();
            notifications.push(record.clone());
            Ok(notifications.len() as i64)
        }
    }

    fn member(id: &str, role: &str) -> TeamMember {
        TeamMember {
            project_id: "p-1".to_string(),
            member_id: id.to_string(),
            name: id.to_string(),
            role: role.to_string(),
        }
    }

    fn level(level: EscalationLevel, days: i64) -> EscalationLevelConfig {
        EscalationLevelConfig {
            level,
            days_overdue: days,
            notify_roles: vec![],
            message: None,
        }
    }

    fn resolved(id: &str, levels: Vec<EscalationLevelConfig>, actions: Vec<Action>) -> ResolvedRule {
        ResolvedRule {
            rule: EscalationRule {
                id: id.to_string(),
                project_id: "p-1".to_string(),
                name: id.to_string(),
                description: None,
                is_active: true,
                escalation_levels: levels,
                actions: vec![],
            },
            actions,
        }
    }

    fn milestone(days_overdue: i64, now: DateTime<Utc>) -> Milestone {
        Milestone {
            id: "m-1".to_string(),
            project_id: "p-1".to_string(),
            name: "Structure".to_string(),
            description: None,
            due_date: now - Duration::days(days_overdue) - Duration::hours(2),
            status: MilestoneStatus::InProgress,
        }
    }

    fn standard_levels() -> Vec<EscalationLevelConfig> {
        vec![
            level(EscalationLevel::Manager, 3),
            level(EscalationLevel::Director, 7),
            level(EscalationLevel::Admin, 10),
        ]
    }

    #[test]
    fn test_select_level_takes_maximum_satisfied() {
        let levels = standard_levels();
        assert_eq!(select_level(&levels, 8).unwrap().level, EscalationLevel::Director);
        assert_eq!(select_level(&levels, 3).unwrap().level, EscalationLevel::Manager);
        assert_eq!(select_level(&levels, 42).unwrap().level, EscalationLevel::Admin);
        assert!(select_level(&levels, 2).is_none());

        // Order of configuration does not matter
        let mut reversed = standard_levels();
        reversed.reverse();
        assert_eq!(select_level(&reversed, 8).unwrap().level, EscalationLevel::Director);
    }

    #[test]
    fn test_formatted_message() {
        let now = Utc::now();
        let mut cfg = level(EscalationLevel::Admin, 10);
        cfg.message = Some("Call the client today".to_string());
        let text = format_escalation_message(&milestone(12, now), "Riverside Tower", &cfg, 12);

        assert!(text.starts_with("**Overdue milestone - Administrator escalation**"));
        assert!(text.contains("**Days overdue:** 12 days"));
        assert!(text.contains("**Description:** N/A"));
        assert!(text.contains("**Custom message:** Call the client today"));
        assert!(text.contains("Recommended actions"));
    }

    fn run_ladder(
        memory: &Memory,
        sink: Arc<RecordingSink>,
        rules: &[ResolvedRule],
        m: &Milestone,
        now: DateTime<Utc>,
    ) -> LadderReport {
        let guard = DeduplicationGuard::new(memory, CalendarZone::Local);
        let dispatcher = NotificationDispatcher::new(memory, sink.as_ref(), guard);
        let mut executor = ActionExecutor::new(sink.clone(), "owner");
        executor.set_delay(std::time::Duration::ZERO);
        let ladder = EscalationLadder::new(memory, memory, &dispatcher, &executor, "owner", 24);
        ladder.escalate(m, "Riverside Tower", rules, now)
    }

    #[test]
    fn test_escalates_to_director_and_notifies_directors() {
        let memory = Memory {
            team: vec![member("u-mgr", "manager"), member("u-dir", "director")],
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let now = Utc::now();
        let rules = vec![resolved("r-1", standard_levels(), vec![])];

        let report = run_ladder(&memory, sink.clone(), &rules, &milestone(8, now), now);

        assert_eq!(report.escalated, vec![("r-1".to_string(), EscalationLevel::Director)]);
        let history = memory.history.lock().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].level, EscalationLevel::Director);
        assert_eq!(history[0].days_overdue, 8);

        let recipients = sink.recipients();
        assert!(recipients.contains(&"u-dir".to_string()));
        assert!(recipients.contains(&"owner".to_string()));
        assert!(!recipients.contains(&"u-mgr".to_string()));
    }

    #[test]
    fn test_cool_down_writes_one_history_entry() {
        let memory = Memory::default();
        let sink = Arc::new(RecordingSink::default());
        let now = Utc::now();
        let rules = vec![resolved("r-1", standard_levels(), vec![])];
        let m = milestone(8, now);

        run_ladder(&memory, sink.clone(), &rules, &m, now);
        let second = run_ladder(&memory, sink.clone(), &rules, &m, now + Duration::hours(6));

        assert!(second.escalated.is_empty());
        assert_eq!(second.cooled_down, 1);
        assert_eq!(memory.history.lock().unwrap().len(), 1);

        // After the window the same level fires again
        let later = now + Duration::hours(25);
        let third = run_ladder(&memory, sink, &rules, &m, later);
        assert_eq!(third.escalated.len(), 1);
        assert_eq!(memory.history.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_rules_are_independent_and_run_actions() {
        let memory = Memory::default();
        let sink = Arc::new(RecordingSink::default());
        let now = Utc::now();
        let rules = vec![
            resolved("r-1", standard_levels(), vec![]),
            resolved(
                "r-2",
                vec![level(EscalationLevel::Owner, 5)],
                vec![
                    Action::Unsupported("launch_rocket".to_string()),
                    Action::PauseProject(PauseParams::default()),
                ],
            ),
        ];

        let report = run_ladder(&memory, sink, &rules, &milestone(8, now), now);

        assert_eq!(report.escalated.len(), 2);
        assert_eq!(report.action_results.len(), 2);
        // No handlers registered in this executor
        assert_eq!(report.actions_failed(), 2);
    }

    #[test]
    fn test_not_yet_due_milestone_is_ignored() {
        let memory = Memory::default();
        let sink = Arc::new(RecordingSink::default());
        let now = Utc::now();
        let rules = vec![resolved("r-1", standard_levels(), vec![])];

        let mut m = milestone(8, now);
        m.status = MilestoneStatus::Completed;
        let report = run_ladder(&memory, sink.clone(), &rules, &m, now);
        assert!(report.escalated.is_empty());

        let m = milestone(1, now);
        let report = run_ladder(&memory, sink, &rules, &m, now);
        assert!(report.escalated.is_empty());
        assert!(memory.history.lock().unwrap().is_empty());
    }
}
