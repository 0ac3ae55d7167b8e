//! Condition evaluation
//!
//! Turns a snapshot of a watched entity into the findings that currently hold.
//! Pure: no I/O, no clock reads; `now` is always passed in.
//!
//! Every percentage check matches at most one band. Bands are half-open
//! `[low, low + width)` except the last, which is open-ended, so an entity that
//! has moved past a band does not keep re-firing it. Deadline checks fire only
//! at the exact configured day counts, plus on every pass once the date has passed.

use chrono::{DateTime, Utc};

use crate::rules::{DeadlineWindow, ThresholdBand, ThresholdSet};
use crate::types::{
    CheckType, Finding, Milestone, NotificationKind, Severity, SubjectType, WatchedEntity,
};

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Whole days until `deadline`, rounded up. Negative once the deadline has passed.
pub fn days_remaining(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (deadline - now).num_milliseconds();
    let days = millis.div_euclid(MILLIS_PER_DAY);
    if millis.rem_euclid(MILLIS_PER_DAY) > 0 {
        days + 1
    } else {
        days
    }
}

/// Format a percentage or amount without a trailing `.0` for whole numbers.
fn number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.1}", value)
    }
}

fn first_matching(bands: &[ThresholdBand], value: f64) -> Option<&ThresholdBand> {
    bands.iter().find(|band| band.contains(value))
}

/// Which date field a deadline check reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineField {
    Schedule,
    Contract,
}

/// Evaluates entities against one pass's thresholds.
pub struct ConditionEvaluator<'a> {
    thresholds: &'a ThresholdSet,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(thresholds: &'a ThresholdSet) -> Self {
        Self { thresholds }
    }

    /// All findings for `entity` at `now`, at most one per check type.
    pub fn evaluate(&self, entity: &WatchedEntity, now: DateTime<Utc>) -> Vec<Finding> {
        let mut findings = Vec::with_capacity(4);

        findings.extend(self.check_progress(entity));
        if let Some(end_date) = entity.end_date {
            findings.extend(self.check_deadline(entity, DeadlineField::Schedule, end_date, now));
        }
        if let Some(deadline) = entity.contract_deadline {
            findings.extend(self.check_deadline(entity, DeadlineField::Contract, deadline, now));
        }
        findings.extend(self.check_budget(entity));

        findings
    }

    /// The overdue finding for a milestone, if it is past due and not completed.
    pub fn evaluate_milestone(
        &self,
        milestone: &Milestone,
        project_name: &str,
        recipient_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Finding> {
        if !milestone.is_escalation_candidate(now) {
            return None;
        }
        let days = milestone.days_overdue(now);

        Some(Finding {
            subject_id: milestone.id.clone(),
            subject_type: SubjectType::Milestone,
            check_type: CheckType::MilestoneOverdue,
            kind: NotificationKind::MilestoneOverdue,
            severity: Severity::Critical,
            title: format!("Milestone {} is overdue", milestone.name),
            message: format!(
                "Milestone \"{}\" of project \"{}\" was due on {} and is {} day(s) overdue.",
                milestone.name,
                project_name,
                milestone.due_date.format("%Y-%m-%d"),
                days
            ),
            recipient_id: recipient_id.to_string(),
            link_hint: Some(format!(
                "/projects/{}?tab=milestones&milestone={}",
                milestone.project_id, milestone.id
            )),
        })
    }

    /// The due-soon finding for a milestone inside the warning window.
    pub fn evaluate_upcoming_milestone(
        &self,
        milestone: &Milestone,
        project_name: &str,
        recipient_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Finding> {
        let window = self.thresholds.upcoming_window();
        if !milestone.is_upcoming(now, window.warning_days) {
            return None;
        }
        let days = days_remaining(milestone.due_date, now);
        let (severity, prefix) = if days <= window.urgent_days {
            (Severity::High, "URGENT: ")
        } else {
            (Severity::Medium, "")
        };

        Some(Finding {
            subject_id: milestone.id.clone(),
            subject_type: SubjectType::Milestone,
            check_type: CheckType::MilestoneUpcoming,
            kind: NotificationKind::MilestoneDue,
            severity,
            title: format!("{}Milestone {} due in {} day(s)", prefix, milestone.name, days),
            message: format!(
                "Milestone \"{}\" of project \"{}\" is due on {} ({} day(s)).",
                milestone.name,
                project_name,
                milestone.due_date.format("%Y-%m-%d"),
                days
            ),
            recipient_id: recipient_id.to_string(),
            link_hint: Some(format!(
                "/projects/{}?tab=milestones&milestone={}",
                milestone.project_id, milestone.id
            )),
        })
    }

    fn check_progress(&self, entity: &WatchedEntity) -> Option<Finding> {
        let bands = self.thresholds.bands(CheckType::Progress);
        let band = first_matching(bands, entity.progress)?;
        let progress = number(entity.progress);

        let (title, message) = if band.is_terminal() {
            (
                format!("Project {} completed!", entity.name),
                format!(
                    "Project \"{}\" is marked {}% complete. Consider updating its status to completed.",
                    entity.name, progress
                ),
            )
        } else {
            (
                format!(
                    "Project {} reached {}% completion ({}%)",
                    entity.name,
                    number(band.low),
                    progress
                ),
                format!(
                    "Project \"{}\" is progressing with {}% complete.",
                    entity.name, progress
                ),
            )
        };

        Some(Finding {
            subject_id: entity.id.clone(),
            subject_type: SubjectType::Project,
            check_type: CheckType::Progress,
            kind: NotificationKind::System,
            severity: band.severity,
            title,
            message,
            recipient_id: entity.owner_id.clone(),
            link_hint: Some(format!("/projects/{}", entity.id)),
        })
    }

    fn check_deadline(
        &self,
        entity: &WatchedEntity,
        field: DeadlineField,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<Finding> {
        let days = days_remaining(deadline, now);
        let date = deadline.format("%Y-%m-%d");
        let (check_type, label, link) = match field {
            DeadlineField::Schedule => (
                CheckType::Deadline,
                "Deadline",
                format!("/projects/{}", entity.id),
            ),
            DeadlineField::Contract => (
                CheckType::ContractDeadline,
                "Contract deadline",
                format!("/projects/{}?tab=contract", entity.id),
            ),
        };

        let (kind, severity, title, message) = if days < 0 {
            let overdue = days.abs();
            let title = match field {
                DeadlineField::Schedule => format!("Project {} is DELAYED", entity.name),
                DeadlineField::Contract => format!("Contract of {} EXPIRED", entity.name),
            };
            (
                NotificationKind::ProjectDelayed,
                Severity::Critical,
                title,
                format!(
                    "{} of project \"{}\" passed {} day(s) ago on {}. Progress: {}%.",
                    label,
                    entity.name,
                    overdue,
                    date,
                    number(entity.progress)
                ),
            )
        } else {
            let window: &DeadlineWindow = self
                .thresholds
                .deadline_windows()
                .iter()
                .find(|w| w.days == days)?;
            let urgent = if window.severity == Severity::Critical {
                "URGENT: "
            } else {
                ""
            };
            (
                NotificationKind::DeadlineWarning,
                window.severity,
                format!(
                    "{}{} of {} in {} days",
                    urgent, label, entity.name, window.days
                ),
                format!(
                    "{} of project \"{}\" is on {} ({} days). Current progress: {}%.",
                    label,
                    entity.name,
                    date,
                    window.days,
                    number(entity.progress)
                ),
            )
        };

        Some(Finding {
            subject_id: entity.id.clone(),
            subject_type: SubjectType::Project,
            check_type,
            kind,
            severity,
            title,
            message,
            recipient_id: entity.owner_id.clone(),
            link_hint: Some(link),
        })
    }

    fn check_budget(&self, entity: &WatchedEntity) -> Option<Finding> {
        let budget = entity.budget.filter(|b| *b != 0.0)?;
        let actual_cost = entity.actual_cost.filter(|c| *c != 0.0)?;

        let percent_used = actual_cost / budget * 100.0;
        let band = first_matching(self.thresholds.bands(CheckType::Budget), percent_used)?;
        let amounts = format!("{:.2} of {:.2}", actual_cost, budget);

        let (title, message) = if band.is_terminal() {
            (
                format!("Project {} is OVER BUDGET", entity.name),
                format!(
                    "Project \"{}\" exceeded its budget by {:.1}% ({}). Immediate action required.",
                    entity.name,
                    percent_used - 100.0,
                    amounts
                ),
            )
        } else if band.low >= 100.0 {
            (
                format!("Budget of {} EXHAUSTED", entity.name),
                format!(
                    "Project \"{}\" has used {:.1}% of its budget ({}). Urgent review required.",
                    entity.name, percent_used, amounts
                ),
            )
        } else {
            (
                format!("Budget of {} at {}%", entity.name, number(band.low)),
                format!(
                    "Project \"{}\" has used {:.1}% of its budget ({}).",
                    entity.name, percent_used, amounts
                ),
            )
        };

        Some(Finding {
            subject_id: entity.id.clone(),
            subject_type: SubjectType::Project,
            check_type: CheckType::Budget,
            kind: NotificationKind::BudgetExceeded,
            severity: band.severity,
            title,
            message,
            recipient_id: entity.owner_id.clone(),
            link_hint: Some(format!("/projects/{}?tab=financial", entity.id)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityStatus, MilestoneStatus};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap()
    }

    fn entity() -> WatchedEntity {
        WatchedEntity {
            id: "p-1".to_string(),
            name: "Riverside Tower".to_string(),
            status: EntityStatus::InProgress,
            progress: 10.0,
            budget: None,
            actual_cost: None,
            end_date: None,
            contract_deadline: None,
            owner_id: "u-owner".to_string(),
            deleted: false,
        }
    }

    fn findings_for(entity: &WatchedEntity) -> Vec<Finding> {
        let thresholds = ThresholdSet::default();
        ConditionEvaluator::new(&thresholds).evaluate(entity, now())
    }

    fn only(findings: &[Finding], check: CheckType) -> Option<&Finding> {
        let matching: Vec<_> = findings.iter().filter(|f| f.check_type == check).collect();
        assert!(matching.len() <= 1, "more than one {} finding", check);
        matching.into_iter().next()
    }

    #[test]
    fn test_days_remaining_rounds_up() {
        assert_eq!(days_remaining(now() + Duration::days(7), now()), 7);
        assert_eq!(days_remaining(now() + Duration::days(6) + Duration::hours(1), now()), 7);
        assert_eq!(days_remaining(now(), now()), 0);
        assert_eq!(days_remaining(now() - Duration::hours(1), now()), 0);
        assert_eq!(days_remaining(now() - Duration::days(1), now()), -1);
        assert_eq!(days_remaining(now() - Duration::hours(25), now()), -1);
    }

    #[test]
    fn test_progress_band_disjointness() {
        let cases = [
            (75.0, Some(Severity::Medium)),
            (79.0, Some(Severity::Medium)),
            (80.0, None),
            (90.0, Some(Severity::High)),
            (94.0, Some(Severity::High)),
            (95.0, None),
            (100.0, Some(Severity::High)),
            (74.9, None),
        ];
        for (progress, expected) in cases {
            let mut e = entity();
            e.progress = progress;
            let findings = findings_for(&e);
            let severity = only(&findings, CheckType::Progress).map(|f| f.severity);
            assert_eq!(severity, expected, "progress {}", progress);
        }
    }

    #[test]
    fn test_deadline_exactness() {
        for (offset, fires) in [(7, true), (8, false), (6, false), (14, true), (30, true), (29, false)] {
            let mut e = entity();
            e.end_date = Some(now() + Duration::days(offset));
            let findings = findings_for(&e);
            assert_eq!(
                only(&findings, CheckType::Deadline).is_some(),
                fires,
                "offset {}",
                offset
            );
        }

        let mut e = entity();
        e.end_date = Some(now() + Duration::days(7));
        let finding = findings_for(&e).remove(0);
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(finding.kind, NotificationKind::DeadlineWarning);
    }

    #[test]
    fn test_overdue_fires_at_any_magnitude() {
        for days_past in [1, 100] {
            let mut e = entity();
            e.end_date = Some(now() - Duration::days(days_past));
            e.contract_deadline = Some(now() - Duration::days(days_past));
            let findings = findings_for(&e);

            let schedule = only(&findings, CheckType::Deadline).unwrap();
            assert_eq!(schedule.severity, Severity::Critical);
            assert_eq!(schedule.kind, NotificationKind::ProjectDelayed);
            assert!(schedule.message.contains(&format!("{} day(s) ago", days_past)));

            let contract = only(&findings, CheckType::ContractDeadline).unwrap();
            assert_eq!(contract.severity, Severity::Critical);
            assert!(contract.link_hint.as_deref().unwrap().ends_with("?tab=contract"));
        }
    }

    #[test]
    fn test_missing_dates_skip_deadline_checks() {
        let findings = findings_for(&entity());
        assert!(findings.is_empty());
    }

    #[test]
    fn test_budget_bands() {
        let cases = [
            (91_000.0, Some(Severity::High)),
            (96_000.0, None),
            (100_000.0, Some(Severity::Critical)),
            (106_000.0, None),
            (115_000.0, Some(Severity::Critical)),
        ];
        for (cost, expected) in cases {
            let mut e = entity();
            e.budget = Some(100_000.0);
            e.actual_cost = Some(cost);
            let findings = findings_for(&e);
            let severity = only(&findings, CheckType::Budget).map(|f| f.severity);
            assert_eq!(severity, expected, "cost {}", cost);
        }
    }

    #[test]
    fn test_budget_overage_message_reports_excess() {
        let mut e = entity();
        e.budget = Some(100_000.0);
        e.actual_cost = Some(115_000.0);
        let findings = findings_for(&e);
        let finding = only(&findings, CheckType::Budget).unwrap();
        assert!(finding.message.contains("15.0%"), "{}", finding.message);
        assert!(!finding.message.contains("115.0%"));
    }

    #[test]
    fn test_zero_or_missing_budget_skipped() {
        for (budget, cost) in [(Some(0.0), Some(50.0)), (None, Some(50.0)), (Some(100.0), None), (Some(100.0), Some(0.0))] {
            let mut e = entity();
            e.budget = budget;
            e.actual_cost = cost;
            assert!(only(&findings_for(&e), CheckType::Budget).is_none());
        }
    }

    #[test]
    fn test_four_finding_scenario() {
        let mut e = entity();
        e.progress = 76.0;
        e.budget = Some(100_000.0);
        e.actual_cost = Some(91_000.0);
        e.end_date = Some(now() + Duration::days(7));
        e.contract_deadline = Some(now() + Duration::days(14));

        let findings = findings_for(&e);
        assert_eq!(findings.len(), 4);
        assert_eq!(only(&findings, CheckType::Progress).unwrap().severity, Severity::Medium);
        assert_eq!(only(&findings, CheckType::Budget).unwrap().severity, Severity::High);
        assert_eq!(only(&findings, CheckType::Deadline).unwrap().severity, Severity::Critical);
        assert_eq!(
            only(&findings, CheckType::ContractDeadline).unwrap().severity,
            Severity::High
        );
        assert!(findings.iter().all(|f| f.recipient_id == "u-owner"));
    }

    #[test]
    fn test_milestone_finding() {
        let thresholds = ThresholdSet::default();
        let evaluator = ConditionEvaluator::new(&thresholds);
        let mut milestone = Milestone {
            id: "m-1".to_string(),
            project_id: "p-1".to_string(),
            name: "Structure".to_string(),
            description: None,
            due_date: now() - Duration::days(8),
            status: MilestoneStatus::InProgress,
        };

        let finding = evaluator
            .evaluate_milestone(&milestone, "Riverside Tower", "u-owner", now())
            .unwrap();
        assert_eq!(finding.check_type, CheckType::MilestoneOverdue);
        assert_eq!(finding.subject_type, SubjectType::Milestone);
        assert!(finding.message.contains("8 day(s) overdue"));

        milestone.status = MilestoneStatus::Completed;
        assert!(evaluator
            .evaluate_milestone(&milestone, "Riverside Tower", "u-owner", now())
            .is_none());
    }

    #[test]
    fn test_upcoming_milestone_window() {
        let thresholds = ThresholdSet::default();
        let evaluator = ConditionEvaluator::new(&thresholds);
        let due_in = |days: i64| Milestone {
            id: "m-2".to_string(),
            project_id: "p-1".to_string(),
            name: "Roofing".to_string(),
            description: None,
            due_date: now() + Duration::days(days),
            status: MilestoneStatus::Pending,
        };
        let upcoming =
            |m: &Milestone| evaluator.evaluate_upcoming_milestone(m, "Riverside Tower", "u-owner", now());

        let week = upcoming(&due_in(7)).unwrap();
        assert_eq!(week.check_type, CheckType::MilestoneUpcoming);
        assert_eq!(week.kind, NotificationKind::MilestoneDue);
        assert_eq!(week.severity, Severity::Medium);
        assert!(week.message.contains("(7 day(s))"), "{}", week.message);

        let soon = upcoming(&due_in(3)).unwrap();
        assert_eq!(soon.severity, Severity::High);
        assert!(soon.title.starts_with("URGENT: "));

        assert!(upcoming(&due_in(8)).is_none());

        // Overdue milestones belong to the overdue check
        assert!(upcoming(&due_in(-1)).is_none());

        let mut done = due_in(2);
        done.status = MilestoneStatus::Completed;
        assert!(upcoming(&done).is_none());
    }
}
