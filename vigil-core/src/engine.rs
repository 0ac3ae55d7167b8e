//! The evaluation pass
//!
//! One call to [`MonitorEngine::run_pass`] lists active entities, upcoming
//! milestones and overdue milestones, evaluates them, dispatches findings
//! through the dedup guard and runs the escalation ladder for every overdue
//! milestone.
//!
//! ```text
//! list_active   ─► evaluate ─► dispatch
//! list_upcoming ─► evaluate_upcoming_milestone ─► dispatch
//! list_overdue  ─► evaluate_milestone ─► dispatch
//!                                    └─► ladder (cool-down gated) ─► actions
//! ```
//!
//! All listings are read before anything is written. If any fails the pass
//! aborts with zero counts and `fatal_error` set; the next run retries from
//! scratch.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::actions::{backend_from_config, default_handlers, ActionExecutor, ExternalActions};
use crate::calendar::CalendarZone;
use crate::config::Config;
use crate::dedup::DeduplicationGuard;
use crate::dispatch::NotificationDispatcher;
use crate::error::Result;
use crate::escalation::EscalationLadder;
use crate::evaluator::ConditionEvaluator;
use crate::rules::{RuleCatalog, ThresholdSet};
use crate::sink::{self, NotificationSink};
use crate::store::MonitorStore;
use crate::types::{Finding, Milestone, WatchedEntity};

/// Cooperative cancellation signal, checked once per entity and per milestone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which half of the pass a progress callback refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStage {
    Entities,
    /// Milestones due within the warning window
    Upcoming,
    /// Overdue milestones and their escalations
    Milestones,
}

/// Summary of one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Notification records created for findings
    pub created: usize,
    /// Findings already reported today
    pub skipped: usize,
    /// Escalation notification records created
    pub escalation_notices: usize,
    /// Escalation notifications already sent to that recipient today
    pub escalation_notices_skipped: usize,
    /// Per-item failures (persistence, rule lookup)
    pub failed: usize,
    /// Records persisted whose delivery failed
    pub delivery_failures: usize,
    /// Rule levels that fired
    pub escalations: usize,
    /// Rule levels inside the cool-down window
    pub escalations_skipped: usize,
    pub actions_run: usize,
    pub actions_failed: usize,
    /// Escalation rules left out because they failed validation
    pub rules_rejected: usize,
    /// The pass stopped early on a cancellation request
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    pub duration_ms: u64,
}

impl PassReport {
    fn fatal(error: String, started: Instant) -> Self {
        Self {
            fatal_error: Some(error),
            duration_ms: started.elapsed().as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.fatal_error.is_none()
    }
}

/// Runs evaluation passes against a store.
pub struct MonitorEngine<S: MonitorStore + 'static> {
    store: Arc<S>,
    sink: Arc<dyn NotificationSink>,
    executor: ActionExecutor,
    thresholds: ThresholdSet,
    zone: CalendarZone,
    owner_recipient: String,
    cooldown_hours: i64,
}

impl<S: MonitorStore + 'static> MonitorEngine<S> {
    /// Build an engine from explicit collaborators.
    pub fn new(
        store: Arc<S>,
        sink: Arc<dyn NotificationSink>,
        backend: Arc<dyn ExternalActions>,
        config: &Config,
    ) -> Result<Self> {
        config.engine.validate()?;
        let thresholds = ThresholdSet::from_config(&config.thresholds)?;
        let zone = config.engine.calendar_zone()?;
        let owner_recipient = config.owner.recipient_id.clone();

        let mut executor = ActionExecutor::new(sink.clone(), &owner_recipient);
        executor.register_all(default_handlers(store.clone(), backend));
        executor.set_delay(Duration::from_millis(config.engine.action_delay_ms));
        executor.set_log(store.clone());

        Ok(Self {
            store,
            sink,
            executor,
            thresholds,
            zone,
            owner_recipient,
            cooldown_hours: config.engine.cooldown_hours,
        })
    }

    /// Build an engine whose sink and action backend come from the configuration.
    pub fn from_config(store: Arc<S>, config: &Config) -> Result<Self> {
        let sink: Arc<dyn NotificationSink> = Arc::from(sink::from_config(&config.sink)?);
        let backend = backend_from_config(&config.actions)?;
        Self::new(store, sink, backend, config)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run one pass at `now`.
    pub fn run_pass(&self, now: DateTime<Utc>, cancel: &CancelToken) -> PassReport {
        self.run_pass_with_progress(now, cancel, |_, _, _| {})
    }

    /// Run one pass, calling `progress(stage, done, total)` after each item.
    pub fn run_pass_with_progress<F>(
        &self,
        now: DateTime<Utc>,
        cancel: &CancelToken,
        mut progress: F,
    ) -> PassReport
    where
        F: FnMut(PassStage, usize, usize),
    {
        let started = Instant::now();
        let store = &*self.store;
        let upcoming_window = self.thresholds.upcoming_window();

        let entities = match store.list_active() {
            Ok(entities) => entities,
            Err(e) => return self.abort(format!("failed to list active entities: {}", e), started),
        };
        let milestones = match store.list_overdue(now) {
            Ok(milestones) => milestones,
            Err(e) => return self.abort(format!("failed to list overdue milestones: {}", e), started),
        };
        let upcoming = match store.list_upcoming(now, upcoming_window.warning_days) {
            Ok(upcoming) => upcoming,
            Err(e) => return self.abort(format!("failed to list upcoming milestones: {}", e), started),
        };

        tracing::info!(
            entities = entities.len(),
            milestones = milestones.len(),
            upcoming = upcoming.len(),
            zone = %self.zone,
            "Starting evaluation pass"
        );

        let catalog = RuleCatalog::new(store, self.thresholds.clone());
        let evaluator = ConditionEvaluator::new(catalog.thresholds());
        let guard = DeduplicationGuard::new(store, self.zone);
        let dispatcher = NotificationDispatcher::new(store, &*self.sink, guard);
        let ladder = EscalationLadder::new(
            store,
            store,
            &dispatcher,
            &self.executor,
            &self.owner_recipient,
            self.cooldown_hours,
        );

        let mut report = PassReport::default();

        let total = entities.len();
        for (i, entity) in entities.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            for finding in evaluator.evaluate(entity, now) {
                self.dispatch(&dispatcher, &finding, now, &mut report);
            }
            progress(PassStage::Entities, i + 1, total);
        }

        let total = upcoming.len();
        for (i, milestone) in upcoming.iter().enumerate() {
            if report.cancelled || cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if let Some(project) = self.milestone_project(milestone, &mut report) {
                let (project_name, recipient) =
                    self.milestone_audience(project.as_ref(), &milestone.project_id);
                if let Some(finding) =
                    evaluator.evaluate_upcoming_milestone(milestone, project_name, recipient, now)
                {
                    self.dispatch(&dispatcher, &finding, now, &mut report);
                }
            }
            progress(PassStage::Upcoming, i + 1, total);
        }

        let total = milestones.len();
        for (i, milestone) in milestones.iter().enumerate() {
            if report.cancelled || cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.process_overdue(
                milestone,
                &catalog,
                &evaluator,
                &dispatcher,
                &ladder,
                now,
                &mut report,
            );
            progress(PassStage::Milestones, i + 1, total);
        }

        report.rules_rejected = catalog.rejected_count();
        report.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            created = report.created,
            skipped = report.skipped,
            failed = report.failed,
            escalations = report.escalations,
            escalation_notices = report.escalation_notices,
            actions_failed = report.actions_failed,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "Evaluation pass complete"
        );
        report
    }

    /// Report an overdue milestone and run its escalation ladder.
    ///
    /// The ladder runs whether or not today's milestone record already
    /// existed; the history window alone decides whether a level fires.
    #[allow(clippy::too_many_arguments)]
    fn process_overdue(
        &self,
        milestone: &Milestone,
        catalog: &RuleCatalog<'_>,
        evaluator: &ConditionEvaluator<'_>,
        dispatcher: &NotificationDispatcher<'_>,
        ladder: &EscalationLadder<'_>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) {
        let Some(project) = self.milestone_project(milestone, report) else {
            return;
        };
        let (project_name, recipient) =
            self.milestone_audience(project.as_ref(), &milestone.project_id);

        let Some(finding) = evaluator.evaluate_milestone(milestone, project_name, recipient, now)
        else {
            return;
        };
        self.dispatch(dispatcher, &finding, now, report);

        let rules = match catalog.resolve_escalation_levels(&milestone.project_id) {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(
                    project_id = %milestone.project_id,
                    error = %e,
                    "Failed to load escalation rules"
                );
                report.failed += 1;
                return;
            }
        };
        let ladder_report = ladder.escalate(milestone, project_name, &rules, now);

        report.escalation_notices += ladder_report.notifications_created;
        report.escalation_notices_skipped += ladder_report.notifications_skipped;
        report.failed += ladder_report.notifications_failed + ladder_report.failed_rules;
        report.escalations += ladder_report.escalated.len();
        report.escalations_skipped += ladder_report.cooled_down;
        report.actions_run += ladder_report.action_results.len();
        report.actions_failed += ladder_report.actions_failed();
    }

    /// The owning project of a milestone. `None` means skip it: the lookup
    /// failed (counted) or the project is deleted.
    fn milestone_project(
        &self,
        milestone: &Milestone,
        report: &mut PassReport,
    ) -> Option<Option<WatchedEntity>> {
        match self.store.get(&milestone.project_id) {
            Ok(Some(project)) if project.deleted => None,
            Ok(project) => Some(project),
            Err(e) => {
                tracing::warn!(milestone_id = %milestone.id, error = %e, "Project lookup failed");
                report.failed += 1;
                None
            }
        }
    }

    /// Project name and recipient for a milestone finding.
    fn milestone_audience<'p>(
        &'p self,
        project: Option<&'p WatchedEntity>,
        project_id: &'p str,
    ) -> (&'p str, &'p str) {
        match project {
            Some(p) => (p.name.as_str(), p.owner_id.as_str()),
            None => (project_id, self.owner_recipient.as_str()),
        }
    }

    /// Dispatch one finding and fold the outcome into `report`.
    fn dispatch(
        &self,
        dispatcher: &NotificationDispatcher<'_>,
        finding: &Finding,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) {
        match dispatcher.dispatch(finding, now) {
            Ok(result) if result.created => {
                report.created += 1;
                if !result.delivered {
                    report.delivery_failures += 1;
                }
            }
            Ok(_) => report.skipped += 1,
            Err(e) => {
                tracing::error!(
                    subject_id = %finding.subject_id,
                    check = %finding.check_type,
                    error = %e,
                    "Failed to persist notification"
                );
                report.failed += 1;
            }
        }
    }

    fn abort(&self, error: String, started: Instant) -> PassReport {
        tracing::error!(error = %error, "Evaluation pass aborted");
        if let Err(e) = self
            .sink
            .deliver(&self.owner_recipient, "Monitoring pass failed", &error)
        {
            tracing::warn!(error = %e, "Failed to notify owner of aborted pass");
        }
        PassReport::fatal(error, started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionLogEntry, SimulatedActions};
    use crate::error::Error;
    use crate::sink::testing::RecordingSink;
    use crate::store::*;
    use crate::types::*;
    use chrono::NaiveDate;

    /// Store whose every read fails, as if the database were unreachable.
    struct Unreachable;

    fn down<T>() -> Result<T> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "database unreachable",
        )))
    }

    impl WatchedEntityRepository for Unreachable {
        fn list_active(&self) -> Result<Vec<WatchedEntity>> {
            down()
        }
        fn get(&self, _id: &str) -> Result<Option<WatchedEntity>> {
            down()
        }
        fn set_status(&self, _id: &str, _status: &EntityStatus) -> Result<()> {
            down()
        }
    }

    impl MilestoneRepository for Unreachable {
        fn list_overdue(&self, _now: DateTime<Utc>) -> Result<Vec<Milestone>> {
            down()
        }
        fn list_upcoming(&self, _now: DateTime<Utc>, _within_days: i64) -> Result<Vec<Milestone>> {
            down()
        }
    }

    impl NotificationStore for Unreachable {
        fn exists_today(&self, _: &str, _: &str, _: CheckType, _: NaiveDate) -> Result<bool> {
            down()
        }
        fn create(&self, _record: &NewNotification) -> Result<i64> {
            down()
        }
    }

    impl EscalationHistoryStore for Unreachable {
        fn exists_within_window(
            &self,
            _: &str,
            _: &str,
            _: EscalationLevel,
            _: i64,
            _: DateTime<Utc>,
        ) -> Result<bool> {
            down()
        }
        fn append(&self, _entry: &EscalationHistoryEntry) -> Result<()> {
            down()
        }
    }

    impl RuleRepository for Unreachable {
        fn rules_for(&self, _subject_id: &str) -> Result<Vec<EscalationRule>> {
            down()
        }
    }

    impl TeamDirectory for Unreachable {
        fn members_with_role(&self, _: &str, _: &str) -> Result<Vec<TeamMember>> {
            down()
        }
    }

    impl ActionLogStore for Unreachable {
        fn record_action(&self, _entry: &ActionLogEntry) -> Result<()> {
            down()
        }
    }

    #[test]
    fn test_unreachable_store_aborts_with_zero_counts() {
        let sink = Arc::new(RecordingSink::default());
        let engine = MonitorEngine::new(
            Arc::new(Unreachable),
            sink.clone(),
            Arc::new(SimulatedActions::new()),
            &Config::default(),
        )
        .unwrap();

        let report = engine.run_pass(Utc::now(), &CancelToken::new());
        assert!(!report.is_ok());
        assert_eq!(report.created, 0);
        assert_eq!(report.skipped, 0);
        assert!(report
            .fatal_error
            .as_deref()
            .unwrap()
            .contains("database unreachable"));
        // The owner channel hears about the abort
        assert_eq!(sink.recipients(), vec!["owner".to_string()]);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
