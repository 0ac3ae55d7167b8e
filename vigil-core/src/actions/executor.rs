//! Sequential action execution with per-action failure isolation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::handlers::ActionHandler;
use super::{Action, ActionContext, ActionKind, ActionLogEntry, ActionResult, UNSUPPORTED_ACTION};
use crate::sink::NotificationSink;
use crate::store::ActionLogStore;

/// Runs a rule's actions one after another.
///
/// A failing action is recorded as `{success: false, error}` and the remaining
/// actions still run. A fixed delay separates consecutive actions.
pub struct ActionExecutor {
    handlers: HashMap<ActionKind, Box<dyn ActionHandler>>,
    sink: Arc<dyn NotificationSink>,
    owner_recipient: String,
    delay: Duration,
    log: Option<Arc<dyn ActionLogStore>>,
}

impl ActionExecutor {
    /// Create an executor with no handlers registered.
    pub fn new(sink: Arc<dyn NotificationSink>, owner_recipient: &str) -> Self {
        Self {
            handlers: HashMap::new(),
            sink,
            owner_recipient: owner_recipient.to_string(),
            delay: Duration::from_millis(500),
            log: None,
        }
    }

    /// Register a handler. Replaces any earlier handler for the same kind.
    pub fn register(&mut self, handler: Box<dyn ActionHandler>) {
        tracing::debug!(kind = handler.kind().as_str(), "Registered action handler");
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn register_all(&mut self, handlers: Vec<Box<dyn ActionHandler>>) {
        for handler in handlers {
            self.register(handler);
        }
    }

    /// Set the pause between consecutive actions.
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    /// Append every result to an action log.
    pub fn set_log(&mut self, log: Arc<dyn ActionLogStore>) {
        self.log = Some(log);
    }

    /// Run `actions` in order and return one result per action.
    pub fn run(&self, actions: &[Action], ctx: &ActionContext) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());

        for (i, action) in actions.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }

            let result = self.run_one(action, ctx);
            self.record(ctx, &result);
            results.push(result);
        }

        results
    }

    fn run_one(&self, action: &Action, ctx: &ActionContext) -> ActionResult {
        let name = action.type_name();

        let Some(kind) = action.kind() else {
            tracing::warn!(action = name, rule_id = %ctx.rule_id, "Unsupported action type");
            return ActionResult::failed(name, UNSUPPORTED_ACTION);
        };

        let Some(handler) = self.handlers.get(&kind) else {
            tracing::warn!(action = name, "No handler registered for action kind");
            return ActionResult::failed(name, format!("no handler registered for {}", kind));
        };

        let start = Instant::now();
        match handler.execute(action, ctx) {
            Ok(outcome) => {
                tracing::info!(
                    action = name,
                    rule_id = %ctx.rule_id,
                    milestone_id = %ctx.milestone_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Action completed"
                );
                if let Some((title, body)) = &outcome.owner_notice {
                    if let Err(e) = self.sink.deliver(&self.owner_recipient, title, body) {
                        tracing::warn!(action = name, error = %e, "Owner notice failed");
                    }
                }
                ActionResult::ok(name, outcome.result)
            }
            Err(e) => {
                tracing::warn!(
                    action = name,
                    rule_id = %ctx.rule_id,
                    milestone_id = %ctx.milestone_id,
                    error = %e,
                    "Action failed"
                );
                ActionResult::failed(name, e.to_string())
            }
        }
    }

    fn record(&self, ctx: &ActionContext, result: &ActionResult) {
        if let Some(log) = &self.log {
            let entry = ActionLogEntry::from_result(ctx, result, ctx.now);
            if let Err(e) = log.record_action(&entry) {
                tracing::warn!(error = %e, "Failed to record action result");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{
        ActionOutcome, ExternalActionHandler, PauseParams, SimulatedActions, StakeholderParams,
    };
    use crate::error::{Error, Result};
    use crate::sink::testing::RecordingSink;
    use chrono::Utc;
    use std::sync::Mutex;

    struct FailingPause;

    impl ActionHandler for FailingPause {
        fn kind(&self) -> ActionKind {
            ActionKind::PauseProject
        }

        fn execute(&self, _action: &Action, _ctx: &ActionContext) -> Result<ActionOutcome> {
            Err(Error::Action("project store offline".to_string()))
        }
    }

    #[derive(Default)]
    struct MemoryLog {
        entries: Mutex<Vec<ActionLogEntry>>,
    }

    impl ActionLogStore for MemoryLog {
        fn record_action(&self, entry: &ActionLogEntry) -> Result<()> {
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    fn ctx() -> ActionContext {
        ActionContext {
            rule_id: "r-1".to_string(),
            project_id: "p-1".to_string(),
            project_name: "Riverside Tower".to_string(),
            milestone_id: "m-1".to_string(),
            milestone_name: "Structure".to_string(),
            now: Utc::now(),
        }
    }

    fn executor(sink: Arc<RecordingSink>) -> ActionExecutor {
        let mut executor = ActionExecutor::new(sink, "owner");
        executor.set_delay(Duration::ZERO);
        executor.register(Box::new(FailingPause));
        executor.register(Box::new(ExternalActionHandler::new(
            ActionKind::NotifyStakeholders,
            Arc::new(SimulatedActions::new()),
        )));
        executor
    }

    #[test]
    fn test_failure_does_not_abort_remaining_actions() {
        let sink = Arc::new(RecordingSink::default());
        let executor = executor(sink.clone());

        let results = executor.run(
            &[
                Action::PauseProject(PauseParams::default()),
                Action::NotifyStakeholders(StakeholderParams::default()),
            ],
            &ctx(),
        );

        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some("action error: project store offline"));
        assert!(results[1].success);
        assert_eq!(results[1].action, "notify_stakeholders");

        // Only the successful action notifies the owner
        assert_eq!(sink.recipients(), vec!["owner".to_string()]);
    }

    #[test]
    fn test_unsupported_action_reports_failure() {
        let executor = executor(Arc::new(RecordingSink::default()));
        let results = executor.run(&[Action::Unsupported("launch_rocket".to_string())], &ctx());

        assert_eq!(
            results,
            vec![ActionResult::failed("launch_rocket", UNSUPPORTED_ACTION)]
        );
    }

    #[test]
    fn test_missing_handler_reports_failure() {
        let executor = executor(Arc::new(RecordingSink::default()));
        let results = executor.run(
            &[Action::UpdateProjectStatus(Default::default())],
            &ctx(),
        );
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("no handler"));
    }

    #[test]
    fn test_owner_notice_failure_keeps_success() {
        let executor = executor(Arc::new(RecordingSink::failing()));
        let results = executor.run(
            &[Action::NotifyStakeholders(StakeholderParams::default())],
            &ctx(),
        );
        assert!(results[0].success);
    }

    #[test]
    fn test_results_are_logged() {
        let log = Arc::new(MemoryLog::default());
        let mut executor = executor(Arc::new(RecordingSink::default()));
        executor.set_log(log.clone());

        executor.run(
            &[
                Action::PauseProject(PauseParams::default()),
                Action::Unsupported("x".to_string()),
            ],
            &ctx(),
        );

        let entries = log.entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "pause_project");
        assert!(!entries[1].success);
        assert_eq!(entries[0].rule_id, "r-1");
    }
}
