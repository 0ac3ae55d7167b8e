//! Action handlers and external action backends

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};

use super::{Action, ActionContext, ActionKind};
use crate::config::{ActionBackendKind, ActionsConfig};
use crate::error::{Error, Result};
use crate::http::JsonPoster;
use crate::store::WatchedEntityRepository;
use crate::types::EntityStatus;

/// What a handler produced on success.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    /// Structured result returned to the caller
    pub result: Value,
    /// Title and body of the owner notice sent after success
    pub owner_notice: Option<(String, String)>,
}

/// Executes one kind of action.
pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> ActionKind;

    fn execute(&self, action: &Action, ctx: &ActionContext) -> Result<ActionOutcome>;
}

fn mismatch(expected: ActionKind, action: &Action) -> Error {
    Error::Action(format!(
        "{} handler cannot run {}",
        expected,
        action.type_name()
    ))
}

// ============================================
// Status writes
// ============================================

/// Writes the watched entity's status (`pause_project`, `update_project_status`).
pub struct StatusWriteHandler {
    kind: ActionKind,
    entities: Arc<dyn WatchedEntityRepository>,
}

impl StatusWriteHandler {
    pub fn pause(entities: Arc<dyn WatchedEntityRepository>) -> Self {
        Self {
            kind: ActionKind::PauseProject,
            entities,
        }
    }

    pub fn update_status(entities: Arc<dyn WatchedEntityRepository>) -> Self {
        Self {
            kind: ActionKind::UpdateProjectStatus,
            entities,
        }
    }
}

impl ActionHandler for StatusWriteHandler {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    fn execute(&self, action: &Action, ctx: &ActionContext) -> Result<ActionOutcome> {
        let (status, reason) = match (self.kind, action) {
            (ActionKind::PauseProject, Action::PauseProject(params)) => {
                (EntityStatus::Paused, params.reason.clone())
            }
            (ActionKind::UpdateProjectStatus, Action::UpdateProjectStatus(params)) => {
                (params.new_status.clone(), None)
            }
            _ => return Err(mismatch(self.kind, action)),
        };

        self.entities.set_status(&ctx.project_id, &status)?;

        tracing::info!(
            project_id = %ctx.project_id,
            status = status.as_str(),
            action = self.kind.as_str(),
            "Project status written by escalation action"
        );

        let notice = match self.kind {
            ActionKind::PauseProject => (
                "Project paused automatically".to_string(),
                format!(
                    "Project {} was paused because milestone {} is overdue. Review it and resume when appropriate.",
                    ctx.project_name, ctx.milestone_name
                ),
            ),
            _ => (
                "Project status updated".to_string(),
                format!(
                    "Status of project {} was set to {}",
                    ctx.project_name,
                    status.as_str()
                ),
            ),
        };

        Ok(ActionOutcome {
            result: json!({
                "action": self.kind.as_str(),
                "project_id": ctx.project_id,
                "new_status": status.as_str(),
                "reason": reason,
                "timestamp": ctx.now.to_rfc3339(),
            }),
            owner_notice: Some(notice),
        })
    }
}

// ============================================
// External backends
// ============================================

/// Where ticket, meeting, email and stakeholder actions are sent.
pub trait ExternalActions: Send + Sync {
    fn name(&self) -> &str;

    /// Submit an action payload. Returns the backend's reference data.
    fn submit(&self, kind: ActionKind, payload: &Value) -> Result<Value>;
}

/// Backend that records submissions and returns generated identifiers.
#[derive(Default)]
pub struct SimulatedActions {
    submissions: Mutex<Vec<(ActionKind, Value)>>,
}

impl SimulatedActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything submitted so far, in order.
    pub fn submissions(&self) -> Vec<(ActionKind, Value)> {
        self.submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn reference_prefix(kind: ActionKind) -> &'static str {
        match kind {
            ActionKind::CreateSupportTicket => "TICKET",
            ActionKind::ScheduleReviewMeeting => "MEETING",
            ActionKind::SendEmail => "EMAIL",
            ActionKind::NotifyStakeholders => "NOTICE",
            ActionKind::PauseProject | ActionKind::UpdateProjectStatus => "ACTION",
        }
    }
}

impl ExternalActions for SimulatedActions {
    fn name(&self) -> &str {
        "simulated"
    }

    fn submit(&self, kind: ActionKind, payload: &Value) -> Result<Value> {
        let id = format!(
            "{}-{}",
            Self::reference_prefix(kind),
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );
        tracing::info!(action = kind.as_str(), reference = %id, "Simulated external action");
        self.submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((kind, payload.clone()));
        Ok(json!({ "id": id, "simulated": true }))
    }
}

#[derive(Serialize)]
struct ActionRequest<'a> {
    action: &'a str,
    payload: &'a Value,
}

/// Backend that POSTs each action to an integration endpoint.
pub struct WebhookActions {
    poster: JsonPoster,
}

impl WebhookActions {
    pub fn new(url: &str, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            poster: JsonPoster::new(url, None, timeout_secs)?,
        })
    }
}

impl ExternalActions for WebhookActions {
    fn name(&self) -> &str {
        "webhook"
    }

    fn submit(&self, kind: ActionKind, payload: &Value) -> Result<Value> {
        let response = self
            .poster
            .post(&ActionRequest {
                action: kind.as_str(),
                payload,
            })
            .map_err(|e| Error::Action(format!("{} backend call failed: {}", kind, e)))?;
        Ok(match response {
            Value::Null => json!({}),
            other => other,
        })
    }
}

/// Build the backend described by the configuration.
pub fn backend_from_config(config: &ActionsConfig) -> Result<Arc<dyn ExternalActions>> {
    config.validate()?;
    match config.backend {
        ActionBackendKind::Simulated => Ok(Arc::new(SimulatedActions::new())),
        ActionBackendKind::Webhook => {
            let url = config.webhook_url.as_deref().unwrap_or_default();
            Ok(Arc::new(WebhookActions::new(url, config.timeout_secs)?))
        }
    }
}

// ============================================
// External handler
// ============================================

/// Builds the payload for an external kind and hands it to the backend.
pub struct ExternalActionHandler {
    kind: ActionKind,
    backend: Arc<dyn ExternalActions>,
}

impl ExternalActionHandler {
    pub fn new(kind: ActionKind, backend: Arc<dyn ExternalActions>) -> Self {
        Self { kind, backend }
    }

    fn payload(&self, action: &Action, ctx: &ActionContext) -> Result<Value> {
        let payload = match (self.kind, action) {
            (ActionKind::CreateSupportTicket, Action::CreateSupportTicket(p)) => json!({
                "title": p.title.clone().unwrap_or_else(|| format!("Overdue milestone: {}", ctx.milestone_name)),
                "description": p.description.clone().unwrap_or_else(|| format!(
                    "Milestone {} of project {} is overdue. Action required.",
                    ctx.milestone_name, ctx.project_name
                )),
                "priority": p.priority,
                "assignee": p.assignee,
                "project_id": ctx.project_id,
                "milestone_id": ctx.milestone_id,
                "created_at": ctx.now.to_rfc3339(),
            }),
            (ActionKind::ScheduleReviewMeeting, Action::ScheduleReviewMeeting(p)) => {
                let scheduled = ctx.now + chrono::Duration::hours(p.hours_from_now);
                json!({
                    "title": p.title.clone().unwrap_or_else(|| format!("Overdue milestone review: {}", ctx.milestone_name)),
                    "description": p.description.clone().unwrap_or_else(|| format!(
                        "Review meeting for the overdue milestone of project {}",
                        ctx.project_name
                    )),
                    "scheduled_time": scheduled.to_rfc3339(),
                    "duration_minutes": p.duration_minutes,
                    "attendees": p.attendees,
                    "project_id": ctx.project_id,
                    "milestone_id": ctx.milestone_id,
                })
            }
            (ActionKind::SendEmail, Action::SendEmail(p)) => json!({
                "to": p.recipients,
                "subject": p.subject.clone().unwrap_or_else(|| format!("Alert: overdue milestone - {}", ctx.milestone_name)),
                "body": p.body.clone().unwrap_or_else(|| format!(
                    "Milestone {} of project {} is overdue.\nAction required: please review and take the necessary steps.\nProject ID: {}\nMilestone ID: {}\nDate: {}",
                    ctx.milestone_name, ctx.project_name, ctx.project_id, ctx.milestone_id, ctx.now.to_rfc3339()
                )),
                "project_id": ctx.project_id,
                "milestone_id": ctx.milestone_id,
                "sent_at": ctx.now.to_rfc3339(),
            }),
            (ActionKind::NotifyStakeholders, Action::NotifyStakeholders(p)) => json!({
                "stakeholders": p.stakeholders,
                "title": p.title.clone().unwrap_or_else(|| format!("Overdue milestone: {}", ctx.milestone_name)),
                "message": p.message.clone().unwrap_or_else(|| format!(
                    "Milestone {} of project {} is overdue.",
                    ctx.milestone_name, ctx.project_name
                )),
                "project_id": ctx.project_id,
                "milestone_id": ctx.milestone_id,
                "created_at": ctx.now.to_rfc3339(),
            }),
            _ => return Err(mismatch(self.kind, action)),
        };
        Ok(payload)
    }

    fn owner_notice(&self, payload: &Value, reference: &Value, ctx: &ActionContext) -> (String, String) {
        let reference_id = reference
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("(no reference)");
        let list = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default()
        };

        match self.kind {
            ActionKind::CreateSupportTicket => (
                "Support ticket created".to_string(),
                format!(
                    "Ticket {} was created for overdue milestone: {}",
                    reference_id, ctx.milestone_name
                ),
            ),
            ActionKind::ScheduleReviewMeeting => (
                "Review meeting scheduled".to_string(),
                format!(
                    "Meeting scheduled for {} to review overdue milestone: {}",
                    payload
                        .get("scheduled_time")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                    ctx.milestone_name
                ),
            ),
            ActionKind::SendEmail => (
                "Custom email sent".to_string(),
                format!(
                    "Email sent to {} about overdue milestone: {}",
                    list("to"),
                    ctx.milestone_name
                ),
            ),
            _ => (
                "Stakeholders notified".to_string(),
                format!(
                    "Notifications sent to {} about overdue milestone: {}",
                    list("stakeholders"),
                    ctx.milestone_name
                ),
            ),
        }
    }
}

impl ActionHandler for ExternalActionHandler {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    fn execute(&self, action: &Action, ctx: &ActionContext) -> Result<ActionOutcome> {
        let payload = self.payload(action, ctx)?;
        let reference = self.backend.submit(self.kind, &payload)?;
        let notice = self.owner_notice(&payload, &reference, ctx);

        Ok(ActionOutcome {
            result: json!({
                "action": self.kind.as_str(),
                "backend": self.backend.name(),
                "reference": reference,
                "data": payload,
                "timestamp": ctx.now.to_rfc3339(),
            }),
            owner_notice: Some(notice),
        })
    }
}

/// One handler per known kind.
pub fn default_handlers(
    entities: Arc<dyn WatchedEntityRepository>,
    backend: Arc<dyn ExternalActions>,
) -> Vec<Box<dyn ActionHandler>> {
    let mut handlers: Vec<Box<dyn ActionHandler>> = vec![
        Box::new(StatusWriteHandler::pause(entities.clone())),
        Box::new(StatusWriteHandler::update_status(entities)),
    ];
    for kind in ActionKind::all().into_iter().filter(ActionKind::is_external) {
        handlers.push(Box::new(ExternalActionHandler::new(kind, backend.clone())));
    }
    handlers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{MeetingParams, PauseParams, StakeholderParams};
    use crate::types::WatchedEntity;
    use chrono::{TimeZone, Utc};

    #[derive(Default)]
    struct StatusLog {
        writes: Mutex<Vec<(String, EntityStatus)>>,
    }

    impl WatchedEntityRepository for StatusLog {
        fn list_active(&self) -> Result<Vec<WatchedEntity>> {
            Ok(vec![])
        }

        fn get(&self, _id: &str) -> Result<Option<WatchedEntity>> {
            Ok(None)
        }

        fn set_status(&self, id: &str, status: &EntityStatus) -> Result<()> {
            self.writes
                .lock()
                .unwrap()
                .push((id.to_string(), status.clone()));
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
            now: Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_pause_writes_paused_status() {
        let log = Arc::new(StatusLog::default());
        let handler = StatusWriteHandler::pause(log.clone());

        let outcome = handler
            .execute(&Action::PauseProject(PauseParams::default()), &ctx())
            .unwrap();

        assert_eq!(outcome.result["new_status"], "paused");
        assert!(outcome.owner_notice.is_some());
        assert_eq!(
            log.writes.lock().unwrap().as_slice(),
            &[("p-1".to_string(), EntityStatus::Paused)]
        );
    }

    #[test]
    fn test_handler_rejects_other_kind() {
        let log = Arc::new(StatusLog::default());
        let handler = StatusWriteHandler::pause(log.clone());
        let err = handler
            .execute(
                &Action::NotifyStakeholders(StakeholderParams::default()),
                &ctx(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Action(_)));
        assert!(log.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_simulated_meeting_payload() {
        let backend = Arc::new(SimulatedActions::new());
        let handler = ExternalActionHandler::new(ActionKind::ScheduleReviewMeeting, backend.clone());

        let outcome = handler
            .execute(
                &Action::ScheduleReviewMeeting(MeetingParams::default()),
                &ctx(),
            )
            .unwrap();

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        let (kind, payload) = &submissions[0];
        assert_eq!(*kind, ActionKind::ScheduleReviewMeeting);
        assert_eq!(payload["scheduled_time"], "2026-03-11T08:00:00+00:00");
        assert_eq!(payload["duration_minutes"], 60);
        assert!(outcome.result["reference"]["id"]
            .as_str()
            .unwrap()
            .starts_with("MEETING-"));
    }

    #[test]
    fn test_stakeholder_notice_lists_recipients() {
        let backend = Arc::new(SimulatedActions::new());
        let handler = ExternalActionHandler::new(ActionKind::NotifyStakeholders, backend);

        let outcome = handler
            .execute(
                &Action::NotifyStakeholders(StakeholderParams::default()),
                &ctx(),
            )
            .unwrap();

        let (_, body) = outcome.owner_notice.unwrap();
        assert!(body.contains("project-manager, team-lead, client"));
    }

    #[test]
    fn test_default_handlers_cover_every_kind() {
        let handlers = default_handlers(
            Arc::new(StatusLog::default()),
            Arc::new(SimulatedActions::new()),
        );
        let mut kinds: Vec<_> = handlers.iter().map(|h| h.kind()).collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds.dedup();
        assert_eq!(kinds.len(), ActionKind::all().len());
    }
}
