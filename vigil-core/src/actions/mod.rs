//! Escalation actions
//!
//! Rules carry raw `{ "type": ..., "config": {...} }` action entries. The rule
//! catalog resolves each entry into a typed [`Action`] when the rule is loaded,
//! so malformed parameters surface as configuration errors before a pass runs.
//!
//! ## Architecture
//!
//! ```text
//! ActionConfig (raw) ──resolve──▶ Action (typed) ──▶ ActionExecutor
//!                                                        │
//!                         HashMap<ActionKind, Box<dyn ActionHandler>>
//!                                                        │
//!               ┌────────────────────┬───────────────────┴──────────┐
//!               ▼                    ▼                              ▼
//!        StatusWriteHandler   ExternalActionHandler ──▶ ExternalActions
//!        (pause / status)     (ticket, meeting,         (Simulated | Webhook)
//!                              email, stakeholders)
//! ```

pub mod executor;
pub mod handlers;

pub use executor::ActionExecutor;
pub use handlers::{
    backend_from_config, default_handlers, ActionHandler, ActionOutcome, ExternalActionHandler,
    ExternalActions, SimulatedActions, StatusWriteHandler, WebhookActions,
};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::EntityStatus;

/// Error reported for action types outside the known set.
pub const UNSUPPORTED_ACTION: &str = "unsupported action type";

// ============================================
// Raw configuration
// ============================================

/// An action entry as stored with an escalation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Action type name, e.g. `pause_project`
    #[serde(rename = "type")]
    pub action_type: String,
    /// Free-form parameters, validated per kind at resolve time
    #[serde(default)]
    pub config: Value,
}

impl ActionConfig {
    pub fn new(action_type: &str, config: Value) -> Self {
        Self {
            action_type: action_type.to_string(),
            config,
        }
    }
}

// ============================================
// Kinds and typed parameters
// ============================================

/// The closed set of action kinds the executor has handlers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    PauseProject,
    UpdateProjectStatus,
    CreateSupportTicket,
    ScheduleReviewMeeting,
    SendEmail,
    NotifyStakeholders,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::PauseProject => "pause_project",
            ActionKind::UpdateProjectStatus => "update_project_status",
            ActionKind::CreateSupportTicket => "create_support_ticket",
            ActionKind::ScheduleReviewMeeting => "schedule_review_meeting",
            ActionKind::SendEmail => "send_email",
            ActionKind::NotifyStakeholders => "notify_stakeholders",
        }
    }

    pub fn all() -> [ActionKind; 6] {
        [
            ActionKind::PauseProject,
            ActionKind::UpdateProjectStatus,
            ActionKind::CreateSupportTicket,
            ActionKind::ScheduleReviewMeeting,
            ActionKind::SendEmail,
            ActionKind::NotifyStakeholders,
        ]
    }

    /// Kinds whose side effect lives outside the watched-entity store.
    pub fn is_external(&self) -> bool {
        !matches!(
            self,
            ActionKind::PauseProject | ActionKind::UpdateProjectStatus
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ActionKind::all()
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown action kind: {}", s))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PauseParams {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusParams {
    #[serde(default = "default_new_status", alias = "newStatus")]
    pub new_status: EntityStatus,
}

impl Default for StatusParams {
    fn default() -> Self {
        Self {
            new_status: default_new_status(),
        }
    }
}

fn default_new_status() -> EntityStatus {
    EntityStatus::AtRisk
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketParams {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_ticket_priority")]
    pub priority: String,
    #[serde(default = "default_ticket_assignee")]
    pub assignee: String,
}

impl Default for TicketParams {
    fn default() -> Self {
        Self {
            title: None,
            description: None,
            priority: default_ticket_priority(),
            assignee: default_ticket_assignee(),
        }
    }
}

fn default_ticket_priority() -> String {
    "high".to_string()
}

fn default_ticket_assignee() -> String {
    "support-team".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeetingParams {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_hours_from_now", alias = "hoursFromNow")]
    pub hours_from_now: i64,
    #[serde(default = "default_duration_minutes", alias = "durationMinutes")]
    pub duration_minutes: i64,
    #[serde(default = "default_attendees")]
    pub attendees: Vec<String>,
}

impl Default for MeetingParams {
    fn default() -> Self {
        Self {
            title: None,
            description: None,
            hours_from_now: default_hours_from_now(),
            duration_minutes: default_duration_minutes(),
            attendees: default_attendees(),
        }
    }
}

fn default_hours_from_now() -> i64 {
    24
}

fn default_duration_minutes() -> i64 {
    60
}

fn default_attendees() -> Vec<String> {
    vec!["project-manager".to_string(), "team-lead".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailParams {
    #[serde(default = "default_email_recipients")]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl Default for EmailParams {
    fn default() -> Self {
        Self {
            recipients: default_email_recipients(),
            subject: None,
            body: None,
        }
    }
}

fn default_email_recipients() -> Vec<String> {
    vec!["project-manager".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StakeholderParams {
    #[serde(default = "default_stakeholders")]
    pub stakeholders: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Default for StakeholderParams {
    fn default() -> Self {
        Self {
            stakeholders: default_stakeholders(),
            title: None,
            message: None,
        }
    }
}

fn default_stakeholders() -> Vec<String> {
    vec![
        "project-manager".to_string(),
        "team-lead".to_string(),
        "client".to_string(),
    ]
}

// ============================================
// Resolved actions
// ============================================

/// A validated action, ready for the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    PauseProject(PauseParams),
    UpdateProjectStatus(StatusParams),
    CreateSupportTicket(TicketParams),
    ScheduleReviewMeeting(MeetingParams),
    SendEmail(EmailParams),
    NotifyStakeholders(StakeholderParams),
    /// A type name outside the known set. Kept so the executor can report it.
    Unsupported(String),
}

impl Action {
    /// Resolve a raw entry into a typed action.
    ///
    /// Unknown type names resolve to [`Action::Unsupported`]. Known kinds with
    /// malformed parameters are an error.
    pub fn resolve(raw: &ActionConfig) -> Result<Action> {
        let kind = match raw.action_type.parse::<ActionKind>() {
            Ok(kind) => kind,
            Err(_) => return Ok(Action::Unsupported(raw.action_type.clone())),
        };

        let action = match kind {
            ActionKind::PauseProject => Action::PauseProject(parse_params(kind, &raw.config)?),
            ActionKind::UpdateProjectStatus => {
                Action::UpdateProjectStatus(parse_params(kind, &raw.config)?)
            }
            ActionKind::CreateSupportTicket => {
                Action::CreateSupportTicket(parse_params(kind, &raw.config)?)
            }
            ActionKind::ScheduleReviewMeeting => {
                let params: MeetingParams = parse_params(kind, &raw.config)?;
                if params.hours_from_now < 0 || params.duration_minutes <= 0 {
                    return Err(Error::Action(format!(
                        "{}: hours_from_now must be >= 0 and duration_minutes > 0",
                        kind
                    )));
                }
                Action::ScheduleReviewMeeting(params)
            }
            ActionKind::SendEmail => {
                let params: EmailParams = parse_params(kind, &raw.config)?;
                if params.recipients.is_empty() {
                    return Err(Error::Action(format!("{}: recipients is empty", kind)));
                }
                Action::SendEmail(params)
            }
            ActionKind::NotifyStakeholders => {
                let params: StakeholderParams = parse_params(kind, &raw.config)?;
                if params.stakeholders.is_empty() {
                    return Err(Error::Action(format!("{}: stakeholders is empty", kind)));
                }
                Action::NotifyStakeholders(params)
            }
        };
        Ok(action)
    }

    /// The handler kind, or `None` for unsupported types.
    pub fn kind(&self) -> Option<ActionKind> {
        match self {
            Action::PauseProject(_) => Some(ActionKind::PauseProject),
            Action::UpdateProjectStatus(_) => Some(ActionKind::UpdateProjectStatus),
            Action::CreateSupportTicket(_) => Some(ActionKind::CreateSupportTicket),
            Action::ScheduleReviewMeeting(_) => Some(ActionKind::ScheduleReviewMeeting),
            Action::SendEmail(_) => Some(ActionKind::SendEmail),
            Action::NotifyStakeholders(_) => Some(ActionKind::NotifyStakeholders),
            Action::Unsupported(_) => None,
        }
    }

    /// Type name as configured.
    pub fn type_name(&self) -> &str {
        match self {
            Action::Unsupported(name) => name,
            other => other.kind().map(|k| k.as_str()).unwrap_or_default(),
        }
    }
}

fn parse_params<T: DeserializeOwned>(kind: ActionKind, config: &Value) -> Result<T> {
    let value = match config {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(value)
        .map_err(|e| Error::Action(format!("{}: invalid parameters: {}", kind, e)))
}

// ============================================
// Execution context and results
// ============================================

/// What an action is being run for.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub rule_id: String,
    pub project_id: String,
    pub project_name: String,
    pub milestone_id: String,
    pub milestone_name: String,
    pub now: DateTime<Utc>,
}

/// Structured outcome of one action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    /// Action type name as configured
    pub action: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(action: &str, result: Value) -> Self {
        Self {
            action: action.to_string(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(action: &str, error: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Row of the action execution log.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionLogEntry {
    pub id: String,
    pub rule_id: String,
    pub milestone_id: String,
    pub project_id: String,
    pub action: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ActionLogEntry {
    pub fn from_result(ctx: &ActionContext, result: &ActionResult, executed_at: DateTime<Utc>) -> Self {
        Self {
            id: format!("act_{}", uuid::Uuid::new_v4().simple()),
            rule_id: ctx.rule_id.clone(),
            milestone_id: ctx.milestone_id.clone(),
            project_id: ctx.project_id.clone(),
            action: result.action.clone(),
            success: result.success,
            result: result.result.clone(),
            error: result.error.clone(),
            executed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_applies_defaults() {
        let action = Action::resolve(&ActionConfig::new("create_support_ticket", Value::Null)).unwrap();
        match action {
            Action::CreateSupportTicket(params) => {
                assert_eq!(params.priority, "high");
                assert_eq!(params.assignee, "support-team");
            }
            other => panic!("unexpected action: {:?}", other),
        }

        let action = Action::resolve(&ActionConfig::new("schedule_review_meeting", json!({}))).unwrap();
        assert_eq!(
            action,
            Action::ScheduleReviewMeeting(MeetingParams::default())
        );
    }

    #[test]
    fn test_resolve_accepts_camel_case_aliases() {
        let raw = ActionConfig::new("update_project_status", json!({"newStatus": "on_hold"}));
        assert_eq!(
            Action::resolve(&raw).unwrap(),
            Action::UpdateProjectStatus(StatusParams {
                new_status: EntityStatus::OnHold
            })
        );
    }

    #[test]
    fn test_unknown_type_is_retained() {
        let action = Action::resolve(&ActionConfig::new("launch_rocket", json!({}))).unwrap();
        assert_eq!(action, Action::Unsupported("launch_rocket".to_string()));
        assert_eq!(action.kind(), None);
        assert_eq!(action.type_name(), "launch_rocket");
    }

    #[test]
    fn test_malformed_params_rejected() {
        let raw = ActionConfig::new("schedule_review_meeting", json!({"hours_from_now": "soon"}));
        assert!(Action::resolve(&raw).is_err());

        let raw = ActionConfig::new("send_email", json!({"recipients": []}));
        assert!(Action::resolve(&raw).is_err());

        let raw = ActionConfig::new("pause_project", json!({"reasn": "typo"}));
        assert!(Action::resolve(&raw).is_err());
    }

    #[test]
    fn test_action_config_wire_shape() {
        let raw: ActionConfig =
            serde_json::from_value(json!({"type": "notify_stakeholders"})).unwrap();
        assert_eq!(raw.action_type, "notify_stakeholders");
        assert_eq!(raw.config, Value::Null);
    }
}
