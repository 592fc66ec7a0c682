//! Core data model: instructions, steps, actions, and run outcomes.
//!
//! A run is an append-only sequence of [`Step`]s produced while executing
//! one [`Instruction`]. Steps are never mutated once appended; the loop
//! and the heuristics only ever read them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A natural-language instruction submitted against a live browser session.
///
/// Immutable after submission, except that a pre-pass clarifier may rewrite
/// `text` before the run starts. At most one instruction is in flight per
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    /// Caller-supplied unique id.
    pub id: String,
    /// The natural-language instruction text.
    pub text: String,
    /// The browser session this instruction targets.
    pub session_id: String,
    /// Submission time.
    pub timestamp: DateTime<Utc>,
}

impl Instruction {
    /// Create a new instruction with a generated id and the current time.
    #[must_use]
    pub fn new(text: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The kind of browser action the decision model can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    /// Load a URL.
    Navigate,
    /// Click an element located by selector fallback.
    Click,
    /// Click at viewport coordinates.
    ClickByPosition,
    /// Type text into an element located by selector fallback.
    Type,
    /// Press the Enter key.
    PressEnter,
    /// Scroll the page.
    Scroll,
    /// Wait a fixed duration.
    Wait,
}

impl ActionKind {
    /// Whether this action runs under DOM-mutation observation.
    #[must_use]
    pub fn is_observed(&self) -> bool {
        matches!(
            self,
            Self::Navigate | Self::Click | Self::Type | Self::PressEnter
        )
    }

    /// Whether this action plausibly moves the task forward on its own
    /// (used by the simple-navigation auto-complete heuristic).
    #[must_use]
    pub fn is_navigational(&self) -> bool {
        matches!(self, Self::Navigate | Self::Click | Self::ClickByPosition)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::ClickByPosition => "clickByPosition",
            Self::Type => "type",
            Self::PressEnter => "pressEnter",
            Self::Scroll => "scroll",
            Self::Wait => "wait",
        };
        write!(f, "{name}")
    }
}

/// A schema-validated browser action decided by the model.
///
/// Only the fields relevant to `kind` are populated; the rest stay at their
/// defaults and are skipped during serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// What to do.
    #[serde(rename = "type")]
    pub kind: ActionKind,
    /// Ordered selector fallback list for click/type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<String>,
    /// Text to type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Navigation target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Viewport x coordinate for clickByPosition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// Viewport y coordinate for clickByPosition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    /// Scroll direction ("up" or "down").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    /// Scroll amount in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    /// Wait duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Human-readable description, recorded in the session action history.
    pub description: String,
}

impl Action {
    /// Create an action of the given kind with a description and all other
    /// fields empty. Used as the base for the parse-time builders.
    #[must_use]
    pub fn new(kind: ActionKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            selectors: Vec::new(),
            value: None,
            url: None,
            x: None,
            y: None,
            direction: None,
            amount: None,
            duration_ms: None,
            description: description.into(),
        }
    }
}

/// One entry in a run's append-only step sequence.
///
/// Closed sum type over the ReAct alphabet: a reasoning step, a decided
/// action, an observation of the environment, or one of the two
/// model-initiated terminals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Free-text reasoning from the model.
    Thought { content: String },
    /// A decided action plus the model's stated rationale.
    Action { action: Action, content: String },
    /// What the environment reported after executing an action.
    Observation { content: String },
    /// Model declared the task done.
    Complete {
        summary: String,
        final_answer: Option<String>,
    },
    /// Model requested a human to act in the live session.
    ManualIntervention {
        reason: String,
        category: String,
        suggestion: String,
    },
}

impl Step {
    /// Whether this step terminates the loop.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::ManualIntervention { .. })
    }

    /// The action carried by this step, if any.
    #[must_use]
    pub fn action(&self) -> Option<&Action> {
        match self {
            Self::Action { action, .. } => Some(action),
            _ => None,
        }
    }

    /// Whether this is an observation recording a successful action.
    #[must_use]
    pub fn is_success_observation(&self) -> bool {
        matches!(self, Self::Observation { content } if content.starts_with("Success"))
    }

    /// Whether this is an observation recording a failed action.
    #[must_use]
    pub fn is_failure_observation(&self) -> bool {
        matches!(self, Self::Observation { content } if content.starts_with("Failed"))
    }

    /// Whether this is a thought that reads like instruction classification
    /// rather than forward planning.
    #[must_use]
    pub fn is_classification_thought(&self) -> bool {
        match self {
            Self::Thought { content } => {
                let lower = content.to_lowercase();
                lower.contains("classif")
                    || lower.contains("this instruction is")
                    || lower.contains("complexity")
            }
            _ => false,
        }
    }

    /// The thought content, if this is a thought step.
    #[must_use]
    pub fn thought_content(&self) -> Option<&str> {
        match self {
            Self::Thought { content } => Some(content),
            _ => None,
        }
    }
}

/// A request for a human to act in the live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualInterventionRequest {
    /// Why automation cannot proceed.
    pub reason: String,
    /// Coarse category (e.g. "login_required", "captcha", "processing_error").
    pub category: String,
    /// What the human should do.
    pub suggestion: String,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The task was completed.
    Success,
    /// The run aborted (hard action error, or an external stop signal).
    Error,
    /// A human must act before automation can resume.
    ManualInterventionRequired,
}

/// Final report for one processed instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// The instruction id this outcome belongs to.
    pub id: String,
    /// Terminal status.
    pub status: RunStatus,
    /// Human-readable error, present for `Error` outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Descriptions of every action executed during the run, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executed: Vec<String>,
    /// The executed actions themselves, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    /// Present for `ManualInterventionRequired` outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_intervention: Option<ManualInterventionRequest>,
    /// Page URL at the end of the run, when the browser could report it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
    /// Page title at the end of the run, when the browser could report it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_new() {
        let instruction = Instruction::new("open example.com", "session-1");
        assert!(!instruction.id.is_empty());
        assert_eq!(instruction.text, "open example.com");
        assert_eq!(instruction.session_id, "session-1");
    }

    #[test]
    fn test_action_kind_is_observed() {
        assert!(ActionKind::Navigate.is_observed());
        assert!(ActionKind::Click.is_observed());
        assert!(ActionKind::Type.is_observed());
        assert!(ActionKind::PressEnter.is_observed());
        assert!(!ActionKind::Scroll.is_observed());
        assert!(!ActionKind::Wait.is_observed());
        assert!(!ActionKind::ClickByPosition.is_observed());
    }

    #[test]
    fn test_action_kind_is_navigational() {
        assert!(ActionKind::Navigate.is_navigational());
        assert!(ActionKind::Click.is_navigational());
        assert!(ActionKind::ClickByPosition.is_navigational());
        assert!(!ActionKind::Scroll.is_navigational());
        assert!(!ActionKind::Wait.is_navigational());
    }

    #[test]
    fn test_action_kind_display() {
        assert_eq!(ActionKind::ClickByPosition.to_string(), "clickByPosition");
        assert_eq!(ActionKind::PressEnter.to_string(), "pressEnter");
        assert_eq!(ActionKind::Navigate.to_string(), "navigate");
    }

    #[test]
    fn test_step_is_terminal() {
        let complete = Step::Complete {
            summary: "done".to_string(),
            final_answer: None,
        };
        assert!(complete.is_terminal());

        let intervention = Step::ManualIntervention {
            reason: "captcha".to_string(),
            category: "captcha".to_string(),
            suggestion: "solve it".to_string(),
        };
        assert!(intervention.is_terminal());

        let thought = Step::Thought {
            content: "thinking".to_string(),
        };
        assert!(!thought.is_terminal());
    }

    #[test]
    fn test_observation_classification() {
        let success = Step::Observation {
            content: "Success: clicked '#submit'".to_string(),
        };
        assert!(success.is_success_observation());
        assert!(!success.is_failure_observation());

        let failure = Step::Observation {
            content: "Failed: no selector matched".to_string(),
        };
        assert!(failure.is_failure_observation());
        assert!(!failure.is_success_observation());
    }

    #[test]
    fn test_classification_thought() {
        let classify = Step::Thought {
            content: "Classifying the instruction: simple navigation".to_string(),
        };
        assert!(classify.is_classification_thought());

        let plan = Step::Thought {
            content: "Next I will click the search button".to_string(),
        };
        assert!(!plan.is_classification_thought());
    }

    #[test]
    fn test_action_serialization_skips_empty() {
        let action = Action::new(ActionKind::PressEnter, "Press Enter");
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"pressEnter\""));
        assert!(!json.contains("selectors"));
        assert!(!json.contains("url"));
    }

    #[test]
    fn test_run_status_serialization() {
        assert_eq!(
            serde_json::to_string(&RunStatus::ManualInterventionRequired).unwrap(),
            "\"manual_intervention_required\""
        );
        assert_eq!(serde_json::to_string(&RunStatus::Success).unwrap(), "\"success\"");
    }
}
