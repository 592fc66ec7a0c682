//! Next-step decisions from the model.
//!
//! [`StepDecisionMaker`] wraps exactly one model interaction into exactly
//! one next [`Step`]. The model chooses from a fixed tool palette; the
//! chosen tool name selects a strict argument schema, and any parse failure
//! degrades to a manual-intervention step instead of propagating an error.
//! Call hygiene lives here too: the primary decision call runs under a 30s
//! timeout with bounded retries and exponential backoff, and the optional
//! vision pre-call degrades to empty analysis on failure.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::instruction::{Action, ActionKind, Step};
use crate::model::{ChatMessage, ChatRequest, ModelClient, ModelReply, ToolDefinition};

/// Maximum backoff delay between decision-call retries.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Calculate exponential backoff for a retry attempt (1-indexed),
/// doubling per attempt and capped at [`MAX_BACKOFF_MS`].
#[must_use]
pub fn calculate_backoff(attempt: u32, base_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let delay = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

/// Cheap per-run prediction of instruction complexity and screenshot need,
/// elicited once via the `classifyInstruction` tool and cached thereafter.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Predicted complexity ("simple", "moderate", "complex").
    pub complexity: String,
    /// Whether decision calls should carry a screenshot.
    pub needs_screenshot: bool,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            complexity: "moderate".to_string(),
            needs_screenshot: true,
        }
    }
}

/// Everything a decision call sees.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    /// The (possibly clarified) instruction text.
    pub instruction: &'a str,
    /// Current DOM snapshot, already truncated by the DOM collaborator.
    pub dom_content: &'a str,
    /// Screenshot bytes, when the screenshot policy requested one.
    pub screenshot: Option<&'a [u8]>,
    /// The most recent steps (bounded window).
    pub recent_steps: &'a [Step],
    /// Full action-history text for the session.
    pub history: &'a str,
    /// Cached classification from the start of the run, once available.
    pub classification: Option<&'a Classification>,
}

/// One decided step plus the classification it carried, if the model was
/// asked to classify.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub step: Step,
    pub classification: Option<Classification>,
}

const SYSTEM_PROMPT: &str = "You are a browser automation agent operating a live page on behalf \
of a user. At every turn you are shown the user's instruction, a snapshot of the current DOM, \
the most recent steps, and the action history. Respond with exactly one tool call. Prefer \
stable selectors from the DOM snapshot; give several fallbacks ordered best-first. When the \
instruction is satisfied call `complete`; when a human must act (login, captcha, payment) call \
`manualIntervention`.";

/// The fixed tool palette offered to the decision model.
#[must_use]
pub fn tool_palette() -> Vec<ToolDefinition> {
    fn tool(name: &str, description: &str, parameters: Value) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }

    let reason = json!({"type": "string", "description": "Why this step"});
    vec![
        tool(
            "thought",
            "Record a reasoning step without acting",
            json!({
                "type": "object",
                "properties": {"content": {"type": "string"}},
                "required": ["content"]
            }),
        ),
        tool(
            "classifyInstruction",
            "Classify the instruction's complexity and whether screenshots are needed",
            json!({
                "type": "object",
                "properties": {
                    "complexity": {"type": "string", "enum": ["simple", "moderate", "complex"]},
                    "needsScreenshot": {"type": "boolean"}
                },
                "required": ["complexity", "needsScreenshot"]
            }),
        ),
        tool(
            "navigate",
            "Load a URL",
            json!({
                "type": "object",
                "properties": {"url": {"type": "string"}, "reason": reason.clone()},
                "required": ["url"]
            }),
        ),
        tool(
            "click",
            "Click an element, trying selectors in order",
            json!({
                "type": "object",
                "properties": {
                    "selectors": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                    "reason": reason.clone()
                },
                "required": ["selectors"]
            }),
        ),
        tool(
            "clickByPosition",
            "Click at viewport coordinates when no selector works",
            json!({
                "type": "object",
                "properties": {
                    "x": {"type": "number"},
                    "y": {"type": "number"},
                    "reason": reason.clone()
                },
                "required": ["x", "y"]
            }),
        ),
        tool(
            "type",
            "Type text into an element, trying selectors in order",
            json!({
                "type": "object",
                "properties": {
                    "selectors": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                    "value": {"type": "string"},
                    "reason": reason.clone()
                },
                "required": ["selectors", "value"]
            }),
        ),
        tool(
            "pressEnter",
            "Press the Enter key in the focused element",
            json!({
                "type": "object",
                "properties": {"reason": reason.clone()},
                "required": []
            }),
        ),
        tool(
            "scroll",
            "Scroll the page",
            json!({
                "type": "object",
                "properties": {
                    "direction": {"type": "string", "enum": ["up", "down"]},
                    "amount": {"type": "integer"},
                    "reason": reason.clone()
                },
                "required": ["direction"]
            }),
        ),
        tool(
            "wait",
            "Wait for the page to settle",
            json!({
                "type": "object",
                "properties": {"durationMs": {"type": "integer"}, "reason": reason.clone()},
                "required": []
            }),
        ),
        tool(
            "complete",
            "Declare the instruction satisfied",
            json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string"},
                    "finalAnswer": {"type": "string"}
                },
                "required": ["summary"]
            }),
        ),
        tool(
            "manualIntervention",
            "Request a human to act in the live session",
            json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string"},
                    "category": {"type": "string"},
                    "suggestion": {"type": "string"}
                },
                "required": ["reason", "category"]
            }),
        ),
    ]
}

/// Wraps one model call into exactly one next step.
pub struct StepDecisionMaker {
    model: Arc<dyn ModelClient>,
    config: EngineConfig,
}

impl StepDecisionMaker {
    /// Create a decision maker over the given model client.
    #[must_use]
    pub fn new(model: Arc<dyn ModelClient>, config: EngineConfig) -> Self {
        Self { model, config }
    }

    /// Decide the next step.
    ///
    /// Never fails: decision-call retry exhaustion and malformed tool calls
    /// both come back as a `ManualIntervention` step with category
    /// `processing_error`, which the loop treats as terminal.
    pub async fn decide(&self, ctx: DecisionContext<'_>) -> DecisionOutcome {
        let vision_analysis = match ctx.screenshot {
            Some(image) => self.vision_analysis(image).await,
            None => String::new(),
        };

        let request = self.build_request(&ctx, &vision_analysis);
        let reply = match self.call_with_retry(request).await {
            Ok(reply) => reply,
            Err(e) => {
                return DecisionOutcome {
                    step: processing_error(format!("Decision call failed: {e}")),
                    classification: None,
                }
            }
        };

        match reply {
            ModelReply::ToolCall { name, arguments } => parse_tool_call(&name, &arguments),
            ModelReply::Text { .. } => DecisionOutcome {
                step: processing_error(
                    "Model returned plain text instead of a tool call".to_string(),
                ),
                classification: None,
            },
        }
    }

    /// Annotate the screenshot with candidate coordinates before deciding.
    /// One retry, short timeout; failure degrades to empty analysis.
    async fn vision_analysis(&self, image: &[u8]) -> String {
        let prompt = "List the interactive elements visible in this screenshot with their \
approximate viewport coordinates, one per line.";
        for attempt in 1..=(self.config.vision_max_retries + 1) {
            match timeout(self.config.vision_timeout(), self.model.vision(image, prompt)).await {
                Ok(Ok(analysis)) => return analysis,
                Ok(Err(e)) => warn!(attempt, error = %e, "vision call failed"),
                Err(_) => warn!(attempt, "vision call timed out"),
            }
        }
        String::new()
    }

    async fn call_with_retry(&self, request: ChatRequest) -> anyhow::Result<ModelReply> {
        let attempts = self.config.decision_max_retries + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match timeout(self.config.decision_timeout(), self.model.chat(request.clone())).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "decision call failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(attempt, "decision call timed out");
                    last_error = Some(anyhow::anyhow!(
                        "timed out after {}s",
                        self.config.decision_timeout_secs
                    ));
                }
            }
            if attempt < attempts {
                tokio::time::sleep(calculate_backoff(
                    attempt,
                    self.config.decision_backoff_base_ms,
                ))
                .await;
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("decision call failed")))
    }

    fn build_request(&self, ctx: &DecisionContext<'_>, vision_analysis: &str) -> ChatRequest {
        let mut user = format!("Instruction: {}\n", ctx.instruction);
        if let Some(classification) = ctx.classification {
            user.push_str(&format!(
                "Classification: {} (screenshot needed: {})\n",
                classification.complexity, classification.needs_screenshot
            ));
        }
        if !vision_analysis.is_empty() {
            user.push_str(&format!("\nScreenshot analysis:\n{vision_analysis}\n"));
        }
        if !ctx.history.is_empty() {
            user.push_str(&format!("\nActions taken so far:\n{}\n", ctx.history));
        }
        if !ctx.recent_steps.is_empty() {
            user.push_str(&format!(
                "\nRecent steps:\n{}\n",
                render_steps(ctx.recent_steps)
            ));
        }
        user.push_str(&format!("\nCurrent page DOM:\n{}\n", ctx.dom_content));
        user.push_str("\nChoose the next tool call.");

        // The classification is elicited exactly once, by forcing the tool
        // on the first call of the run.
        let tool_choice = if ctx.classification.is_none() {
            Some("classifyInstruction".to_string())
        } else {
            Some("required".to_string())
        };

        debug!(
            forced_classify = ctx.classification.is_none(),
            with_screenshot = !vision_analysis.is_empty(),
            "building decision request"
        );

        ChatRequest {
            model: self.model.model_name().to_string(),
            temperature: 0.1,
            max_tokens: 1024,
            messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)],
            tools: tool_palette(),
            tool_choice,
        }
    }
}

/// Render a step window for the decision prompt.
fn render_steps(steps: &[Step]) -> String {
    steps
        .iter()
        .map(|step| match step {
            Step::Thought { content } => format!("- Thought: {content}"),
            Step::Action { action, .. } => format!("- Action: {}", action.description),
            Step::Observation { content } => format!("- Observation: {content}"),
            Step::Complete { summary, .. } => format!("- Complete: {summary}"),
            Step::ManualIntervention { reason, .. } => {
                format!("- Manual intervention: {reason}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn processing_error(reason: String) -> Step {
    Step::ManualIntervention {
        reason,
        category: "processing_error".to_string(),
        suggestion: "Review the session and resubmit the instruction.".to_string(),
    }
}

fn parse_failure(name: &str, detail: &str) -> DecisionOutcome {
    DecisionOutcome {
        step: processing_error(format!("Could not parse '{name}' tool call: {detail}")),
        classification: None,
    }
}

fn action_outcome(action: Action, reason: &str) -> DecisionOutcome {
    DecisionOutcome {
        step: Step::Action {
            action,
            content: reason.to_string(),
        },
        classification: None,
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn reason_arg(args: &Value) -> String {
    str_arg(args, "reason").unwrap_or_default().to_string()
}

fn selectors_arg(args: &Value) -> Option<Vec<String>> {
    let list = args.get("selectors")?.as_array()?;
    let selectors: Vec<String> = list
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    if selectors.is_empty() {
        None
    } else {
        Some(selectors)
    }
}

/// Parse one named tool call into a step.
///
/// The tool name selects the argument schema; anything malformed yields a
/// processing-error manual intervention instead of an `Err`.
#[must_use]
pub fn parse_tool_call(name: &str, arguments: &Value) -> DecisionOutcome {
    match name {
        "thought" => match str_arg(arguments, "content") {
            Some(content) => DecisionOutcome {
                step: Step::Thought {
                    content: content.to_string(),
                },
                classification: None,
            },
            None => parse_failure(name, "missing 'content'"),
        },
        "classifyInstruction" => {
            let Some(complexity) = str_arg(arguments, "complexity") else {
                return parse_failure(name, "missing 'complexity'");
            };
            let Some(needs_screenshot) =
                arguments.get("needsScreenshot").and_then(Value::as_bool)
            else {
                return parse_failure(name, "missing 'needsScreenshot'");
            };
            DecisionOutcome {
                step: Step::Thought {
                    content: format!(
                        "Classified instruction as {complexity} (screenshot needed: {needs_screenshot})"
                    ),
                },
                classification: Some(Classification {
                    complexity: complexity.to_string(),
                    needs_screenshot,
                }),
            }
        }
        "navigate" => {
            let Some(url) = str_arg(arguments, "url") else {
                return parse_failure(name, "missing 'url'");
            };
            let reason = reason_arg(arguments);
            let mut action = Action::new(
                ActionKind::Navigate,
                format!("Navigate to {url}: {reason}"),
            );
            action.url = Some(url.to_string());
            action_outcome(action, &reason)
        }
        "click" => {
            let Some(selectors) = selectors_arg(arguments) else {
                return parse_failure(name, "missing or empty 'selectors'");
            };
            let reason = reason_arg(arguments);
            let mut action = Action::new(
                ActionKind::Click,
                format!("Click {}: {reason}", selectors.join(", ")),
            );
            action.selectors = selectors;
            action_outcome(action, &reason)
        }
        "clickByPosition" => {
            let (Some(x), Some(y)) = (
                arguments.get("x").and_then(Value::as_f64),
                arguments.get("y").and_then(Value::as_f64),
            ) else {
                return parse_failure(name, "missing 'x'/'y'");
            };
            let reason = reason_arg(arguments);
            let mut action = Action::new(
                ActionKind::ClickByPosition,
                format!("Click at ({x}, {y}): {reason}"),
            );
            action.x = Some(x);
            action.y = Some(y);
            action_outcome(action, &reason)
        }
        "type" => {
            let Some(selectors) = selectors_arg(arguments) else {
                return parse_failure(name, "missing or empty 'selectors'");
            };
            let Some(value) = str_arg(arguments, "value") else {
                return parse_failure(name, "missing 'value'");
            };
            let reason = reason_arg(arguments);
            let mut action = Action::new(
                ActionKind::Type,
                format!("Type '{value}' into {}: {reason}", selectors.join(", ")),
            );
            action.selectors = selectors;
            action.value = Some(value.to_string());
            action_outcome(action, &reason)
        }
        "pressEnter" => {
            let reason = reason_arg(arguments);
            let action = Action::new(ActionKind::PressEnter, format!("Press Enter: {reason}"));
            action_outcome(action, &reason)
        }
        "scroll" => {
            let Some(direction) = str_arg(arguments, "direction") else {
                return parse_failure(name, "missing 'direction'");
            };
            let amount = arguments.get("amount").and_then(Value::as_i64);
            let reason = reason_arg(arguments);
            let mut action = Action::new(
                ActionKind::Scroll,
                format!("Scroll {direction}: {reason}"),
            );
            action.direction = Some(direction.to_string());
            action.amount = amount;
            action_outcome(action, &reason)
        }
        "wait" => {
            let duration_ms = arguments.get("durationMs").and_then(Value::as_u64);
            let reason = reason_arg(arguments);
            let mut action = Action::new(
                ActionKind::Wait,
                format!("Wait {}ms: {reason}", duration_ms.unwrap_or(1000)),
            );
            action.duration_ms = duration_ms;
            action_outcome(action, &reason)
        }
        "complete" => {
            let Some(summary) = str_arg(arguments, "summary") else {
                return parse_failure(name, "missing 'summary'");
            };
            DecisionOutcome {
                step: Step::Complete {
                    summary: summary.to_string(),
                    final_answer: str_arg(arguments, "finalAnswer").map(str::to_string),
                },
                classification: None,
            }
        }
        "manualIntervention" => {
            let Some(reason) = str_arg(arguments, "reason") else {
                return parse_failure(name, "missing 'reason'");
            };
            let Some(category) = str_arg(arguments, "category") else {
                return parse_failure(name, "missing 'category'");
            };
            DecisionOutcome {
                step: Step::ManualIntervention {
                    reason: reason.to_string(),
                    category: category.to_string(),
                    suggestion: str_arg(arguments, "suggestion").unwrap_or_default().to_string(),
                },
                classification: None,
            }
        }
        other => parse_failure(other, "unknown tool"),
    }
}
