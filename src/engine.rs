//! The orchestration loop.
//!
//! [`Engine`] composes the decision maker, the action executor, and the
//! signal state machine into the bounded iterate-until-terminal cycle: ask
//! the model for the next step, execute it against the browser, observe the
//! resulting page change, and decide whether to continue, declare success,
//! stall out, or hand the session to a human.
//!
//! Cancellation is cooperative. External stop/complete signals are observed
//! at the checkpoint that opens each iteration, never mid-call; a signalled
//! run finishes whatever collaborator call is outstanding before returning,
//! and externally signalled terminals take precedence over locally computed
//! ones within the same iteration.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::browser::BrowserService;
use crate::config::EngineConfig;
use crate::decision::{Classification, DecisionContext, StepDecisionMaker};
use crate::error::{EngineError, Result};
use crate::executor::ActionExecutor;
use crate::heuristics;
use crate::instruction::{
    Action, Instruction, ManualInterventionRequest, RunOutcome, RunStatus, Step,
};
use crate::model::ModelClient;
use crate::session::SessionSink;
use crate::state::{SignalSnapshot, StateManager};

// =============================================================================
// Observers
// =============================================================================

/// Subscriber to run progress.
///
/// Observers are injected at construction time; the engine carries no
/// global logging state beyond `tracing`. Any number may be attached.
pub trait StepObserver: Send + Sync {
    /// Called after each step is appended to the run's sequence.
    fn on_step(&self, instruction_id: &str, step: &Step);

    /// Called once with the final outcome.
    fn on_terminal(&self, outcome: &RunOutcome) {
        let _ = outcome;
    }
}

/// Observer that mirrors run progress into `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StepObserver for TracingObserver {
    fn on_step(&self, instruction_id: &str, step: &Step) {
        match step {
            Step::Thought { content } => debug!(instruction_id, %content, "thought"),
            Step::Action { action, .. } => {
                info!(instruction_id, description = %action.description, "action")
            }
            Step::Observation { content } => debug!(instruction_id, %content, "observation"),
            Step::Complete { summary, .. } => info!(instruction_id, %summary, "complete"),
            Step::ManualIntervention { reason, category, .. } => {
                warn!(instruction_id, %reason, %category, "manual intervention")
            }
        }
    }

    fn on_terminal(&self, outcome: &RunOutcome) {
        info!(
            instruction_id = %outcome.id,
            status = ?outcome.status,
            executed = outcome.executed.len(),
            "run finished"
        );
    }
}

/// Optional pre-pass that rewrites the instruction text before the run
/// starts (e.g. expanding shorthand, resolving pronouns against the session
/// history). The default engine applies no rewrite.
#[async_trait::async_trait]
pub trait InstructionClarifier: Send + Sync {
    /// Rewrite `text`, or fail; failures degrade to the original text.
    async fn clarify(&self, text: &str) -> anyhow::Result<String>;
}

// =============================================================================
// Engine
// =============================================================================

/// How a run ended, before mapping to the externally visible outcome.
enum Terminal {
    Completed { summary: String },
    ManualIntervention(ManualInterventionRequest),
    Stopped,
    Error(String),
}

/// The instruction orchestration engine for one browser session.
///
/// One engine drives one session; independent sessions get independent
/// engines and run concurrently. Within a session the [`StateManager`]
/// enforces single-flight execution, so at most one instruction is in
/// flight at any instant.
///
/// # Example
///
/// ```rust,ignore
/// let engine = Engine::new(model, browser, session, EngineConfig::default())?
///     .with_observer(Arc::new(TracingObserver));
/// let outcome = engine.process_instruction(Instruction::new("open example.com", "s1")).await;
/// ```
pub struct Engine {
    decision: StepDecisionMaker,
    executor: ActionExecutor,
    browser: Arc<dyn BrowserService>,
    session: Arc<dyn SessionSink>,
    state: StateManager,
    observers: Vec<Arc<dyn StepObserver>>,
    clarifier: Option<Arc<dyn InstructionClarifier>>,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine over the given collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] when the configuration fails
    /// validation.
    pub fn new(
        model: Arc<dyn ModelClient>,
        browser: Arc<dyn BrowserService>,
        session: Arc<dyn SessionSink>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            decision: StepDecisionMaker::new(model, config.clone()),
            executor: ActionExecutor::new(Arc::clone(&browser), config.clone()),
            browser,
            session,
            state: StateManager::new(),
            observers: Vec::new(),
            clarifier: None,
            config,
        })
    }

    /// Attach a progress observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Attach an instruction clarifier pre-pass.
    #[must_use]
    pub fn with_clarifier(mut self, clarifier: Arc<dyn InstructionClarifier>) -> Self {
        self.clarifier = Some(clarifier);
        self
    }

    /// Whether an instruction is currently in flight.
    #[must_use]
    pub fn is_currently_processing(&self) -> bool {
        self.state.is_processing()
    }

    /// The id of the in-flight instruction, if any.
    #[must_use]
    pub fn current_instruction_id(&self) -> Option<String> {
        self.state.current_instruction_id()
    }

    /// Signal the active run to stop at its next checkpoint.
    ///
    /// Fire-and-forget; ignored when `id` is provided and does not match
    /// the active instruction.
    pub fn stop_current_instruction(&self, id: Option<&str>) {
        self.state.set_stop_signal(id);
    }

    /// Signal the active run to finish as a success at its next checkpoint.
    ///
    /// Fire-and-forget; ignored when `id` is provided and does not match
    /// the active instruction.
    pub fn mark_current_instruction_complete(&self, id: Option<&str>) {
        self.state.set_complete_signal(id);
    }

    /// Run one instruction to a terminal state.
    ///
    /// Never returns an `Err`: rejection (duplicate id, session busy) and
    /// every failure class map into the outcome's status and error fields.
    pub async fn process_instruction(&self, instruction: Instruction) -> RunOutcome {
        if let Err(e) = self.state.start_processing(&instruction.id) {
            warn!(instruction_id = %instruction.id, error = %e, "instruction rejected");
            return RunOutcome {
                id: instruction.id,
                status: RunStatus::Error,
                error: Some(e.to_string()),
                executed: Vec::new(),
                actions: Vec::new(),
                manual_intervention: None,
                current_url: None,
                page_title: None,
            };
        }
        self.state
            .cleanup_old_instructions(self.config.processed_retention());

        let mut instruction = instruction;
        if let Some(clarifier) = &self.clarifier {
            match clarifier.clarify(&instruction.text).await {
                Ok(text) => {
                    if text != instruction.text {
                        debug!(original = %instruction.text, clarified = %text, "instruction clarified");
                        instruction.text = text;
                    }
                }
                Err(e) => warn!(error = %e, "clarifier failed, keeping original text"),
            }
        }

        info!(
            instruction_id = %instruction.id,
            session_id = %self.session.session_id(),
            text = %instruction.text,
            "processing instruction"
        );

        let outcome = self.run_loop(&instruction).await;
        self.state.stop_processing(&instruction.id);

        for observer in &self.observers {
            observer.on_terminal(&outcome);
        }
        outcome
    }

    async fn run_loop(&self, instruction: &Instruction) -> RunOutcome {
        let mut steps: Vec<Step> = Vec::new();
        let mut executed: Vec<String> = Vec::new();
        let mut actions: Vec<Action> = Vec::new();
        let mut classification: Option<Classification> = None;
        let mut iteration: u32 = 0;

        let terminal = loop {
            // Checkpoint. Signals set mid-iteration are observed here and
            // rechecked in `finish`, so external terminals always win over
            // locally computed ones.
            if self.state.current_instruction_id().as_deref() != Some(instruction.id.as_str()) {
                // A complete-signal let another instruction take over the
                // session; this run ends as user-completed.
                let summary = "Instruction marked complete by user".to_string();
                self.push_step(
                    &instruction.id,
                    &mut steps,
                    Step::Complete {
                        summary: summary.clone(),
                        final_answer: None,
                    },
                );
                break Terminal::Completed { summary };
            }
            let signals = self.state.signals();
            if signals.stop {
                break Terminal::Stopped;
            }
            if signals.complete {
                let summary = "Instruction marked complete by user".to_string();
                self.push_step(
                    &instruction.id,
                    &mut steps,
                    Step::Complete {
                        summary: summary.clone(),
                        final_answer: None,
                    },
                );
                break Terminal::Completed { summary };
            }

            if iteration >= self.config.max_steps {
                let request = ManualInterventionRequest {
                    reason: EngineError::MaxSteps {
                        max: self.config.max_steps,
                    }
                    .to_string(),
                    category: "step_limit".to_string(),
                    suggestion: "Break the instruction into smaller steps and retry.".to_string(),
                };
                self.push_step(
                    &instruction.id,
                    &mut steps,
                    Step::ManualIntervention {
                        reason: request.reason.clone(),
                        category: request.category.clone(),
                        suggestion: request.suggestion.clone(),
                    },
                );
                break Terminal::ManualIntervention(request);
            }

            // A navigation that already observably landed does not need
            // another model round-trip to be called done.
            if heuristics::should_auto_complete(&steps) {
                let summary = "Navigation completed successfully".to_string();
                self.push_step(
                    &instruction.id,
                    &mut steps,
                    Step::Complete {
                        summary: summary.clone(),
                        final_answer: None,
                    },
                );
                break Terminal::Completed { summary };
            }

            let dom_content = match self.browser.dom_content(self.config.dom_token_budget).await {
                Ok(dom) => dom,
                Err(e) => break Terminal::Error(format!("Failed to read page content: {e}")),
            };

            let screenshot = if heuristics::should_request_screenshot(
                &steps,
                classification.as_ref().map(|c| c.needs_screenshot),
                iteration == 0,
                &instruction.text,
            ) {
                match self.browser.screenshot().await {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        warn!(error = %e, "screenshot failed, deciding without one");
                        None
                    }
                }
            } else {
                None
            };

            let history = self.session.actions_history().join("\n");
            let recent_start = steps.len().saturating_sub(self.config.recent_steps_window);
            let outcome = self
                .decision
                .decide(DecisionContext {
                    instruction: &instruction.text,
                    dom_content: &dom_content,
                    screenshot: screenshot.as_deref(),
                    recent_steps: &steps[recent_start..],
                    history: &history,
                    classification: classification.as_ref(),
                })
                .await;
            if let Some(fresh) = outcome.classification {
                classification = Some(fresh);
            }
            let decided = outcome.step;
            self.push_step(&instruction.id, &mut steps, decided.clone());

            match decided {
                Step::Complete { summary, .. } => break Terminal::Completed { summary },
                Step::ManualIntervention {
                    reason,
                    category,
                    suggestion,
                } => {
                    break Terminal::ManualIntervention(ManualInterventionRequest {
                        reason,
                        category,
                        suggestion,
                    })
                }
                Step::Thought { .. } => {}
                Step::Action { action, .. } => {
                    actions.push(action.clone());
                    match self.executor.execute(&action).await {
                        Ok(report) => {
                            self.push_step(
                                &instruction.id,
                                &mut steps,
                                Step::Observation {
                                    content: report.observation.clone(),
                                },
                            );
                            if report.success {
                                self.session.add_action(&action.description);
                                executed.push(action.description.clone());
                                if let Some(detection) = &report.change_detection {
                                    if let Some(message) =
                                        self.executor.check_for_task_completion(detection, &action)
                                    {
                                        self.push_step(
                                            &instruction.id,
                                            &mut steps,
                                            Step::Complete {
                                                summary: message.clone(),
                                                final_answer: None,
                                            },
                                        );
                                        break Terminal::Completed { summary: message };
                                    }
                                }
                            }
                        }
                        Err(e) => break Terminal::Error(e.to_string()),
                    }
                }
                // The decision maker never emits observations.
                Step::Observation { .. } => {}
            }

            if let Some(reason) =
                heuristics::detect_stall(&steps, self.config.similarity_threshold)
            {
                let request = ManualInterventionRequest {
                    reason,
                    category: "stall".to_string(),
                    suggestion: "Rephrase the instruction or take over manually.".to_string(),
                };
                self.push_step(
                    &instruction.id,
                    &mut steps,
                    Step::ManualIntervention {
                        reason: request.reason.clone(),
                        category: request.category.clone(),
                        suggestion: request.suggestion.clone(),
                    },
                );
                break Terminal::ManualIntervention(request);
            }

            iteration += 1;
            tokio::time::sleep(self.config.pace_delay()).await;
        };

        self.finish(instruction, terminal, executed, actions).await
    }

    fn push_step(&self, instruction_id: &str, steps: &mut Vec<Step>, step: Step) {
        for observer in &self.observers {
            observer.on_step(instruction_id, &step);
        }
        steps.push(step);
    }

    /// Map a terminal state onto the externally visible outcome, attaching
    /// the final page context on a best-effort basis.
    async fn finish(
        &self,
        instruction: &Instruction,
        terminal: Terminal,
        executed: Vec<String>,
        actions: Vec<Action>,
    ) -> RunOutcome {
        let context = self.browser.page_context().await.ok();
        let (current_url, page_title) = match context {
            Some(ctx) => (Some(ctx.current_url), Some(ctx.page_title)),
            None => (None, None),
        };

        // Signals raised after the last checkpoint still take precedence
        // over the locally computed terminal. A preempted run no longer owns
        // the signal state, so it keeps its own terminal.
        let signals = if self.state.current_instruction_id().as_deref()
            == Some(instruction.id.as_str())
        {
            self.state.signals()
        } else {
            SignalSnapshot::default()
        };
        let terminal = if signals.stop {
            Terminal::Stopped
        } else if signals.complete && !matches!(terminal, Terminal::Completed { .. }) {
            Terminal::Completed {
                summary: "Instruction marked complete by user".to_string(),
            }
        } else {
            terminal
        };

        let (status, error, manual_intervention) = match terminal {
            Terminal::Completed { summary } => {
                info!(instruction_id = %instruction.id, %summary, "instruction completed");
                (RunStatus::Success, None, None)
            }
            Terminal::ManualIntervention(request) => (
                RunStatus::ManualInterventionRequired,
                None,
                Some(request),
            ),
            Terminal::Stopped => (
                RunStatus::Error,
                Some(EngineError::Stopped.to_string()),
                None,
            ),
            Terminal::Error(message) => (RunStatus::Error, Some(message), None),
        };

        RunOutcome {
            id: instruction.id.clone(),
            status,
            error,
            executed,
            actions,
            manual_intervention,
            current_url,
            page_title,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySession;
    use crate::testing::{MockBrowser, MockModelClient};
    use serde_json::json;
    use std::sync::Mutex;

    fn classify_simple(model: MockModelClient) -> MockModelClient {
        model.with_tool_call(
            "classifyInstruction",
            json!({"complexity": "simple", "needsScreenshot": false}),
        )
    }

    fn engine(model: MockModelClient, browser: MockBrowser) -> Engine {
        Engine::new(
            Arc::new(model),
            Arc::new(browser),
            Arc::new(InMemorySession::new("session-1")),
            EngineConfig::default(),
        )
        .expect("default config is valid")
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigate_then_complete() {
        let model = classify_simple(MockModelClient::new())
            .with_tool_call(
                "navigate",
                json!({"url": "https://a.example", "reason": "open it"}),
            )
            .with_tool_call("complete", json!({"summary": "done"}));
        let browser = MockBrowser::new();
        let engine = engine(model, browser.clone());

        let outcome = engine
            .process_instruction(Instruction::new("go to a.example", "session-1"))
            .await;

        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(browser.navigations(), vec!["https://a.example"]);
        assert_eq!(outcome.executed.len(), 1);
        assert!(outcome.executed[0].starts_with("Navigate to https://a.example"));
        assert!(!engine.is_currently_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_steps_yields_manual_intervention() {
        // Productive-looking but endless: alternating type/press-enter
        // actions keep succeeding without ever completing, so none of the
        // stall rules fire and the step budget is what stops the run.
        let mut model = classify_simple(MockModelClient::new());
        for i in 0..20 {
            if i % 2 == 0 {
                model = model.with_tool_call(
                    "type",
                    json!({
                        "selectors": ["input[name=q]"],
                        "value": format!("query {i}"),
                        "reason": format!("refine search {i}")
                    }),
                );
            } else {
                model = model.with_tool_call("pressEnter", json!({"reason": format!("submit {i}")}));
            }
        }
        let engine = engine(model.clone(), MockBrowser::new());

        let outcome = engine
            .process_instruction(Instruction::new("do something vague", "session-1"))
            .await;

        assert_eq!(outcome.status, RunStatus::ManualInterventionRequired);
        let request = outcome.manual_intervention.expect("request present");
        assert!(request.reason.contains("Maximum reasoning steps reached"));
        // The budget counts decision iterations, one model call each, not
        // recorded sequence entries (an action iteration records two).
        assert_eq!(model.chat_calls(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_instruction_rejected() {
        let model = classify_simple(MockModelClient::new())
            .with_tool_call("complete", json!({"summary": "done"}));
        let engine = engine(model, MockBrowser::new());

        let instruction = Instruction::new("open example.com", "session-1");
        let first = engine.process_instruction(instruction.clone()).await;
        assert_eq!(first.status, RunStatus::Success);

        let second = engine.process_instruction(instruction).await;
        assert_eq!(second.status, RunStatus::Error);
        assert!(second.error.unwrap().contains("already"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_action_error_aborts_run() {
        let model = classify_simple(MockModelClient::new()).with_tool_call(
            "navigate",
            json!({"url": "https://a.example", "reason": "open it"}),
        );
        let browser = MockBrowser::new().with_hard_failure("browser crashed");
        let engine = engine(model, browser);

        let outcome = engine
            .process_instruction(Instruction::new("go to a.example", "session-1"))
            .await;

        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.error.unwrap().contains("browser crashed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_failure_continues_then_completes() {
        let model = classify_simple(MockModelClient::new())
            .with_tool_call("click", json!({"selectors": ["#gone"], "reason": "try it"}))
            .with_tool_call("complete", json!({"summary": "gave up clicking, task done"}));
        let browser = MockBrowser::new().with_selector_failure("element not found");
        let engine = engine(model, browser.clone());

        let outcome = engine
            .process_instruction(Instruction::new("click the thing", "session-1"))
            .await;

        // Selector exhaustion is recorded, not fatal.
        assert_eq!(outcome.status, RunStatus::Success);
        assert!(outcome.executed.is_empty());
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(browser.click_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_text_reply_is_processing_error() {
        let model = classify_simple(MockModelClient::new()).with_text("let me think about this");
        let engine = engine(model, MockBrowser::new());

        let outcome = engine
            .process_instruction(Instruction::new("open example.com", "session-1"))
            .await;

        assert_eq!(outcome.status, RunStatus::ManualInterventionRequired);
        assert_eq!(
            outcome.manual_intervention.unwrap().category,
            "processing_error"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_carries_final_page_context() {
        let model = classify_simple(MockModelClient::new())
            .with_tool_call("complete", json!({"summary": "done"}));
        let browser = MockBrowser::new().with_url("https://final.example");
        let engine = engine(model, browser);

        let outcome = engine
            .process_instruction(Instruction::new("noop", "session-1"))
            .await;

        assert_eq!(outcome.current_url.as_deref(), Some("https://final.example"));
        assert_eq!(outcome.page_title.as_deref(), Some("Mock Page"));
    }

    #[derive(Default)]
    struct RecordingObserver {
        steps: Mutex<Vec<String>>,
    }

    impl StepObserver for RecordingObserver {
        fn on_step(&self, _instruction_id: &str, step: &Step) {
            let label = match step {
                Step::Thought { .. } => "thought",
                Step::Action { .. } => "action",
                Step::Observation { .. } => "observation",
                Step::Complete { .. } => "complete",
                Step::ManualIntervention { .. } => "manual_intervention",
            };
            self.steps.lock().unwrap().push(label.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_see_every_step() {
        let model = classify_simple(MockModelClient::new())
            .with_tool_call(
                "navigate",
                json!({"url": "https://a.example", "reason": "open it"}),
            )
            .with_tool_call("complete", json!({"summary": "done"}));
        let observer = Arc::new(RecordingObserver::default());
        let engine = Engine::new(
            Arc::new(model),
            Arc::new(MockBrowser::new()),
            Arc::new(InMemorySession::new("session-1")),
            EngineConfig::default(),
        )
        .unwrap()
        .with_observer(Arc::clone(&observer) as Arc<dyn StepObserver>);

        engine
            .process_instruction(Instruction::new("go to a.example", "session-1"))
            .await;

        let seen = observer.steps.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec!["thought", "action", "observation", "complete"]
        );
    }

    struct PrefixClarifier;

    #[async_trait::async_trait]
    impl InstructionClarifier for PrefixClarifier {
        async fn clarify(&self, text: &str) -> anyhow::Result<String> {
            Ok(format!("on the current page, {text}"))
        }
    }

    struct FailingClarifier;

    #[async_trait::async_trait]
    impl InstructionClarifier for FailingClarifier {
        async fn clarify(&self, _text: &str) -> anyhow::Result<String> {
            anyhow::bail!("clarifier backend unavailable")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clarifier_rewrites_instruction_text() {
        let model = classify_simple(MockModelClient::new())
            .with_tool_call("complete", json!({"summary": "done"}));
        let engine = Engine::new(
            Arc::new(model.clone()),
            Arc::new(MockBrowser::new()),
            Arc::new(InMemorySession::new("session-1")),
            EngineConfig::default(),
        )
        .unwrap()
        .with_clarifier(Arc::new(PrefixClarifier));

        engine
            .process_instruction(Instruction::new("click the link", "session-1"))
            .await;

        let prompt = &model.requests()[0].messages[1].content;
        assert!(prompt.contains("on the current page, click the link"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clarifier_failure_keeps_original_text() {
        let model = classify_simple(MockModelClient::new())
            .with_tool_call("complete", json!({"summary": "done"}));
        let engine = Engine::new(
            Arc::new(model.clone()),
            Arc::new(MockBrowser::new()),
            Arc::new(InMemorySession::new("session-1")),
            EngineConfig::default(),
        )
        .unwrap()
        .with_clarifier(Arc::new(FailingClarifier));

        let outcome = engine
            .process_instruction(Instruction::new("click the link", "session-1"))
            .await;

        assert_eq!(outcome.status, RunStatus::Success);
        let prompt = &model.requests()[0].messages[1].content;
        assert!(prompt.contains("Instruction: click the link"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected_at_construction() {
        let config = EngineConfig {
            max_steps: 0,
            ..EngineConfig::default()
        };
        let result = Engine::new(
            Arc::new(MockModelClient::new()),
            Arc::new(MockBrowser::new()),
            Arc::new(InMemorySession::new("session-1")),
            config,
        );
        assert!(matches!(
            result,
            Err(EngineError::InvalidConfig { .. })
        ));
    }
}
