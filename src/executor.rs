//! Action execution against the browser collaborator.
//!
//! [`ActionExecutor`] turns a decided [`Action`] into browser calls, wraps
//! navigational actions in DOM-mutation observation, and applies the
//! completion heuristic afterwards. Failures are split into two classes:
//! selector exhaustion on click/type is soft (returned as a failed
//! [`ExecutionReport`], the loop records it and continues), everything else
//! thrown by the browser is hard and aborts the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

use crate::browser::{BrowserService, ChangeDetection, SelectorOutcome};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::instruction::{Action, ActionKind};

/// Scroll distance used when the model omits an amount.
const DEFAULT_SCROLL_AMOUNT: i64 = 300;
/// Wait duration used when the model omits one.
const DEFAULT_WAIT_MS: u64 = 1000;

/// Report for one executed action.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Whether the action landed.
    pub success: bool,
    /// Observation text for the step sequence; prefixed "Success"/"Failed".
    pub observation: String,
    /// Wall-clock execution time.
    pub duration: Duration,
    /// Present for actions that ran under mutation observation.
    pub change_detection: Option<ChangeDetection>,
    /// Set on soft failures whose error message suggests the element exists
    /// but selectors cannot reach it, so a coordinate click may.
    pub coordinate_fallback: bool,
}

impl ExecutionReport {
    fn success(observation: String, duration: Duration, detection: Option<ChangeDetection>) -> Self {
        Self {
            success: true,
            observation,
            duration,
            change_detection: detection,
            coordinate_fallback: false,
        }
    }

    fn soft_failure(last_error: &str, duration: Duration) -> Self {
        Self {
            success: false,
            observation: format!("Failed: {last_error}"),
            duration,
            change_detection: None,
            coordinate_fallback: suggests_coordinate_fallback(last_error),
        }
    }
}

/// Whether a selector-exhaustion error message suggests retrying by
/// viewport coordinates instead.
#[must_use]
pub fn suggests_coordinate_fallback(message: &str) -> bool {
    let pattern = Regex::new(
        r"(?i)(outside.{0,20}viewport|not\s+visible|timeout|timed\s+out|not\s+stable|detached|not\s+attached)",
    )
    .expect("static regex");
    pattern.is_match(message)
}

/// Executes decided actions against the browser collaborator.
pub struct ActionExecutor {
    browser: Arc<dyn BrowserService>,
    config: EngineConfig,
}

impl ActionExecutor {
    /// Create an executor over the given browser session.
    #[must_use]
    pub fn new(browser: Arc<dyn BrowserService>, config: EngineConfig) -> Self {
        Self { browser, config }
    }

    /// Execute one action.
    ///
    /// Navigate/Click/Type/PressEnter run under mutation observation:
    /// snapshot the URL, install the tracker, run, settle, read back, and
    /// compare URLs. A read-back failure caused by the execution context
    /// being destroyed (the page navigated) synthesizes a single
    /// `navigation` change record instead of failing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HardAction`] for any browser failure other
    /// than selector exhaustion; selector exhaustion comes back as an
    /// `Ok` report with `success == false`.
    pub async fn execute(&self, action: &Action) -> Result<ExecutionReport> {
        let started = Instant::now();
        debug!(kind = %action.kind, description = %action.description, "executing action");

        if action.kind.is_observed() {
            self.execute_observed(action, started).await
        } else {
            self.execute_direct(action, started).await
        }
    }

    async fn execute_observed(
        &self,
        action: &Action,
        started: Instant,
    ) -> Result<ExecutionReport> {
        let before = self
            .browser
            .page_context()
            .await
            .map_err(|e| EngineError::hard_action(e.to_string()))?;
        self.browser
            .begin_change_observation()
            .await
            .map_err(|e| EngineError::hard_action(e.to_string()))?;

        let dispatch = self.dispatch(action).await?;
        let detail = match dispatch {
            Dispatch::Done(detail) => detail,
            Dispatch::SelectorExhausted(last_error) => {
                warn!(kind = %action.kind, error = %last_error, "selector list exhausted");
                return Ok(ExecutionReport::soft_failure(&last_error, started.elapsed()));
            }
        };

        tokio::time::sleep(self.config.settle_delay()).await;

        let after_url = self
            .browser
            .page_context()
            .await
            .map(|ctx| ctx.current_url)
            .unwrap_or_else(|_| before.current_url.clone());

        let detection = match self.browser.collect_changes().await {
            Ok(mutations) => {
                ChangeDetection::from_mutations(mutations, before.current_url, after_url)
            }
            Err(e) if is_context_destroyed(&e.to_string()) => {
                debug!("mutation read-back lost to navigation; synthesizing change record");
                ChangeDetection::synthesized_navigation(before.current_url, after_url)
            }
            Err(e) => return Err(EngineError::hard_action(e.to_string())),
        };

        let observation = format!(
            "Success: {detail} ({} change(s) observed{})",
            detection.change_count,
            if detection.url_changed {
                format!(", URL now {}", detection.after_url)
            } else {
                String::new()
            }
        );
        Ok(ExecutionReport::success(
            observation,
            started.elapsed(),
            Some(detection),
        ))
    }

    async fn execute_direct(&self, action: &Action, started: Instant) -> Result<ExecutionReport> {
        let dispatch = self.dispatch(action).await?;
        match dispatch {
            Dispatch::Done(detail) => Ok(ExecutionReport::success(
                format!("Success: {detail}"),
                started.elapsed(),
                None,
            )),
            Dispatch::SelectorExhausted(last_error) => {
                Ok(ExecutionReport::soft_failure(&last_error, started.elapsed()))
            }
        }
    }

    async fn dispatch(&self, action: &Action) -> Result<Dispatch> {
        match action.kind {
            ActionKind::Navigate => {
                let url = action
                    .url
                    .as_deref()
                    .ok_or_else(|| EngineError::hard_action("navigate action missing url"))?;
                self.browser
                    .navigate(url)
                    .await
                    .map_err(|e| EngineError::hard_action(e.to_string()))?;
                Ok(Dispatch::Done(format!("navigated to {url}")))
            }
            ActionKind::Click => {
                let outcome = self
                    .browser
                    .click_with_selectors(
                        &action.selectors,
                        Duration::from_millis(self.config.click_exist_timeout_ms),
                        Duration::from_millis(self.config.click_action_timeout_ms),
                    )
                    .await
                    .map_err(|e| EngineError::hard_action(e.to_string()))?;
                Ok(Self::dispatch_from_outcome(outcome, "clicked element"))
            }
            ActionKind::Type => {
                let value = action.value.as_deref().unwrap_or_default();
                let outcome = self
                    .browser
                    .type_with_selectors(
                        &action.selectors,
                        value,
                        Duration::from_millis(self.config.type_exist_timeout_ms),
                        Duration::from_millis(self.config.type_fill_timeout_ms),
                    )
                    .await
                    .map_err(|e| EngineError::hard_action(e.to_string()))?;
                Ok(Self::dispatch_from_outcome(outcome, "typed text"))
            }
            ActionKind::PressEnter => {
                self.browser
                    .press_enter()
                    .await
                    .map_err(|e| EngineError::hard_action(e.to_string()))?;
                Ok(Dispatch::Done("pressed Enter".to_string()))
            }
            ActionKind::ClickByPosition => {
                let (x, y) = match (action.x, action.y) {
                    (Some(x), Some(y)) => (x, y),
                    _ => {
                        return Err(EngineError::hard_action(
                            "clickByPosition action missing coordinates",
                        ))
                    }
                };
                self.browser
                    .click_coordinates(x, y)
                    .await
                    .map_err(|e| EngineError::hard_action(e.to_string()))?;
                Ok(Dispatch::Done(format!("clicked at ({x}, {y})")))
            }
            ActionKind::Scroll => {
                let direction = action.direction.as_deref().unwrap_or("down");
                let amount = action.amount.unwrap_or(DEFAULT_SCROLL_AMOUNT);
                self.browser
                    .scroll(direction, amount)
                    .await
                    .map_err(|e| EngineError::hard_action(e.to_string()))?;
                Ok(Dispatch::Done(format!("scrolled {direction} by {amount}px")))
            }
            ActionKind::Wait => {
                let ms = action.duration_ms.unwrap_or(DEFAULT_WAIT_MS);
                self.browser
                    .wait(ms)
                    .await
                    .map_err(|e| EngineError::hard_action(e.to_string()))?;
                Ok(Dispatch::Done(format!("waited {ms}ms")))
            }
        }
    }

    fn dispatch_from_outcome(outcome: SelectorOutcome, verb: &str) -> Dispatch {
        if outcome.success {
            let selector = outcome.used_selector.unwrap_or_default();
            Dispatch::Done(format!("{verb} using selector '{selector}'"))
        } else {
            Dispatch::SelectorExhausted(
                outcome
                    .error
                    .unwrap_or_else(|| "all selectors failed".to_string()),
            )
        }
    }

    /// Completion heuristic, evaluated only for successful clicks.
    ///
    /// A URL change means the click navigated somewhere and the task step
    /// is done; a same-URL click that caused a large structural change
    /// (count at or above the mutation threshold, with content added or
    /// removed) is treated the same way. Anything subtler is deferred to
    /// the decision model.
    #[must_use]
    pub fn check_for_task_completion(
        &self,
        detection: &ChangeDetection,
        action: &Action,
    ) -> Option<String> {
        if action.kind != ActionKind::Click {
            return None;
        }
        if detection.url_changed {
            return Some(format!(
                "Click navigated from {} to {}",
                detection.before_url, detection.after_url
            ));
        }
        let structural = detection
            .change_types
            .iter()
            .any(|t| t == "content_added" || t == "content_removed");
        if detection.change_count >= self.config.mutation_threshold && structural {
            return Some(format!(
                "Click caused {} structural change(s) on {}",
                detection.change_count, detection.after_url
            ));
        }
        None
    }
}

enum Dispatch {
    Done(String),
    SelectorExhausted(String),
}

fn is_context_destroyed(message: &str) -> bool {
    message.to_lowercase().contains("execution context was destroyed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MutationSummary;
    use crate::testing::MockBrowser;

    fn executor(browser: MockBrowser) -> ActionExecutor {
        ActionExecutor::new(Arc::new(browser), EngineConfig::default())
    }

    fn click_action(selectors: &[&str]) -> Action {
        let mut action = Action::new(ActionKind::Click, "Click something");
        action.selectors = selectors.iter().map(|s| s.to_string()).collect();
        action
    }

    #[test]
    fn test_completion_on_url_change() {
        let exec = executor(MockBrowser::new());
        let detection = ChangeDetection {
            has_changes: true,
            change_count: 0,
            change_types: vec![],
            url_changed: true,
            before_url: "https://a.example".to_string(),
            after_url: "https://b.example".to_string(),
        };
        let message = exec
            .check_for_task_completion(&detection, &click_action(&["#a"]))
            .unwrap();
        assert!(message.contains("https://b.example"));
    }

    #[test]
    fn test_completion_on_heavy_structural_change() {
        let exec = executor(MockBrowser::new());
        let detection = ChangeDetection {
            has_changes: true,
            change_count: 35,
            change_types: vec!["content_added".to_string()],
            url_changed: false,
            before_url: "https://a.example".to_string(),
            after_url: "https://a.example".to_string(),
        };
        assert!(exec
            .check_for_task_completion(&detection, &click_action(&["#a"]))
            .is_some());
    }

    #[test]
    fn test_no_completion_below_threshold() {
        let exec = executor(MockBrowser::new());
        let detection = ChangeDetection {
            has_changes: true,
            change_count: 29,
            change_types: vec!["content_added".to_string()],
            url_changed: false,
            before_url: "https://a.example".to_string(),
            after_url: "https://a.example".to_string(),
        };
        assert!(exec
            .check_for_task_completion(&detection, &click_action(&["#a"]))
            .is_none());
    }

    #[test]
    fn test_no_completion_without_structural_types() {
        let exec = executor(MockBrowser::new());
        let detection = ChangeDetection {
            has_changes: true,
            change_count: 50,
            change_types: vec!["attribute_changed".to_string()],
            url_changed: false,
            before_url: "https://a.example".to_string(),
            after_url: "https://a.example".to_string(),
        };
        assert!(exec
            .check_for_task_completion(&detection, &click_action(&["#a"]))
            .is_none());
    }

    #[test]
    fn test_completion_only_evaluated_for_clicks() {
        let exec = executor(MockBrowser::new());
        let detection = ChangeDetection {
            has_changes: true,
            change_count: 100,
            change_types: vec!["content_added".to_string()],
            url_changed: true,
            before_url: "https://a.example".to_string(),
            after_url: "https://b.example".to_string(),
        };
        let navigate = Action::new(ActionKind::Navigate, "Navigate somewhere");
        assert!(exec.check_for_task_completion(&detection, &navigate).is_none());
    }

    #[test]
    fn test_coordinate_fallback_patterns() {
        assert!(suggests_coordinate_fallback("element is outside of the viewport"));
        assert!(suggests_coordinate_fallback("Timeout 3000ms exceeded"));
        assert!(suggests_coordinate_fallback("element is not visible"));
        assert!(suggests_coordinate_fallback("node is detached from document"));
        assert!(!suggests_coordinate_fallback("no element matches selector"));
    }

    #[tokio::test]
    async fn test_successful_click_reports_changes() {
        let browser = MockBrowser::new().with_mutations(MutationSummary {
            count: 5,
            types: vec!["content_added".to_string()],
        });
        let exec = executor(browser);

        let report = exec.execute(&click_action(&["#a"])).await.unwrap();
        assert!(report.success);
        assert!(report.observation.starts_with("Success"));
        let detection = report.change_detection.unwrap();
        assert_eq!(detection.change_count, 5);
        assert!(!detection.url_changed);
    }

    #[tokio::test]
    async fn test_selector_exhaustion_is_soft() {
        let browser = MockBrowser::new().with_selector_failure("Timeout 1000ms exceeded");
        let exec = executor(browser);

        let report = exec.execute(&click_action(&["#a", "#b"])).await.unwrap();
        assert!(!report.success);
        assert!(report.observation.starts_with("Failed"));
        assert!(report.coordinate_fallback);
    }

    #[tokio::test]
    async fn test_context_destroyed_synthesizes_navigation() {
        let browser = MockBrowser::new()
            .with_collect_error("Execution context was destroyed, most likely because of a navigation")
            .with_url_after_actions("https://b.example");
        let exec = executor(browser);

        let report = exec.execute(&click_action(&["#a"])).await.unwrap();
        assert!(report.success);
        let detection = report.change_detection.unwrap();
        assert_eq!(detection.change_types, vec!["navigation".to_string()]);
        assert!(detection.url_changed);
    }

    #[tokio::test]
    async fn test_hard_error_propagates() {
        let browser = MockBrowser::new().with_hard_failure("tab crashed");
        let exec = executor(browser);

        let err = exec.execute(&click_action(&["#a"])).await.unwrap_err();
        assert!(matches!(err, EngineError::HardAction { .. }));
    }

    #[tokio::test]
    async fn test_scroll_runs_without_observation() {
        let browser = MockBrowser::new();
        let exec = executor(browser);

        let mut action = Action::new(ActionKind::Scroll, "Scroll down");
        action.direction = Some("down".to_string());
        action.amount = Some(500);

        let report = exec.execute(&action).await.unwrap();
        assert!(report.success);
        assert!(report.change_detection.is_none());
        assert!(report.observation.contains("scrolled down by 500px"));
    }
}
