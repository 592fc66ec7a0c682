//! Progress heuristics over the step sequence.
//!
//! Everything here is a pure function over `&[Step]` so the loop can call
//! it at fixed points and the tests can drive it with hand-built sequences.
//! Completion in this system is heuristic, not explicit: the model rarely
//! says "done" on its own, so the loop watches the step sequence for both
//! stalls (no forward progress) and obvious finishes (a navigation that
//! landed).

use regex::Regex;

use crate::instruction::{ActionKind, Step};

/// How many trailing steps the stall rules inspect.
const STALL_WINDOW: usize = 6;
/// How many trailing action steps the repetition rule inspects.
const ACTION_WINDOW: usize = 4;
/// How many trailing steps must lack a success observation to flag a stall.
const NO_SUCCESS_WINDOW: usize = 8;
/// How many trailing steps the auto-complete rule inspects.
const AUTO_COMPLETE_WINDOW: usize = 5;

/// Word-set Jaccard similarity between two texts.
///
/// Case-insensitive; tokens are whitespace-separated words. Returns 1.0 for
/// two empty texts.
#[must_use]
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<String> =
        a.split_whitespace().map(str::to_lowercase).collect();
    let set_b: std::collections::HashSet<String> =
        b.split_whitespace().map(str::to_lowercase).collect();

    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Detect a stalled run.
///
/// Evaluated once at least [`STALL_WINDOW`] steps exist; returns a
/// human-readable reason when any rule fires:
///
/// 1. Three or more classification-like thoughts in the last six steps.
/// 2. An action kind repeating three or more times among the last four
///    action steps, or the last few action steps being nothing but scrolls.
/// 3. Repetitive thoughts: of the last four thought steps, at least two of
///    the trailing three exceed `similarity_threshold` Jaccard similarity
///    against the first.
/// 4. No success observation anywhere in the last eight steps (once eight
///    steps exist).
#[must_use]
pub fn detect_stall(steps: &[Step], similarity_threshold: f64) -> Option<String> {
    if steps.len() < STALL_WINDOW {
        return None;
    }

    let recent = &steps[steps.len() - STALL_WINDOW..];

    // Rule 1: thinking in circles about what kind of task this is.
    let classification_thoughts = recent
        .iter()
        .filter(|s| s.is_classification_thought())
        .count();
    if classification_thoughts >= 3 {
        return Some(format!(
            "{classification_thoughts} of the last {STALL_WINDOW} steps are classification thoughts"
        ));
    }

    // Rule 2: repeating the same action without getting anywhere.
    let recent_actions: Vec<ActionKind> = steps
        .iter()
        .rev()
        .filter_map(|s| s.action().map(|a| a.kind))
        .take(ACTION_WINDOW)
        .collect();
    for kind in [
        ActionKind::Navigate,
        ActionKind::Click,
        ActionKind::ClickByPosition,
        ActionKind::Type,
        ActionKind::PressEnter,
        ActionKind::Scroll,
        ActionKind::Wait,
    ] {
        let repeats = recent_actions.iter().filter(|k| **k == kind).count();
        if repeats >= 3 {
            return Some(format!(
                "action '{kind}' repeated {repeats} times in the last {} actions",
                recent_actions.len()
            ));
        }
    }
    if recent_actions.len() >= 2 && recent_actions.iter().all(|k| *k == ActionKind::Scroll) {
        return Some(format!(
            "last {} actions are all scrolls",
            recent_actions.len()
        ));
    }

    // Rule 3: restating the same thought.
    let thoughts: Vec<&str> = steps
        .iter()
        .rev()
        .filter_map(Step::thought_content)
        .take(ACTION_WINDOW)
        .collect();
    if thoughts.len() == ACTION_WINDOW {
        // `thoughts` is newest-first; the reference is the oldest of the four.
        let reference = thoughts[ACTION_WINDOW - 1];
        let similar = thoughts[..ACTION_WINDOW - 1]
            .iter()
            .filter(|t| jaccard_similarity(t, reference) > similarity_threshold)
            .count();
        if similar >= 2 {
            return Some("repeating near-identical thoughts".to_string());
        }
    }

    // Rule 4: nothing has worked for a while.
    if steps.len() >= NO_SUCCESS_WINDOW {
        let tail = &steps[steps.len() - NO_SUCCESS_WINDOW..];
        if !tail.iter().any(Step::is_success_observation) {
            return Some(format!(
                "no successful action in the last {NO_SUCCESS_WINDOW} steps"
            ));
        }
    }

    None
}

/// Auto-complete check for simple navigation tasks.
///
/// Returns true when, within the last five steps, a navigational action
/// (navigate, click, coordinate click) is chronologically followed by a
/// success observation with no intervening failure. Lets the loop mark the
/// task done without burning another model call.
#[must_use]
pub fn should_auto_complete(steps: &[Step]) -> bool {
    let start = steps.len().saturating_sub(AUTO_COMPLETE_WINDOW);
    let window = &steps[start..];

    for (i, step) in window.iter().enumerate() {
        let Some(action) = step.action() else {
            continue;
        };
        if !action.kind.is_navigational() {
            continue;
        }
        for later in &window[i + 1..] {
            if later.is_failure_observation() {
                break;
            }
            if later.is_success_observation() {
                return true;
            }
        }
    }
    false
}

/// Layered screenshot-request policy.
///
/// In order of precedence:
/// 1. Two or more consecutive trailing failure observations force one.
/// 2. A failure as the most recent step forces one.
/// 3. The cached classification's prediction is used when present.
/// 4. On the first iteration only, lexically simple navigation instructions
///    skip the screenshot.
/// 5. Otherwise default to requesting one.
#[must_use]
pub fn should_request_screenshot(
    steps: &[Step],
    cached_needs_screenshot: Option<bool>,
    is_first_iteration: bool,
    instruction_text: &str,
) -> bool {
    if consecutive_trailing_failures(steps) >= 2 {
        return true;
    }
    if steps.last().is_some_and(Step::is_failure_observation) {
        return true;
    }
    if let Some(needs) = cached_needs_screenshot {
        return needs;
    }
    if is_first_iteration && is_simple_navigation(instruction_text) {
        return false;
    }
    true
}

/// Count consecutive failure observations at the tail of the sequence,
/// skipping interleaved non-observation steps.
#[must_use]
pub fn consecutive_trailing_failures(steps: &[Step]) -> usize {
    let mut count = 0;
    for step in steps.iter().rev() {
        if let Step::Observation { .. } = step {
            if step.is_failure_observation() {
                count += 1;
            } else {
                break;
            }
        }
    }
    count
}

/// Lexical check for pure-navigation instructions like "go to example.com".
#[must_use]
pub fn is_simple_navigation(text: &str) -> bool {
    let pattern = Regex::new(
        r"(?i)^\s*(go to|open|navigate to|visit|load)\s+(https?://)?[\w.-]+(\.[a-z]{2,})(/\S*)?\s*$",
    )
    .expect("static regex");
    pattern.is_match(text)
}
