//! Browser collaborator seam.
//!
//! The engine never drives a browser directly; it talks to an implementation
//! of [`BrowserService`] that owns the tab, the DOM pipeline, and the
//! mutation tracker. The trait mirrors the backend's surface: selector
//! fallback clicking/typing, coordinate clicks, scrolling, DOM snapshots
//! under a token budget, and paired begin/collect mutation observation.
//!
//! DOM-mutation observation is split into `begin_change_observation` /
//! `collect_changes` so the executor can run the action between the two
//! calls while the collaborator keeps ownership of the tracker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Viewport dimensions reported by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Current page context reported by the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContext {
    pub current_url: String,
    pub page_title: String,
    pub viewport: Viewport,
}

/// Outcome of a selector-fallback click or type dispatch.
///
/// The backend tries each selector in order and stops at the first that
/// works; on full exhaustion `success` is false and `error` carries the
/// last underlying error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorOutcome {
    pub success: bool,
    /// The selector that worked, when one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_selector: Option<String>,
    /// The last error seen, when every selector failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SelectorOutcome {
    /// A successful dispatch through `selector`.
    #[must_use]
    pub fn success(selector: impl Into<String>) -> Self {
        Self {
            success: true,
            used_selector: Some(selector.into()),
            error: None,
        }
    }

    /// Exhaustion of the whole selector list.
    #[must_use]
    pub fn exhausted(last_error: impl Into<String>) -> Self {
        Self {
            success: false,
            used_selector: None,
            error: Some(last_error.into()),
        }
    }
}

/// Raw mutation read-back from the tracker: how many mutation records fired
/// and which categories they fell into (e.g. `content_added`,
/// `attribute_changed`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationSummary {
    pub count: u32,
    pub types: Vec<String>,
}

/// Per-action change detection, composed by the executor from the mutation
/// read-back and the before/after URLs. Ephemeral; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDetection {
    pub has_changes: bool,
    pub change_count: u32,
    pub change_types: Vec<String>,
    pub url_changed: bool,
    pub before_url: String,
    pub after_url: String,
}

impl ChangeDetection {
    /// Compose a detection result from a mutation read-back and URLs.
    #[must_use]
    pub fn from_mutations(
        mutations: MutationSummary,
        before_url: impl Into<String>,
        after_url: impl Into<String>,
    ) -> Self {
        let before_url = before_url.into();
        let after_url = after_url.into();
        let url_changed = before_url != after_url;
        Self {
            has_changes: mutations.count > 0 || url_changed,
            change_count: mutations.count,
            change_types: mutations.types,
            url_changed,
            before_url,
            after_url,
        }
    }

    /// Synthesize a single `navigation` change record. Used when the
    /// mutation read-back fails because the execution context was destroyed
    /// by a page navigation.
    #[must_use]
    pub fn synthesized_navigation(
        before_url: impl Into<String>,
        after_url: impl Into<String>,
    ) -> Self {
        let before_url = before_url.into();
        let after_url = after_url.into();
        let url_changed = before_url != after_url;
        Self {
            has_changes: true,
            change_count: 1,
            change_types: vec!["navigation".to_string()],
            url_changed,
            before_url,
            after_url,
        }
    }
}

/// Abstraction over the remotely-controlled browser session.
///
/// One implementation per live session; the engine holds it behind
/// `Arc<dyn BrowserService>` and awaits each call in turn.
///
/// # Errors
///
/// Every method may fail if the tab has crashed or the transport dropped.
/// Selector-level failures on click/type are reported in-band through
/// [`SelectorOutcome`], not as `Err`.
#[async_trait]
pub trait BrowserService: Send + Sync {
    /// Load a URL in the session's tab.
    async fn navigate(&self, url: &str) -> anyhow::Result<()>;

    /// Click the first selector in `selectors` that resolves, trying each
    /// in order under the given existence/click budgets.
    async fn click_with_selectors(
        &self,
        selectors: &[String],
        exist_timeout: Duration,
        click_timeout: Duration,
    ) -> anyhow::Result<SelectorOutcome>;

    /// Fill the first selector in `selectors` that resolves with `value`.
    async fn type_with_selectors(
        &self,
        selectors: &[String],
        value: &str,
        exist_timeout: Duration,
        fill_timeout: Duration,
    ) -> anyhow::Result<SelectorOutcome>;

    /// Click at viewport coordinates.
    async fn click_coordinates(&self, x: f64, y: f64) -> anyhow::Result<()>;

    /// Press the Enter key in the focused element.
    async fn press_enter(&self) -> anyhow::Result<()>;

    /// Scroll the page.
    async fn scroll(&self, direction: &str, amount: i64) -> anyhow::Result<()>;

    /// Wait the given number of milliseconds inside the page.
    async fn wait(&self, ms: u64) -> anyhow::Result<()>;

    /// Capture a screenshot of the current viewport.
    async fn screenshot(&self) -> anyhow::Result<Vec<u8>>;

    /// Fetch a minimized DOM snapshot within `token_budget` tokens.
    /// Truncation policy is owned by the collaborator.
    async fn dom_content(&self, token_budget: usize) -> anyhow::Result<String>;

    /// Report the current URL, title, and viewport.
    async fn page_context(&self) -> anyhow::Result<PageContext>;

    /// Install a fresh mutation tracker on the current page.
    async fn begin_change_observation(&self) -> anyhow::Result<()>;

    /// Read back the mutation count and categories recorded since
    /// [`begin_change_observation`](Self::begin_change_observation).
    ///
    /// Fails with a message containing "execution context was destroyed"
    /// when the page navigated away underneath the tracker.
    async fn collect_changes(&self) -> anyhow::Result<MutationSummary>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_detection_from_mutations() {
        let detection = ChangeDetection::from_mutations(
            MutationSummary {
                count: 12,
                types: vec!["content_added".to_string()],
            },
            "https://a.example",
            "https://a.example",
        );
        assert!(detection.has_changes);
        assert_eq!(detection.change_count, 12);
        assert!(!detection.url_changed);
    }

    #[test]
    fn test_change_detection_url_change_counts_as_change() {
        let detection = ChangeDetection::from_mutations(
            MutationSummary::default(),
            "https://a.example",
            "https://b.example",
        );
        assert!(detection.has_changes);
        assert!(detection.url_changed);
        assert_eq!(detection.change_count, 0);
    }

    #[test]
    fn test_synthesized_navigation() {
        let detection =
            ChangeDetection::synthesized_navigation("https://a.example", "https://b.example");
        assert!(detection.has_changes);
        assert_eq!(detection.change_count, 1);
        assert_eq!(detection.change_types, vec!["navigation".to_string()]);
        assert!(detection.url_changed);
    }

    #[test]
    fn test_selector_outcome_constructors() {
        let ok = SelectorOutcome::success("#submit");
        assert!(ok.success);
        assert_eq!(ok.used_selector.as_deref(), Some("#submit"));

        let exhausted = SelectorOutcome::exhausted("timeout waiting for element");
        assert!(!exhausted.success);
        assert!(exhausted.error.unwrap().contains("timeout"));
    }
}
