//! Controllable test doubles for the engine's external collaborators.
//!
//! These mocks provide deterministic stand-ins for the browser backend and
//! the decision model, enabling unit and integration tests that exercise
//! the full orchestration loop without a tab or an API key. They are
//! exported from the crate (not `#[cfg(test)]`) so downstream gateways can
//! reuse them in their own tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;

use crate::browser::{
    BrowserService, MutationSummary, PageContext, SelectorOutcome, Viewport,
};
use crate::model::{ChatRequest, ModelClient, ModelReply};

// =============================================================================
// MockBrowser
// =============================================================================

#[derive(Debug)]
struct MockBrowserInner {
    current_url: String,
    url_after_actions: Option<String>,
    dom: String,
    screenshot: Vec<u8>,
    mutations: MutationSummary,
    collect_error: Option<String>,
    selector_failure: Option<String>,
    hard_failure: Option<String>,
    navigations: Vec<String>,
}

/// Mock browser session.
///
/// Cheap to clone; clones share state, so a test can keep a handle for
/// assertions after moving a clone into the engine.
///
/// # Example
///
/// ```rust,ignore
/// let browser = MockBrowser::new()
///     .with_dom("<button id=\"go\">Go</button>")
///     .with_url_after_actions("https://b.example");
/// ```
#[derive(Debug, Clone)]
pub struct MockBrowser {
    inner: Arc<Mutex<MockBrowserInner>>,
    click_calls: Arc<AtomicU32>,
    type_calls: Arc<AtomicU32>,
}

impl Default for MockBrowser {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockBrowserInner {
                current_url: "about:blank".to_string(),
                url_after_actions: None,
                dom: "<html><body></body></html>".to_string(),
                screenshot: vec![0_u8; 16],
                mutations: MutationSummary::default(),
                collect_error: None,
                selector_failure: None,
                hard_failure: None,
                navigations: Vec::new(),
            })),
            click_calls: Arc::new(AtomicU32::new(0)),
            type_calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl MockBrowser {
    /// Create a mock with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial page URL.
    #[must_use]
    pub fn with_url(self, url: &str) -> Self {
        self.inner.lock().unwrap().current_url = url.to_string();
        self
    }

    /// Make every observed action leave the page at `url`.
    #[must_use]
    pub fn with_url_after_actions(self, url: &str) -> Self {
        self.inner.lock().unwrap().url_after_actions = Some(url.to_string());
        self
    }

    /// Set the DOM snapshot to return.
    #[must_use]
    pub fn with_dom(self, dom: &str) -> Self {
        self.inner.lock().unwrap().dom = dom.to_string();
        self
    }

    /// Set the mutation read-back for `collect_changes`.
    #[must_use]
    pub fn with_mutations(self, mutations: MutationSummary) -> Self {
        self.inner.lock().unwrap().mutations = mutations;
        self
    }

    /// Make `collect_changes` fail with the given message.
    #[must_use]
    pub fn with_collect_error(self, message: &str) -> Self {
        self.inner.lock().unwrap().collect_error = Some(message.to_string());
        self
    }

    /// Make selector-fallback click/type exhaust with the given last error.
    #[must_use]
    pub fn with_selector_failure(self, last_error: &str) -> Self {
        self.inner.lock().unwrap().selector_failure = Some(last_error.to_string());
        self
    }

    /// Make every action method fail hard with the given message.
    #[must_use]
    pub fn with_hard_failure(self, message: &str) -> Self {
        self.inner.lock().unwrap().hard_failure = Some(message.to_string());
        self
    }

    /// Number of `click_with_selectors` calls so far.
    #[must_use]
    pub fn click_calls(&self) -> u32 {
        self.click_calls.load(Ordering::SeqCst)
    }

    /// Number of `type_with_selectors` calls so far.
    #[must_use]
    pub fn type_calls(&self) -> u32 {
        self.type_calls.load(Ordering::SeqCst)
    }

    /// URLs navigated to, in order.
    #[must_use]
    pub fn navigations(&self) -> Vec<String> {
        self.inner.lock().unwrap().navigations.clone()
    }

    fn check_hard_failure(&self) -> anyhow::Result<()> {
        if let Some(message) = &self.inner.lock().unwrap().hard_failure {
            bail!("{message}");
        }
        Ok(())
    }

    fn settle_url(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(url) = inner.url_after_actions.clone() {
            inner.current_url = url;
        }
    }
}

#[async_trait]
impl BrowserService for MockBrowser {
    async fn navigate(&self, url: &str) -> anyhow::Result<()> {
        self.check_hard_failure()?;
        let mut inner = self.inner.lock().unwrap();
        inner.navigations.push(url.to_string());
        inner.current_url = url.to_string();
        Ok(())
    }

    async fn click_with_selectors(
        &self,
        _selectors: &[String],
        _exist_timeout: Duration,
        _click_timeout: Duration,
    ) -> anyhow::Result<SelectorOutcome> {
        self.check_hard_failure()?;
        self.click_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.inner.lock().unwrap().selector_failure.clone();
        if let Some(last_error) = failure {
            return Ok(SelectorOutcome::exhausted(last_error));
        }
        self.settle_url();
        Ok(SelectorOutcome::success("#mock"))
    }

    async fn type_with_selectors(
        &self,
        _selectors: &[String],
        _value: &str,
        _exist_timeout: Duration,
        _fill_timeout: Duration,
    ) -> anyhow::Result<SelectorOutcome> {
        self.check_hard_failure()?;
        self.type_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.inner.lock().unwrap().selector_failure.clone();
        if let Some(last_error) = failure {
            return Ok(SelectorOutcome::exhausted(last_error));
        }
        self.settle_url();
        Ok(SelectorOutcome::success("#mock"))
    }

    async fn click_coordinates(&self, _x: f64, _y: f64) -> anyhow::Result<()> {
        self.check_hard_failure()?;
        self.settle_url();
        Ok(())
    }

    async fn press_enter(&self) -> anyhow::Result<()> {
        self.check_hard_failure()?;
        self.settle_url();
        Ok(())
    }

    async fn scroll(&self, _direction: &str, _amount: i64) -> anyhow::Result<()> {
        self.check_hard_failure()
    }

    async fn wait(&self, _ms: u64) -> anyhow::Result<()> {
        self.check_hard_failure()
    }

    async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.inner.lock().unwrap().screenshot.clone())
    }

    async fn dom_content(&self, _token_budget: usize) -> anyhow::Result<String> {
        Ok(self.inner.lock().unwrap().dom.clone())
    }

    async fn page_context(&self) -> anyhow::Result<PageContext> {
        let inner = self.inner.lock().unwrap();
        Ok(PageContext {
            current_url: inner.current_url.clone(),
            page_title: "Mock Page".to_string(),
            viewport: Viewport {
                width: 1280,
                height: 800,
            },
        })
    }

    async fn begin_change_observation(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn collect_changes(&self) -> anyhow::Result<MutationSummary> {
        let inner = self.inner.lock().unwrap();
        if let Some(message) = &inner.collect_error {
            bail!("{message}");
        }
        Ok(inner.mutations.clone())
    }
}

// =============================================================================
// MockModelClient
// =============================================================================

#[derive(Debug, Clone)]
enum ScriptedReply {
    Reply(ModelReply),
    Error(String),
}

#[derive(Debug, Default)]
struct MockModelInner {
    script: VecDeque<ScriptedReply>,
    requests: Vec<ChatRequest>,
    vision_response: Option<String>,
    vision_fail_count: u32,
}

/// Mock decision-model client driven by a scripted reply queue.
///
/// Each `chat` call pops the next scripted reply; an exhausted script
/// fails, which surfaces in the engine as a processing-error manual
/// intervention. Clones share state.
///
/// # Example
///
/// ```rust,ignore
/// let model = MockModelClient::new()
///     .with_tool_call("navigate", json!({"url": "https://a.example", "reason": "open it"}))
///     .with_tool_call("complete", json!({"summary": "done"}));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockModelClient {
    inner: Arc<Mutex<MockModelInner>>,
    chat_calls: Arc<AtomicU32>,
    vision_calls: Arc<AtomicU32>,
}

impl MockModelClient {
    /// Create a mock with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scripted reply.
    #[must_use]
    pub fn with_reply(self, reply: ModelReply) -> Self {
        self.inner
            .lock()
            .unwrap()
            .script
            .push_back(ScriptedReply::Reply(reply));
        self
    }

    /// Append a scripted tool call.
    #[must_use]
    pub fn with_tool_call(self, name: &str, arguments: Value) -> Self {
        self.with_reply(ModelReply::ToolCall {
            name: name.to_string(),
            arguments,
        })
    }

    /// Append a scripted plain-text reply.
    #[must_use]
    pub fn with_text(self, content: &str) -> Self {
        self.with_reply(ModelReply::Text {
            content: content.to_string(),
        })
    }

    /// Append a scripted chat failure.
    #[must_use]
    pub fn with_chat_error(self, message: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .script
            .push_back(ScriptedReply::Error(message.to_string()));
        self
    }

    /// Set the vision-call response.
    #[must_use]
    pub fn with_vision_response(self, response: &str) -> Self {
        self.inner.lock().unwrap().vision_response = Some(response.to_string());
        self
    }

    /// Fail the first `count` vision calls, then succeed.
    #[must_use]
    pub fn with_vision_fail_count(self, count: u32) -> Self {
        self.inner.lock().unwrap().vision_fail_count = count;
        self
    }

    /// Number of chat calls so far.
    #[must_use]
    pub fn chat_calls(&self) -> u32 {
        self.chat_calls.load(Ordering::SeqCst)
    }

    /// Number of vision calls so far.
    #[must_use]
    pub fn vision_calls(&self) -> u32 {
        self.vision_calls.load(Ordering::SeqCst)
    }

    /// Chat requests seen so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.inner.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ModelReply> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut inner = self.inner.lock().unwrap();
            inner.requests.push(request);
            inner.script.pop_front()
        };
        match next {
            Some(ScriptedReply::Reply(reply)) => Ok(reply),
            Some(ScriptedReply::Error(message)) => bail!("{message}"),
            None => bail!("mock model script exhausted"),
        }
    }

    async fn vision(&self, _image: &[u8], _prompt: &str) -> anyhow::Result<String> {
        self.vision_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        if inner.vision_fail_count > 0 {
            inner.vision_fail_count -= 1;
            bail!("mock vision failure");
        }
        Ok(inner
            .vision_response
            .clone()
            .unwrap_or_else(|| "no notable elements".to_string()))
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_browser_records_navigations() {
        let browser = MockBrowser::new();
        browser.navigate("https://a.example").await.unwrap();
        browser.navigate("https://b.example").await.unwrap();

        assert_eq!(browser.navigations().len(), 2);
        let ctx = browser.page_context().await.unwrap();
        assert_eq!(ctx.current_url, "https://b.example");
    }

    #[tokio::test]
    async fn test_mock_model_script_order() {
        let model = MockModelClient::new()
            .with_tool_call("thought", json!({"content": "hm"}))
            .with_chat_error("rate limited");

        let request = ChatRequest {
            model: "m".to_string(),
            temperature: 0.0,
            max_tokens: 16,
            messages: vec![],
            tools: vec![],
            tool_choice: None,
        };

        let first = model.chat(request.clone()).await.unwrap();
        assert_eq!(first.tool_name(), Some("thought"));

        let second = model.chat(request.clone()).await;
        assert!(second.is_err());

        let third = model.chat(request).await;
        assert!(third.unwrap_err().to_string().contains("exhausted"));
        assert_eq!(model.chat_calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_vision_fail_count() {
        let model = MockModelClient::new()
            .with_vision_response("button at (10, 20)")
            .with_vision_fail_count(1);

        assert!(model.vision(&[], "find buttons").await.is_err());
        let analysis = model.vision(&[], "find buttons").await.unwrap();
        assert_eq!(analysis, "button at (10, 20)");
        assert_eq!(model.vision_calls(), 2);
    }
}
