//! Session history collaborator.
//!
//! The gateway owns session persistence; the engine only appends executed
//! action descriptions and reads the accumulated history back when building
//! decision context and final reports.

use std::sync::{Arc, Mutex};

/// Sink for the running action history of one session.
pub trait SessionSink: Send + Sync {
    /// Record one executed action description.
    fn add_action(&self, description: &str);

    /// The session id.
    fn session_id(&self) -> String;

    /// All recorded action descriptions, oldest first.
    fn actions_history(&self) -> Vec<String>;
}

/// In-memory session sink. The default when the gateway does not supply
/// its own; also what the tests use.
#[derive(Debug, Clone)]
pub struct InMemorySession {
    id: String,
    actions: Arc<Mutex<Vec<String>>>,
}

impl InMemorySession {
    /// Create an empty session with the given id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actions: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl SessionSink for InMemorySession {
    fn add_action(&self, description: &str) {
        self.actions
            .lock()
            .expect("session lock poisoned")
            .push(description.to_string());
    }

    fn session_id(&self) -> String {
        self.id.clone()
    }

    fn actions_history(&self) -> Vec<String> {
        self.actions.lock().expect("session lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_session_records_in_order() {
        let session = InMemorySession::new("s-1");
        session.add_action("Navigate to https://a.example");
        session.add_action("Click #submit: submit the form");

        assert_eq!(session.session_id(), "s-1");
        let history = session.actions_history();
        assert_eq!(history.len(), 2);
        assert!(history[0].starts_with("Navigate"));
        assert!(history[1].starts_with("Click"));
    }
}
