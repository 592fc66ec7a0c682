//! Custom error types for the orchestration engine.
//!
//! This module provides structured error types that enable better
//! error handling, classification, and terminal-state mapping
//! throughout the engine.

use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Decision Errors
    // =========================================================================
    /// The decision model returned no tool call or a malformed one
    #[error("Decision error: {message}")]
    Decision { message: String },

    /// The decision call exhausted its retry budget
    #[error("Decision call failed after {attempts} attempts: {message}")]
    DecisionRetriesExhausted { attempts: u32, message: String },

    // =========================================================================
    // Action Errors
    // =========================================================================
    /// Recoverable action failure (selector exhaustion, navigation-induced
    /// DOM read failure); recorded as an observation, loop continues
    #[error("Action failed (recoverable): {message}")]
    SoftAction { message: String },

    /// Unrecoverable action failure; aborts the run
    #[error("Action failed: {message}")]
    HardAction { message: String },

    // =========================================================================
    // Loop Errors
    // =========================================================================
    /// Heuristic non-convergence detected across the step sequence
    #[error("Stalled: {reason}")]
    Stall { reason: String },

    /// Maximum reasoning steps exceeded
    #[error("Maximum reasoning steps reached ({max})")]
    MaxSteps { max: u32 },

    /// Run stopped by an external stop signal
    #[error("Instruction stopped by user")]
    Stopped,

    // =========================================================================
    // State Errors
    // =========================================================================
    /// Instruction rejected by the state manager
    #[error("Instruction rejected: {reason}")]
    Rejected { reason: String },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Browser collaborator failure
    #[error("Browser error: {message}")]
    Browser { message: String },

    /// Model client failure
    #[error("Model error: {message}")]
    Model { message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a decision error
    pub fn decision(message: impl Into<String>) -> Self {
        Self::Decision {
            message: message.into(),
        }
    }

    /// Create a soft action error
    pub fn soft_action(message: impl Into<String>) -> Self {
        Self::SoftAction {
            message: message.into(),
        }
    }

    /// Create a hard action error
    pub fn hard_action(message: impl Into<String>) -> Self {
        Self::HardAction {
            message: message.into(),
        }
    }

    /// Create a stall error
    pub fn stall(reason: impl Into<String>) -> Self {
        Self::Stall {
            reason: reason.into(),
        }
    }

    /// Create a rejection error
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Create a browser collaborator error
    pub fn browser(message: impl Into<String>) -> Self {
        Self::Browser {
            message: message.into(),
        }
    }

    /// Create a model client error
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model {
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is recoverable within the loop
    /// (recorded as an observation instead of aborting the run)
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::SoftAction { .. })
    }

    /// Check if this error maps to a manual-intervention terminal
    pub fn requires_human(&self) -> bool {
        matches!(
            self,
            Self::Decision { .. }
                | Self::DecisionRetriesExhausted { .. }
                | Self::Stall { .. }
                | Self::MaxSteps { .. }
        )
    }

    /// Check if this error is fatal (aborts the run as an error terminal)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HardAction { .. }
                | Self::Browser { .. }
                | Self::Stopped
                | Self::Io(_)
                | Self::Other(_)
        )
    }
}

/// Type alias for engine results
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::MaxSteps { max: 15 };
        assert!(err.to_string().contains("15"));

        let err = EngineError::Stopped;
        assert_eq!(err.to_string(), "Instruction stopped by user");
    }

    #[test]
    fn test_is_soft() {
        assert!(EngineError::soft_action("no selector matched").is_soft());
        assert!(!EngineError::hard_action("tab crashed").is_soft());
        assert!(!EngineError::decision("no tool call").is_soft());
    }

    #[test]
    fn test_requires_human() {
        assert!(EngineError::decision("malformed tool call").requires_human());
        assert!(EngineError::stall("repeated scrolling").requires_human());
        assert!(EngineError::MaxSteps { max: 15 }.requires_human());
        assert!(!EngineError::soft_action("timeout").requires_human());
    }

    #[test]
    fn test_is_fatal() {
        assert!(EngineError::hard_action("tab crashed").is_fatal());
        assert!(EngineError::Stopped.is_fatal());
        assert!(!EngineError::soft_action("timeout").is_fatal());
        assert!(!EngineError::stall("no progress").is_fatal());
    }

    #[test]
    fn test_constructor_helpers() {
        let err = EngineError::rejected("already processed");
        if let EngineError::Rejected { reason } = err {
            assert_eq!(reason, "already processed");
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
