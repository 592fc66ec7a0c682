//! Webpilot - Instruction Orchestration Engine
//!
//! A bounded ReAct loop that turns a natural-language instruction into a
//! sequence of browser actions, using a language model as the decision
//! maker: ask the model for the next tool call, execute it against the
//! browser, observe the resulting page change, and decide whether to
//! continue, declare success, stall out, or request human help.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`engine`] - The orchestration loop composing everything below
//! - [`decision`] - One model call wrapped into exactly one next step
//! - [`executor`] - Action dispatch with mutation observation and completion heuristics
//! - [`state`] - Session signal/processing state machine
//! - [`heuristics`] - Stall detection, auto-complete, screenshot policy
//! - [`browser`] / [`model`] / [`session`] - External collaborator traits
//! - [`config`] - Engine tuning knobs, validated at construction
//! - [`error`] - Custom error types and terminal-state classification
//! - [`testing`] - Mock collaborators for tests and downstream gateways
//!
//! # Example
//!
//! ```rust,ignore
//! use webpilot::{Engine, EngineConfig, Instruction};
//! use webpilot::model::HttpModelClient;
//! use webpilot::session::InMemorySession;
//!
//! let model = Arc::new(HttpModelClient::from_env("OPENAI_API_KEY")?);
//! let engine = Engine::new(model, browser, Arc::new(InMemorySession::new("s1")),
//!     EngineConfig::default())?;
//!
//! let outcome = engine
//!     .process_instruction(Instruction::new("go to example.com", "s1"))
//!     .await;
//! println!("{:?}", outcome.status);
//! ```

pub mod browser;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod executor;
pub mod heuristics;
pub mod instruction;
pub mod model;
pub mod session;
pub mod state;
pub mod testing;

// Re-export commonly used types
pub use error::{EngineError, Result};

pub use config::EngineConfig;

pub use instruction::{
    Action, ActionKind, Instruction, ManualInterventionRequest, RunOutcome, RunStatus, Step,
};

pub use engine::{Engine, InstructionClarifier, StepObserver, TracingObserver};

pub use browser::{BrowserService, ChangeDetection, MutationSummary, PageContext, SelectorOutcome};

pub use decision::{Classification, DecisionContext, DecisionOutcome, StepDecisionMaker};

pub use executor::{ActionExecutor, ExecutionReport};

pub use model::{ChatMessage, ChatRequest, HttpModelClient, ModelClient, ModelReply};

pub use session::{InMemorySession, SessionSink};

pub use state::{SignalSnapshot, StateManager};
