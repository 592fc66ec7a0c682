//! Configuration for the orchestration engine.
//!
//! Every empirically tuned threshold in the engine lives here as a named
//! field with a serde default, so deployments can override individual
//! values without recompiling.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Configuration for the orchestration engine.
///
/// The defaults reproduce the tuned production values; `validate` rejects
/// configurations that would make the loop unbounded or degenerate.
///
/// # Example
///
/// ```rust
/// use webpilot::config::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.max_steps, 15);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum reasoning steps per run before a manual-intervention terminal.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// DOM mutation count at which a same-URL click counts as task completion.
    #[serde(default = "default_mutation_threshold")]
    pub mutation_threshold: u32,

    /// Inter-iteration pace delay. Throttles upstream load only; carries no
    /// correctness guarantee.
    #[serde(default = "default_pace_delay_ms")]
    pub pace_delay_ms: u64,

    /// Settle delay between running an action and reading back mutations.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Word-set Jaccard similarity above which two thoughts count as repeats.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Timeout for the primary decision call.
    #[serde(default = "default_decision_timeout_secs")]
    pub decision_timeout_secs: u64,

    /// Retries for the primary decision call (exponential backoff,
    /// doubling per attempt).
    #[serde(default = "default_decision_max_retries")]
    pub decision_max_retries: u32,

    /// Base backoff delay for decision-call retries.
    #[serde(default = "default_decision_backoff_base_ms")]
    pub decision_backoff_base_ms: u64,

    /// Timeout for the secondary vision call.
    #[serde(default = "default_vision_timeout_secs")]
    pub vision_timeout_secs: u64,

    /// Retries for the secondary vision call.
    #[serde(default = "default_vision_max_retries")]
    pub vision_max_retries: u32,

    /// Selector existence budget for click actions.
    #[serde(default = "default_click_exist_timeout_ms")]
    pub click_exist_timeout_ms: u64,

    /// Click dispatch budget once a selector exists.
    #[serde(default = "default_click_action_timeout_ms")]
    pub click_action_timeout_ms: u64,

    /// Selector existence budget for type actions.
    #[serde(default = "default_type_exist_timeout_ms")]
    pub type_exist_timeout_ms: u64,

    /// Fill budget for type actions once a selector exists.
    #[serde(default = "default_type_fill_timeout_ms")]
    pub type_fill_timeout_ms: u64,

    /// How long processed instruction ids are retained before the purge.
    /// A memory bound, not a correctness mechanism.
    #[serde(default = "default_processed_retention_secs")]
    pub processed_retention_secs: u64,

    /// How many trailing steps are handed to the decision model.
    #[serde(default = "default_recent_steps_window")]
    pub recent_steps_window: usize,

    /// Token budget handed to the DOM collaborator when fetching a snapshot.
    /// Truncation policy itself is owned by the collaborator.
    #[serde(default = "default_dom_token_budget")]
    pub dom_token_budget: usize,
}

fn default_max_steps() -> u32 {
    15
}

fn default_mutation_threshold() -> u32 {
    30
}

fn default_pace_delay_ms() -> u64 {
    500
}

fn default_settle_delay_ms() -> u64 {
    100
}

fn default_similarity_threshold() -> f64 {
    0.8
}

fn default_decision_timeout_secs() -> u64 {
    30
}

fn default_decision_max_retries() -> u32 {
    2
}

fn default_decision_backoff_base_ms() -> u64 {
    1000
}

fn default_vision_timeout_secs() -> u64 {
    15
}

fn default_vision_max_retries() -> u32 {
    1
}

fn default_click_exist_timeout_ms() -> u64 {
    1000
}

fn default_click_action_timeout_ms() -> u64 {
    3000
}

fn default_type_exist_timeout_ms() -> u64 {
    4000
}

fn default_type_fill_timeout_ms() -> u64 {
    3000
}

fn default_processed_retention_secs() -> u64 {
    300
}

fn default_recent_steps_window() -> usize {
    3
}

fn default_dom_token_budget() -> usize {
    6000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            mutation_threshold: default_mutation_threshold(),
            pace_delay_ms: default_pace_delay_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            similarity_threshold: default_similarity_threshold(),
            decision_timeout_secs: default_decision_timeout_secs(),
            decision_max_retries: default_decision_max_retries(),
            decision_backoff_base_ms: default_decision_backoff_base_ms(),
            vision_timeout_secs: default_vision_timeout_secs(),
            vision_max_retries: default_vision_max_retries(),
            click_exist_timeout_ms: default_click_exist_timeout_ms(),
            click_action_timeout_ms: default_click_action_timeout_ms(),
            type_exist_timeout_ms: default_type_exist_timeout_ms(),
            type_fill_timeout_ms: default_type_fill_timeout_ms(),
            processed_retention_secs: default_processed_retention_secs(),
            recent_steps_window: default_recent_steps_window(),
            dom_token_budget: default_dom_token_budget(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] naming the offending field
    /// when a value would make the loop unbounded or degenerate.
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(EngineError::InvalidConfig {
                field: "max_steps".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.mutation_threshold == 0 {
            return Err(EngineError::InvalidConfig {
                field: "mutation_threshold".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(EngineError::InvalidConfig {
                field: "similarity_threshold".to_string(),
                reason: "must be within [0.0, 1.0]".to_string(),
            });
        }
        if self.decision_timeout_secs == 0 {
            return Err(EngineError::InvalidConfig {
                field: "decision_timeout_secs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.recent_steps_window == 0 {
            return Err(EngineError::InvalidConfig {
                field: "recent_steps_window".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.dom_token_budget == 0 {
            return Err(EngineError::InvalidConfig {
                field: "dom_token_budget".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Pace delay as a [`Duration`].
    #[must_use]
    pub fn pace_delay(&self) -> Duration {
        Duration::from_millis(self.pace_delay_ms)
    }

    /// Settle delay as a [`Duration`].
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Decision-call timeout as a [`Duration`].
    #[must_use]
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }

    /// Vision-call timeout as a [`Duration`].
    #[must_use]
    pub fn vision_timeout(&self) -> Duration {
        Duration::from_secs(self.vision_timeout_secs)
    }

    /// Processed-id retention window as a [`Duration`].
    #[must_use]
    pub fn processed_retention(&self) -> Duration {
        Duration::from_secs(self.processed_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_steps, 15);
        assert_eq!(config.mutation_threshold, 30);
        assert_eq!(config.pace_delay_ms, 500);
        assert!((config.similarity_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.decision_timeout_secs, 30);
        assert_eq!(config.decision_max_retries, 2);
        assert_eq!(config.vision_timeout_secs, 15);
        assert_eq!(config.vision_max_retries, 1);
        assert_eq!(config.processed_retention_secs, 300);
    }

    #[test]
    fn test_default_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_max_steps() {
        let config = EngineConfig {
            max_steps: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_steps"));
    }

    #[test]
    fn test_validate_rejects_bad_similarity() {
        let config = EngineConfig {
            similarity_threshold: 1.5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            similarity_threshold: -0.1,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let config = EngineConfig::default();
        assert_eq!(config.pace_delay(), Duration::from_millis(500));
        assert_eq!(config.decision_timeout(), Duration::from_secs(30));
        assert_eq!(config.processed_retention(), Duration::from_secs(300));
    }

    #[test]
    fn test_deserialize_partial_overrides() {
        let json = r#"{ "max_steps": 25, "mutation_threshold": 10 }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_steps, 25);
        assert_eq!(config.mutation_threshold, 10);
        // Unspecified fields fall back to defaults
        assert_eq!(config.pace_delay_ms, 500);
    }
}
