//! Session-scoped signal and processing state.
//!
//! [`StateManager`] enforces single-flight execution: at most one
//! instruction is in flight per session, duplicate deliveries of an already
//! processed id are rejected, and external stop/complete signals are held
//! here for the loop to poll at its checkpoints. Cancellation is
//! cooperative; nothing in this module interrupts an in-flight call.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

/// Snapshot of the externally-settable signals, read by the loop at each
/// iteration boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalSnapshot {
    /// A caller asked for the run to stop.
    pub stop: bool,
    /// A caller declared the task complete.
    pub complete: bool,
}

#[derive(Debug, Default)]
struct StateInner {
    stop_signal: bool,
    complete_signal: bool,
    current_instruction_id: Option<String>,
    is_processing: bool,
    processed_ids: HashSet<String>,
}

/// Signal/processing state machine for one session.
///
/// Cheap to clone; all clones share the same state. Signal setters run
/// concurrently with the loop and communicate only through this shared
/// state, which is read at iteration boundaries.
#[derive(Debug, Clone, Default)]
pub struct StateManager {
    inner: Arc<Mutex<StateInner>>,
}

impl StateManager {
    /// Create a fresh idle state manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` as the active instruction.
    ///
    /// Transitions Idle -> Processing. When another run is already active
    /// but a complete-signal targets it, the stuck run is force-stopped
    /// (its shared state is cleared here; the run itself observes the stop
    /// at its next checkpoint) and the new instruction proceeds.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rejected`] when `id` was already processed
    /// within the retention window, or when another instruction is active
    /// without a pending complete-signal.
    pub fn start_processing(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("state lock poisoned");

        if inner.processed_ids.contains(id) {
            return Err(EngineError::rejected(format!(
                "instruction {id} was already processed"
            )));
        }

        if inner.is_processing {
            if inner.complete_signal {
                warn!(
                    stuck = ?inner.current_instruction_id,
                    new = id,
                    "force-stopping run with pending complete-signal"
                );
                inner.stop_signal = false;
                inner.complete_signal = false;
                inner.current_instruction_id = None;
                inner.is_processing = false;
            } else {
                return Err(EngineError::rejected(format!(
                    "instruction {} is still being processed",
                    inner.current_instruction_id.as_deref().unwrap_or("?")
                )));
            }
        }

        inner.is_processing = true;
        inner.current_instruction_id = Some(id.to_string());
        inner.stop_signal = false;
        inner.complete_signal = false;
        inner.processed_ids.insert(id.to_string());
        debug!(instruction = id, "processing started");
        Ok(())
    }

    /// Transition Processing -> Idle, clearing all signal state including
    /// the current instruction id. Processed ids are retained.
    ///
    /// Only the run that owns the registration may clear it: when `id`
    /// differs from the active instruction (a preempted run finishing after
    /// its successor took over) the call is a logged no-op.
    pub fn stop_processing(&self, id: &str) {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        if inner.current_instruction_id.as_deref() != Some(id) {
            debug!(
                finished = id,
                active = ?inner.current_instruction_id,
                "stop_processing ignored: instruction is no longer registered"
            );
            return;
        }
        inner.is_processing = false;
        inner.current_instruction_id = None;
        inner.stop_signal = false;
        inner.complete_signal = false;
        debug!(instruction = id, "processing stopped");
    }

    /// Raise the stop signal.
    ///
    /// When `id` is present and differs from the active instruction the
    /// signal is ignored (logged only), preventing cross-instruction
    /// interference.
    pub fn set_stop_signal(&self, id: Option<&str>) {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        if let Some(id) = id {
            if inner.current_instruction_id.as_deref() != Some(id) {
                warn!(
                    requested = id,
                    active = ?inner.current_instruction_id,
                    "stop signal ignored: id does not match active instruction"
                );
                return;
            }
        }
        info!(instruction = ?inner.current_instruction_id, "stop signal set");
        inner.stop_signal = true;
    }

    /// Raise the complete signal. Same id-matching rule as
    /// [`set_stop_signal`](Self::set_stop_signal).
    pub fn set_complete_signal(&self, id: Option<&str>) {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        if let Some(id) = id {
            if inner.current_instruction_id.as_deref() != Some(id) {
                warn!(
                    requested = id,
                    active = ?inner.current_instruction_id,
                    "complete signal ignored: id does not match active instruction"
                );
                return;
            }
        }
        info!(instruction = ?inner.current_instruction_id, "complete signal set");
        inner.complete_signal = true;
    }

    /// Read the current signals without clearing them.
    #[must_use]
    pub fn signals(&self) -> SignalSnapshot {
        let inner = self.inner.lock().expect("state lock poisoned");
        SignalSnapshot {
            stop: inner.stop_signal,
            complete: inner.complete_signal,
        }
    }

    /// Whether a run is currently active.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.inner.lock().expect("state lock poisoned").is_processing
    }

    /// The id of the active instruction, if any.
    #[must_use]
    pub fn current_instruction_id(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("state lock poisoned")
            .current_instruction_id
            .clone()
    }

    /// Whether `id` was already processed within the retention window.
    #[must_use]
    pub fn is_processed(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("state lock poisoned")
            .processed_ids
            .contains(id)
    }

    /// Schedule a purge of the current processed-id snapshot after
    /// `retention`. A memory bound, not a correctness mechanism: ids
    /// processed after this call are untouched by the scheduled purge.
    pub fn cleanup_old_instructions(&self, retention: Duration) {
        let snapshot: Vec<String> = {
            let inner = self.inner.lock().expect("state lock poisoned");
            inner.processed_ids.iter().cloned().collect()
        };
        if snapshot.is_empty() {
            return;
        }
        let shared = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let mut inner = shared.lock().expect("state lock poisoned");
            for id in &snapshot {
                inner.processed_ids.remove(id);
            }
            debug!(purged = snapshot.len(), "processed-id snapshot purged");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_stop_processing() {
        let state = StateManager::new();
        assert!(!state.is_processing());

        state.start_processing("i-1").unwrap();
        assert!(state.is_processing());
        assert_eq!(state.current_instruction_id().as_deref(), Some("i-1"));

        state.stop_processing("i-1");
        assert!(!state.is_processing());
        assert!(state.current_instruction_id().is_none());
    }

    #[test]
    fn test_single_flight_enforced() {
        let state = StateManager::new();
        state.start_processing("i-1").unwrap();

        let err = state.start_processing("i-2").unwrap_err();
        assert!(err.to_string().contains("i-1"));
        // The original run is unaffected.
        assert_eq!(state.current_instruction_id().as_deref(), Some("i-1"));
    }

    #[test]
    fn test_processed_id_never_reaccepted() {
        let state = StateManager::new();
        state.start_processing("i-1").unwrap();
        state.stop_processing("i-1");

        let err = state.start_processing("i-1").unwrap_err();
        assert!(err.to_string().contains("already processed"));
    }

    #[test]
    fn test_complete_signal_preempts_stuck_run() {
        let state = StateManager::new();
        state.start_processing("i-1").unwrap();
        state.set_complete_signal(Some("i-1"));

        // A new instruction force-stops the stuck run and proceeds.
        state.start_processing("i-2").unwrap();
        assert_eq!(state.current_instruction_id().as_deref(), Some("i-2"));
        // Signals were reset for the new run.
        assert_eq!(state.signals(), SignalSnapshot::default());
    }

    #[test]
    fn test_stale_stop_processing_leaves_successor_registered() {
        let state = StateManager::new();
        state.start_processing("i-1").unwrap();
        state.set_complete_signal(Some("i-1"));
        state.start_processing("i-2").unwrap();

        // The preempted run finishing must not clear the successor.
        state.stop_processing("i-1");
        assert!(state.is_processing());
        assert_eq!(state.current_instruction_id().as_deref(), Some("i-2"));

        state.stop_processing("i-2");
        assert!(!state.is_processing());
    }

    #[test]
    fn test_signals_ignored_for_mismatched_id() {
        let state = StateManager::new();
        state.start_processing("i-1").unwrap();

        state.set_stop_signal(Some("other"));
        state.set_complete_signal(Some("other"));
        assert_eq!(state.signals(), SignalSnapshot::default());

        state.set_stop_signal(Some("i-1"));
        assert!(state.signals().stop);
    }

    #[test]
    fn test_signal_without_id_targets_active_run() {
        let state = StateManager::new();
        state.start_processing("i-1").unwrap();
        state.set_complete_signal(None);
        assert!(state.signals().complete);
    }

    #[test]
    fn test_stop_processing_clears_signals() {
        let state = StateManager::new();
        state.start_processing("i-1").unwrap();
        state.set_stop_signal(None);
        state.stop_processing("i-1");
        assert_eq!(state.signals(), SignalSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_purges_snapshot_after_retention() {
        let state = StateManager::new();
        state.start_processing("i-1").unwrap();
        state.stop_processing("i-1");
        assert!(state.is_processed("i-1"));

        state.cleanup_old_instructions(Duration::from_secs(300));
        // Ids processed after the snapshot survive the purge.
        state.start_processing("i-2").unwrap();
        state.stop_processing("i-2");

        tokio::time::sleep(Duration::from_secs(301)).await;
        // Let the spawned purge task run.
        tokio::task::yield_now().await;

        assert!(!state.is_processed("i-1"));
        assert!(state.is_processed("i-2"));
    }
}
