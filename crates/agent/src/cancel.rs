//! Run-addressed cancellation.
//!
//! Each turn in progress gets a `CancelToken` registered under its run id.
//! `chat.abort` flips the token; the runtime loop checks it at every
//! suspension point and exits cleanly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A cancellation token checked by the runtime loop.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tracks active cancel tokens per run id.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, CancelToken>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a token for a run.
    pub fn register(&self, run_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.runs.lock().insert(run_id.to_owned(), token.clone());
        token
    }

    /// Abort a run. Returns true if a token was found.
    pub fn abort(&self, run_id: &str) -> bool {
        match self.runs.lock().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the token when a run completes.
    pub fn remove(&self, run_id: &str) {
        self.runs.lock().remove(run_id);
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.runs.lock().contains_key(run_id)
    }

    /// Ids of all runs in flight.
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn registry_abort_flow() {
        let registry = RunRegistry::new();
        let token = registry.register("r1");
        assert!(registry.is_running("r1"));
        assert!(!token.is_cancelled());

        assert!(registry.abort("r1"));
        assert!(token.is_cancelled());

        registry.remove("r1");
        assert!(!registry.is_running("r1"));
        assert!(!registry.abort("r1"));
    }

    #[test]
    fn abort_unknown_run_is_false() {
        let registry = RunRegistry::new();
        assert!(!registry.abort("ghost"));
    }

    #[test]
    fn active_runs_are_sorted() {
        let registry = RunRegistry::new();
        registry.register("b");
        registry.register("a");
        assert_eq!(registry.active_runs(), vec!["a", "b"]);
    }
}
