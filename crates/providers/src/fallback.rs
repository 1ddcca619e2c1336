//! Model fallback chain.
//!
//! An ordered list of model identifiers tried in sequence when a call fails
//! with a failover-eligible error. The index advances monotonically within
//! a turn and resets only between turns, on success.

use serde::Serialize;

use valet_domain::error::Error;

use crate::classifier::{classify, ErrorCategory};

/// Why a failover was (or was not) triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    Auth,
    RateLimit,
    Timeout,
    ServerError,
    Unknown,
}

impl FailoverReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverReason::Auth => "auth",
            FailoverReason::RateLimit => "rate_limit",
            FailoverReason::Timeout => "timeout",
            FailoverReason::ServerError => "server_error",
            FailoverReason::Unknown => "unknown",
        }
    }
}

impl From<ErrorCategory> for FailoverReason {
    fn from(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Auth => FailoverReason::Auth,
            ErrorCategory::RateLimit => FailoverReason::RateLimit,
            ErrorCategory::Timeout => FailoverReason::Timeout,
            ErrorCategory::ServerError => FailoverReason::ServerError,
            ErrorCategory::Unknown => FailoverReason::Unknown,
        }
    }
}

/// Ordered fallback chain: primary model first, then the fallbacks.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    models: Vec<String>,
    current_index: usize,
}

impl FallbackChain {
    pub fn new(primary: impl Into<String>, fallbacks: Vec<String>) -> Self {
        let mut models = vec![primary.into()];
        models.extend(fallbacks);
        Self {
            models,
            current_index: 0,
        }
    }

    /// The model currently in use.
    pub fn current_model(&self) -> &str {
        &self.models[self.current_index]
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Whether any fallback remains after the current model.
    pub fn has_next(&self) -> bool {
        self.current_index + 1 < self.models.len()
    }

    /// Advance to the next model. `None` when the chain is exhausted.
    pub fn next_model(&mut self) -> Option<&str> {
        if self.current_index + 1 < self.models.len() {
            self.current_index += 1;
            Some(&self.models[self.current_index])
        } else {
            None
        }
    }

    /// Decide whether this error should trigger failover.
    ///
    /// Only auth, rate-limit, timeout, and server errors are eligible, and
    /// only while another model remains in the chain.
    pub fn should_failover(&self, error: &Error) -> (bool, FailoverReason) {
        let reason = FailoverReason::from(classify(error));
        let eligible = !matches!(reason, FailoverReason::Unknown);
        (eligible && self.has_next(), reason)
    }

    /// Record a successful call. Does not rewind within the current turn.
    pub fn record_success(&mut self, _model: &str) {}

    /// Reset to the primary model. Called between turns, on success only.
    pub fn reset(&mut self) {
        self.current_index = 0;
    }
}
