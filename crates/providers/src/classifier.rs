//! Error classification for retry and failover decisions.
//!
//! The classifier is data: a table of `(substring, category)` rules matched
//! against the lowercased error text. Supporting a new vendor's error shapes
//! means adding rows, not branches.

use serde::Serialize;

use valet_domain::error::Error;

/// Behavioral category of a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    RateLimit,
    Timeout,
    ServerError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Substring rules, checked in order. First match wins.
const RULES: &[(&str, ErrorCategory)] = &[
    // Auth
    ("invalid api key", ErrorCategory::Auth),
    ("invalid x-api-key", ErrorCategory::Auth),
    ("incorrect api key", ErrorCategory::Auth),
    ("authentication", ErrorCategory::Auth),
    ("unauthorized", ErrorCategory::Auth),
    ("permission denied", ErrorCategory::Auth),
    ("401", ErrorCategory::Auth),
    ("403", ErrorCategory::Auth),
    // Rate limit
    ("rate limit", ErrorCategory::RateLimit),
    ("rate_limit", ErrorCategory::RateLimit),
    ("too many requests", ErrorCategory::RateLimit),
    ("quota", ErrorCategory::RateLimit),
    ("429", ErrorCategory::RateLimit),
    // Timeout / transient network
    ("timed out", ErrorCategory::Timeout),
    ("timeout", ErrorCategory::Timeout),
    ("connection reset", ErrorCategory::Timeout),
    ("connection refused", ErrorCategory::Timeout),
    ("broken pipe", ErrorCategory::Timeout),
    // Server errors
    ("internal server error", ErrorCategory::ServerError),
    ("service unavailable", ErrorCategory::ServerError),
    ("overloaded", ErrorCategory::ServerError),
    ("bad gateway", ErrorCategory::ServerError),
    ("500", ErrorCategory::ServerError),
    ("502", ErrorCategory::ServerError),
    ("503", ErrorCategory::ServerError),
    ("529", ErrorCategory::ServerError),
];

/// Classify an error by variant first, then by message substrings.
pub fn classify(error: &Error) -> ErrorCategory {
    match error {
        Error::Auth(_) => return ErrorCategory::Auth,
        Error::RateLimit(_) => return ErrorCategory::RateLimit,
        Error::Timeout(_) => return ErrorCategory::Timeout,
        _ => {}
    }

    let text = error.to_string().to_lowercase();
    for (needle, category) in RULES {
        if text.contains(needle) {
            return *category;
        }
    }
    ErrorCategory::Unknown
}

/// Whether a retry with backoff makes sense for this category.
pub fn is_retryable(category: ErrorCategory) -> bool {
    matches!(
        category,
        ErrorCategory::RateLimit | ErrorCategory::Timeout | ErrorCategory::ServerError
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_err(message: &str) -> Error {
        Error::Provider {
            provider: "test".into(),
            message: message.into(),
        }
    }

    #[test]
    fn variant_wins_over_message() {
        assert_eq!(classify(&Error::Auth("whatever".into())), ErrorCategory::Auth);
        assert_eq!(
            classify(&Error::Timeout("read".into())),
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn substring_rules_classify_provider_errors() {
        assert_eq!(
            classify(&provider_err("401 invalid api key")),
            ErrorCategory::Auth
        );
        assert_eq!(
            classify(&provider_err("429 Too Many Requests")),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            classify(&provider_err("upstream connection reset")),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify(&provider_err("503 Service Unavailable")),
            ErrorCategory::ServerError
        );
        assert_eq!(
            classify(&provider_err("model produced gibberish")),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn retryability_matches_policy() {
        assert!(is_retryable(ErrorCategory::RateLimit));
        assert!(is_retryable(ErrorCategory::Timeout));
        assert!(is_retryable(ErrorCategory::ServerError));
        assert!(!is_retryable(ErrorCategory::Auth));
        assert!(!is_retryable(ErrorCategory::Unknown));
    }
}
