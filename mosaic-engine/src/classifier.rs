//! Provider error classification
//!
//! Maps a raw provider failure (optional HTTP status + message) onto an
//! [`ErrorCategory`] and a retry recommendation. Pure and deterministic: no
//! I/O, no shared state.

use mosaic_core::domain::step::ErrorCategory;
use std::time::Duration;

use crate::provider::ProviderError;

/// Outcome of classifying one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    /// Wait suggested by the provider, when the message carries one
    pub retry_after: Option<Duration>,
}

impl Classification {
    pub fn new(category: ErrorCategory) -> Self {
        Self {
            category,
            retryable: !category.is_fatal(),
            retry_after: None,
        }
    }
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
    "throttl",
];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "unauthorised",
    "forbidden",
    "invalid api key",
    "api key",
    "authentication",
    "permission denied",
    "insufficient credits",
];

const NETWORK_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "dns",
    "network",
    "unexpected eof",
    "error sending request",
];

const SERVER_PATTERNS: &[&str] = &[
    "internal server error",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "overloaded",
    "out of memory",
    "cuda",
    "worker crashed",
    "temporarily unavailable",
];

const VALIDATION_PATTERNS: &[&str] = &[
    "invalid",
    "must be",
    "unsupported",
    "not supported",
    "nsfw",
    "content policy",
    "safety",
    "malformed",
    "missing required",
];

/// Classifies a provider error
pub fn classify_provider_error(err: &ProviderError) -> Classification {
    classify(err.status, &err.message)
}

/// Classifies a failure from its status code and message
///
/// Status ranges decide first (401/403 auth, 408 network, 429 rate limit,
/// other 4xx validation, 5xx server) with a rate-limit message overriding the
/// range; without a status the lowercased message is matched against patterns.
pub fn classify(status: Option<u16>, message: &str) -> Classification {
    let text = message.to_lowercase();
    let retry_after = parse_retry_after(&text);
    let mentions_rate_limit = matches_any(&text, RATE_LIMIT_PATTERNS);

    let category = match status {
        Some(429) => ErrorCategory::RateLimit,
        Some(_) if mentions_rate_limit => ErrorCategory::RateLimit,
        Some(401) | Some(403) => ErrorCategory::Auth,
        Some(408) => ErrorCategory::TransientNetwork,
        Some(code) if (400..500).contains(&code) => ErrorCategory::Validation,
        Some(code) if (500..600).contains(&code) => ErrorCategory::TransientServer,
        _ => classify_message(&text, mentions_rate_limit),
    };

    let mut classification = Classification::new(category);
    if category == ErrorCategory::RateLimit {
        classification.retry_after = retry_after;
    }
    classification
}

fn classify_message(text: &str, mentions_rate_limit: bool) -> ErrorCategory {
    if mentions_rate_limit {
        ErrorCategory::RateLimit
    } else if matches_any(text, AUTH_PATTERNS) {
        ErrorCategory::Auth
    } else if matches_any(text, SERVER_PATTERNS) {
        ErrorCategory::TransientServer
    } else if matches_any(text, NETWORK_PATTERNS) {
        ErrorCategory::TransientNetwork
    } else if matches_any(text, VALIDATION_PATTERNS) {
        ErrorCategory::Validation
    } else {
        ErrorCategory::Unknown
    }
}

fn matches_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| text.contains(p))
}

/// Extracts a wait hint such as "retry after 30s", "retry-after: 12" or
/// "try again in 2 minutes" from lowercased text
fn parse_retry_after(text: &str) -> Option<Duration> {
    const MARKERS: &[&str] = &["retry after", "retry-after", "try again in"];

    for marker in MARKERS {
        let Some(pos) = text.find(marker) else {
            continue;
        };

        let rest = text[pos + marker.len()..].trim_start_matches([' ', ':', '=']);
        let digits: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let Ok(value) = digits.parse::<f64>() else {
            continue;
        };
        if !value.is_finite() || value < 0.0 {
            continue;
        }

        let unit = rest[digits.len()..].trim_start();
        let seconds = if unit.starts_with("ms") || unit.starts_with("millisecond") {
            value / 1000.0
        } else if unit.starts_with('m') {
            value * 60.0
        } else {
            value
        };

        return Some(Duration::from_secs_f64(seconds));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ranges() {
        assert_eq!(classify(Some(400), "bad").category, ErrorCategory::Validation);
        assert_eq!(classify(Some(422), "").category, ErrorCategory::Validation);
        assert_eq!(classify(Some(401), "").category, ErrorCategory::Auth);
        assert_eq!(classify(Some(403), "").category, ErrorCategory::Auth);
        assert_eq!(classify(Some(408), "").category, ErrorCategory::TransientNetwork);
        assert_eq!(classify(Some(429), "").category, ErrorCategory::RateLimit);
        assert_eq!(classify(Some(500), "").category, ErrorCategory::TransientServer);
        assert_eq!(classify(Some(503), "").category, ErrorCategory::TransientServer);
    }

    #[test]
    fn test_fatal_categories_not_retryable() {
        assert!(!classify(Some(400), "invalid image").retryable);
        assert!(!classify(Some(401), "bad key").retryable);
        assert!(classify(Some(502), "bad gateway").retryable);
        assert!(classify(None, "something odd happened").retryable);
    }

    #[test]
    fn test_rate_limit_message_overrides_status() {
        let c = classify(Some(503), "Rate limit exceeded for this model");
        assert_eq!(c.category, ErrorCategory::RateLimit);

        let c = classify(Some(400), "Too Many Requests");
        assert_eq!(c.category, ErrorCategory::RateLimit);
    }

    #[test]
    fn test_message_patterns_without_status() {
        assert_eq!(
            classify(None, "Connection reset by peer").category,
            ErrorCategory::TransientNetwork
        );
        assert_eq!(
            classify(None, "CUDA out of memory").category,
            ErrorCategory::TransientServer
        );
        assert_eq!(
            classify(None, "Invalid API key provided").category,
            ErrorCategory::Auth
        );
        assert_eq!(
            classify(None, "prompt flagged by content policy").category,
            ErrorCategory::Validation
        );
        assert_eq!(classify(None, "¯\\_(ツ)_/¯").category, ErrorCategory::Unknown);
    }

    #[test]
    fn test_retry_after_hint() {
        let c = classify(Some(429), "slow down, retry after 30 seconds");
        assert_eq!(c.retry_after, Some(Duration::from_secs(30)));

        let c = classify(Some(429), "Retry-After: 12");
        assert_eq!(c.retry_after, Some(Duration::from_secs(12)));

        let c = classify(None, "rate limited, try again in 2 minutes");
        assert_eq!(c.retry_after, Some(Duration::from_secs(120)));

        let c = classify(Some(429), "retry after 500ms");
        assert_eq!(c.retry_after, Some(Duration::from_millis(500)));

        let c = classify(Some(429), "too many requests");
        assert_eq!(c.retry_after, None);
    }

    #[test]
    fn test_hint_ignored_for_other_categories() {
        let c = classify(Some(500), "internal error, retry after 10s");
        assert_eq!(c.category, ErrorCategory::TransientServer);
        assert_eq!(c.retry_after, None);
    }

    #[test]
    fn test_provider_error_entry_point() {
        let err = ProviderError::new(Some(504), "Gateway Timeout");
        assert_eq!(
            classify_provider_error(&err).category,
            ErrorCategory::TransientServer
        );
    }
}
