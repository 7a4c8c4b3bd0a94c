//! Classification of provider call results

use std::time::Duration;

use tokio::time::error::Elapsed;

use crate::{
    error::{PermanentError, TemporaryError},
    provider::{ProviderResponse, TransportError},
};

/// Error text markers that mean "try again later"
const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "429",
    "503",
    "502",
    "504",
    "service unavailable",
    "temporarily",
    "timeout",
    "timed out",
    "network",
    "connection reset",
    "connection refused",
    "busy",
    "try again",
];

const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate-limit", "ratelimit", "too many requests", "429"];

const UNAVAILABLE_MARKERS: &[&str] = &[
    "503",
    "502",
    "504",
    "service unavailable",
    "temporarily",
    "busy",
    "try again",
];

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out"];

const RECIPIENT_MARKERS: &[&str] = &[
    "invalid recipient",
    "invalid number",
    "invalid phone",
    "invalid address",
    "unknown recipient",
    "not a valid",
];

/// Result of one provider attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The provider accepted the message
    Sent { provider_message_id: Option<String> },
    /// Worth retrying after a backoff
    Transient(TemporaryError),
    /// Retrying will not help
    Terminal(PermanentError),
}

impl AttemptOutcome {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::Transient(_) => "transient",
            Self::Terminal(_) => "terminal",
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Whether provider error text describes a transient condition
#[must_use]
pub fn is_transient_error(text: &str) -> bool {
    contains_any(&text.to_ascii_lowercase(), TRANSIENT_MARKERS)
}

/// Map transient error text to the matching [`TemporaryError`]
fn temporary_error(text: String) -> TemporaryError {
    let lower = text.to_ascii_lowercase();
    if contains_any(&lower, RATE_LIMIT_MARKERS) {
        TemporaryError::RateLimited(text)
    } else if contains_any(&lower, TIMEOUT_MARKERS) {
        TemporaryError::Timeout(text)
    } else if contains_any(&lower, UNAVAILABLE_MARKERS) {
        TemporaryError::ProviderUnavailable(text)
    } else {
        TemporaryError::Network(text)
    }
}

fn permanent_error(text: String) -> PermanentError {
    if contains_any(&text.to_ascii_lowercase(), RECIPIENT_MARKERS) {
        PermanentError::InvalidRecipient(text)
    } else {
        PermanentError::Rejected(text)
    }
}

/// Classify a provider response
///
/// A refusal is transient when its error text matches a transient marker
/// (case-insensitive), terminal otherwise. A refusal without any text is
/// terminal.
#[must_use]
pub fn classify_response(response: ProviderResponse) -> AttemptOutcome {
    if response.success {
        return AttemptOutcome::Sent {
            provider_message_id: response.provider_message_id,
        };
    }

    let text = response
        .error_text
        .unwrap_or_else(|| "provider refused the message without a reason".to_string());

    if is_transient_error(&text) {
        AttemptOutcome::Transient(temporary_error(text))
    } else {
        AttemptOutcome::Terminal(permanent_error(text))
    }
}

/// Classify the outcome of a provider call made under a timeout
///
/// Transport errors and timeouts are always transient.
#[must_use]
pub fn classify(
    result: Result<Result<ProviderResponse, TransportError>, Elapsed>,
    timeout: Duration,
) -> AttemptOutcome {
    match result {
        Ok(Ok(response)) => classify_response(response),
        Ok(Err(TransportError(text))) => {
            let lower = text.to_ascii_lowercase();
            if contains_any(&lower, TIMEOUT_MARKERS) {
                AttemptOutcome::Transient(TemporaryError::Timeout(text))
            } else {
                AttemptOutcome::Transient(TemporaryError::Network(text))
            }
        }
        Err(_) => AttemptOutcome::Transient(TemporaryError::Timeout(format!(
            "provider call timed out after {}s",
            timeout.as_secs_f64()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn refused(text: &str) -> AttemptOutcome {
        classify_response(ProviderResponse::rejected(text))
    }

    #[test]
    fn test_success() {
        assert_eq!(
            classify_response(ProviderResponse::accepted("wamid.1")),
            AttemptOutcome::Sent {
                provider_message_id: Some("wamid.1".to_string())
            }
        );

        let no_id = ProviderResponse {
            success: true,
            provider_message_id: None,
            error_text: None,
        };
        assert_eq!(
            classify_response(no_id),
            AttemptOutcome::Sent {
                provider_message_id: None
            }
        );
    }

    #[test]
    fn test_transient_markers() {
        for text in [
            "Rate limit hit",
            "HTTP 429",
            "Too Many Requests",
            "503 Service Unavailable",
            "502 bad gateway",
            "504",
            "Temporarily unavailable",
            "Request TIMEOUT",
            "timed out waiting",
            "network unreachable",
            "Connection reset by peer",
            "connection refused",
            "server busy",
            "please try again",
        ] {
            assert_eq!(refused(text).label(), "transient", "{text}");
        }
    }

    #[test]
    fn test_transient_subkinds() {
        assert_eq!(
            refused("429 too many requests"),
            AttemptOutcome::Transient(TemporaryError::RateLimited(
                "429 too many requests".to_string()
            ))
        );
        assert_eq!(
            refused("503 busy"),
            AttemptOutcome::Transient(TemporaryError::ProviderUnavailable("503 busy".to_string()))
        );
        assert_eq!(
            refused("upstream timeout"),
            AttemptOutcome::Transient(TemporaryError::Timeout("upstream timeout".to_string()))
        );
        assert_eq!(
            refused("network is down"),
            AttemptOutcome::Transient(TemporaryError::Network("network is down".to_string()))
        );
    }

    #[test]
    fn test_terminal() {
        assert_eq!(
            refused("Invalid number"),
            AttemptOutcome::Terminal(PermanentError::InvalidRecipient(
                "Invalid number".to_string()
            ))
        );
        assert_eq!(
            refused("template not approved"),
            AttemptOutcome::Terminal(PermanentError::Rejected("template not approved".to_string()))
        );

        let silent = ProviderResponse {
            success: false,
            provider_message_id: None,
            error_text: None,
        };
        assert_eq!(classify_response(silent).label(), "terminal");
    }

    #[test]
    fn test_transport_errors_are_transient() {
        let outcome = classify(
            Ok(Err(TransportError("dns lookup failed".to_string()))),
            Duration::from_secs(20),
        );
        assert_eq!(
            outcome,
            AttemptOutcome::Transient(TemporaryError::Network("dns lookup failed".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_is_transient_timeout() {
        let elapsed = tokio::time::timeout(Duration::from_secs(1), std::future::pending::<()>())
            .await
            .map(|()| Ok(ProviderResponse::accepted("never")));

        let outcome = classify(elapsed, Duration::from_secs(1));
        assert!(matches!(
            outcome,
            AttemptOutcome::Transient(TemporaryError::Timeout(ref text)) if text.contains("timed out")
        ));
    }
}
