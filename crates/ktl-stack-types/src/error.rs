use serde::{Deserialize, Serialize};

/// Closed error taxonomy for run failures. Classes drive retry decisions and
/// the adaptive concurrency controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    RateLimit,
    Conflict,
    Timeout,
    HookFailed,
    Canceled,
    Validation,
    BudgetExceeded,
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimit => "RATE_LIMIT",
            ErrorClass::Conflict => "CONFLICT",
            ErrorClass::Timeout => "TIMEOUT",
            ErrorClass::HookFailed => "HOOK_FAILED",
            ErrorClass::Canceled => "CANCELED",
            ErrorClass::Validation => "VALIDATION",
            ErrorClass::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorClass::Other => "OTHER",
        }
    }

    /// Whether a failure of this class may be retried when attempts remain.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorClass::RateLimit
                | ErrorClass::Conflict
                | ErrorClass::Timeout
                | ErrorClass::HookFailed
                | ErrorClass::Other
        )
    }

    /// Terminal classes end the node (or the run) regardless of the attempt
    /// budget.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorClass::Canceled | ErrorClass::Validation)
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RATE_LIMIT" => Ok(ErrorClass::RateLimit),
            "CONFLICT" => Ok(ErrorClass::Conflict),
            "TIMEOUT" => Ok(ErrorClass::Timeout),
            "HOOK_FAILED" => Ok(ErrorClass::HookFailed),
            "CANCELED" => Ok(ErrorClass::Canceled),
            "VALIDATION" => Ok(ErrorClass::Validation),
            "BUDGET_EXCEEDED" => Ok(ErrorClass::BudgetExceeded),
            "OTHER" => Ok(ErrorClass::Other),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}

/// Classify an executor error message. Matching is case-insensitive and
/// substring-based; `run_canceled` reports whether the run context was
/// already canceled when the error surfaced.
pub fn classify_error(message: &str, run_canceled: bool) -> ErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit")
    {
        return ErrorClass::RateLimit;
    }
    if lower.contains("conflict") || lower.contains("the object has been modified") {
        return ErrorClass::Conflict;
    }
    if run_canceled && (lower.contains("context canceled") || lower.contains("deadline exceeded")) {
        return ErrorClass::Canceled;
    }
    ErrorClass::Other
}

/// A classified failure attached to events and node state. The digest is
/// deterministic over `(class, message)` for clustering in audit views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub class: ErrorClass,
    pub message: String,
    #[serde(default)]
    pub digest: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_rate_limit_variants() {
        assert_eq!(classify_error("HTTP 429 from apiserver", false), ErrorClass::RateLimit);
        assert_eq!(classify_error("Too Many Requests", false), ErrorClass::RateLimit);
        assert_eq!(classify_error("client rate limit exceeded", false), ErrorClass::RateLimit);
    }

    #[test]
    fn classification_matches_conflicts() {
        assert_eq!(classify_error("Operation failed: Conflict", false), ErrorClass::Conflict);
        assert_eq!(
            classify_error("the object has been modified; please retry", false),
            ErrorClass::Conflict
        );
    }

    #[test]
    fn cancellation_requires_canceled_context() {
        assert_eq!(classify_error("context canceled", true), ErrorClass::Canceled);
        assert_eq!(classify_error("deadline exceeded", true), ErrorClass::Canceled);
        // Without a canceled run context these messages stay unclassified.
        assert_eq!(classify_error("deadline exceeded", false), ErrorClass::Other);
    }

    #[test]
    fn unknown_messages_fall_through_to_other() {
        assert_eq!(classify_error("boom", false), ErrorClass::Other);
    }

    #[test]
    fn retriability_per_class() {
        assert!(ErrorClass::RateLimit.is_retriable());
        assert!(ErrorClass::Conflict.is_retriable());
        assert!(ErrorClass::Other.is_retriable());
        assert!(!ErrorClass::Canceled.is_retriable());
        assert!(!ErrorClass::Validation.is_retriable());
        assert!(ErrorClass::Canceled.is_terminal());
    }

    #[test]
    fn class_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorClass::RateLimit).unwrap(),
            "\"RATE_LIMIT\""
        );
        let class: ErrorClass = serde_json::from_str("\"HOOK_FAILED\"").unwrap();
        assert_eq!(class, ErrorClass::HookFailed);
        assert_eq!("OTHER".parse::<ErrorClass>().unwrap(), ErrorClass::Other);
    }
}
