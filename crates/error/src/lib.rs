//! # weir-error
//!
//! Unified error types for the Weir federated query gateway.
//!
//! Every error carries a stable wire code, a human-readable message, and,
//! where applicable, structured hints: which source failed and how long to
//! wait before retrying.

mod code;

pub use code::ErrorCode;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The unified error type for all Weir operations.
///
/// Serialized as the `error` object of an API error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeirError {
    /// Stable wire code (e.g. `RATE_LIMIT_EXHAUSTED`).
    pub code: ErrorCode,

    /// Human-readable error message.
    pub message: String,

    /// The source the failure originated from, when one is responsible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,

    /// Backoff hint for throttled callers, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    /// Correlation ID echoed from the request, when one was supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl WeirError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source_name: None,
            retry_after_ms: None,
            trace_id: None,
        }
    }

    pub fn plan_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PlanFailed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_name = Some(source.into());
        self
    }

    pub fn with_retry_after_ms(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Serialize to JSON for API responses.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("failed to serialize WeirError: {}", e);
            format!(
                r#"{{"code":"{}","message":"serialization failed"}}"#,
                self.code
            )
        })
    }
}

impl fmt::Display for WeirError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(source) = &self.source_name {
            write!(f, " (source: {})", source)?;
        }
        if let Some(ms) = self.retry_after_ms {
            write!(f, " (retry after {}ms)", ms)?;
        }
        Ok(())
    }
}

impl std::error::Error for WeirError {}

/// Result type alias for Weir operations.
pub type Result<T> = std::result::Result<T, WeirError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_hints() {
        let err = WeirError::new(ErrorCode::RateLimitExhausted, "bucket empty")
            .with_source("github")
            .with_retry_after_ms(9000)
            .with_trace_id("abc-123");

        assert_eq!(err.code, ErrorCode::RateLimitExhausted);
        assert_eq!(err.source_name.as_deref(), Some("github"));
        assert_eq!(err.retry_after_ms, Some(9000));
        assert_eq!(err.trace_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn display_includes_code_and_hints() {
        let err = WeirError::new(ErrorCode::SourceTimeout, "deadline exceeded")
            .with_source("jira");
        assert_eq!(
            err.to_string(),
            "[SOURCE_TIMEOUT] deadline exceeded (source: jira)"
        );

        let bare = WeirError::plan_failed("unknown qualifier 'x'");
        assert_eq!(bare.to_string(), "[PLAN_FAILED] unknown qualifier 'x'");
    }

    #[test]
    fn json_output_contains_wire_code() {
        let err = WeirError::new(ErrorCode::RateLimitExhausted, "slow down")
            .with_retry_after_ms(250);
        let json = err.to_json();
        assert!(json.contains("\"code\":\"RATE_LIMIT_EXHAUSTED\""));
        assert!(json.contains("\"retry_after_ms\":250"));
        // Unset hints are omitted entirely
        assert!(!json.contains("source_name"));
    }
}
