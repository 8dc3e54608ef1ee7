use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire error codes for the federated pipeline.
///
/// Codes are stable strings (semver contract); they appear verbatim in API
/// error bodies and in warning lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    /// SQL unsupported or ambiguous; unresolved qualifier; DDL/DML attempted.
    PlanFailed,
    /// Token bucket empty for a (source, tenant) pair.
    RateLimitExhausted,
    /// A connector exceeded its deadline.
    SourceTimeout,
    /// Warning, not an error: a rowset exceeded the requested staleness but
    /// was served anyway because upstream was unavailable.
    StaleData,
    /// Security rules left the query without required input, or a required
    /// projected column is blocked.
    EntitlementDenied,
    /// A connector returned a structured failure other than throttling or
    /// timeout.
    SourceError,
    /// Bug, analytical runtime failure, or serialization failure.
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanFailed => "PLAN_FAILED",
            Self::RateLimitExhausted => "RATE_LIMIT_EXHAUSTED",
            Self::SourceTimeout => "SOURCE_TIMEOUT",
            Self::StaleData => "STALE_DATA",
            Self::EntitlementDenied => "ENTITLEMENT_DENIED",
            Self::SourceError => "SOURCE_ERROR",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether a fetch failure with this code may be satisfied from a stale
    /// cache entry instead of failing the query.
    pub fn allows_stale_fallback(&self) -> bool {
        matches!(self, Self::RateLimitExhausted | Self::SourceTimeout)
    }

    /// HTTP status the API surface maps this code to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::PlanFailed => 400,
            Self::RateLimitExhausted => 429,
            Self::SourceTimeout => 504,
            Self::StaleData => 200,
            Self::EntitlementDenied => 403,
            Self::SourceError => 502,
            Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str().to_string()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.as_str() {
            "PLAN_FAILED" => Ok(Self::PlanFailed),
            "RATE_LIMIT_EXHAUSTED" => Ok(Self::RateLimitExhausted),
            "SOURCE_TIMEOUT" => Ok(Self::SourceTimeout),
            "STALE_DATA" => Ok(Self::StaleData),
            "ENTITLEMENT_DENIED" => Ok(Self::EntitlementDenied),
            "SOURCE_ERROR" => Ok(Self::SourceError),
            "INTERNAL" => Ok(Self::Internal),
            other => Err(format!("unknown error code: {}", other)),
        }
    }
}
