//! Classification of Gemini API errors
//!
//! The rotator never decides on its own whether a failure means "quota" or
//! "bad key"; the caller classifies the upstream response and reports the
//! result. These helpers map Gemini REST error responses onto the three
//! outcomes the pool understands.

/// How a failed upstream call should affect the key that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Network blip, 5xx, timeout: retry, key state untouched
    Transient,
    /// Rate limit or daily quota hit: key goes into cooldown
    QuotaExceeded,
    /// Key rejected by the API: key is disabled permanently
    Permanent,
}

impl ErrorClassification {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::QuotaExceeded => "quota_exceeded",
            ErrorClassification::Permanent => "permanent",
        }
    }
}

/// Body fragments Gemini uses for quota and rate-limit failures.
const QUOTA_PATTERNS: &[&str] = &["resource_exhausted", "quota", "rate limit"];

/// Body fragments Gemini uses for rejected keys. Gemini answers an unknown
/// key with 400 INVALID_ARGUMENT, so status alone is not enough.
const INVALID_KEY_PATTERNS: &[&str] = &[
    "api_key_invalid",
    "api key not valid",
    "api key expired",
    "permission_denied",
];

/// Classify an upstream error by HTTP status and response body.
///
/// Body patterns are checked first (case-insensitive) since they are more
/// specific than the status. Without a match: 429 is QuotaExceeded, 401/403
/// are Permanent, everything else is Transient.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    let lower = body.to_lowercase();
    if INVALID_KEY_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClassification::Permanent;
    }
    if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClassification::QuotaExceeded;
    }
    match status {
        429 => ErrorClassification::QuotaExceeded,
        401 | 403 => ErrorClassification::Permanent,
        _ => ErrorClassification::Transient,
    }
}
