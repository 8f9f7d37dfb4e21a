//! Calling loop for outbound Gemini requests
//!
//! Each attempt takes exactly one key from the rotator and reports exactly
//! one outcome for it:
//! - success → `record_success`, stop
//! - quota/rate limit → `mark_exhausted`, try the next key
//! - rejected key → `mark_invalid`, try the next key
//! - anything else → no report, retry until `max_attempts` is used up
//!
//! The rotator stays synchronous; only the call itself is awaited. Timeouts
//! and cancellation belong to the caller's future.

use std::fmt::Display;
use std::future::Future;

use tracing::{debug, warn};

use crate::classify::{ErrorClassification, classify_status};
use crate::error::{Error, Result};
use crate::rotator::{KeyRotator, SelectedKey};

/// Errors that know how they should affect the key that produced them.
pub trait ClassifyError {
    fn classification(&self) -> ErrorClassification;
}

/// Non-success HTTP response from the Gemini API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Gemini API returned {status}: {body}")]
pub struct UpstreamError {
    pub status: u16,
    pub body: String,
}

impl ClassifyError for UpstreamError {
    fn classification(&self) -> ErrorClassification {
        classify_status(self.status, &self.body)
    }
}

/// Run `call` with keys from `rotator` until it succeeds or the pool gives up.
///
/// `max_attempts` defaults to the number of configured keys (at least 1).
/// Returns `NoCredentialAvailable` as soon as the rotator has no key to
/// offer, and `HighDemand` once every attempt has failed.
pub async fn with_rotation<T, E, F, Fut>(
    rotator: &KeyRotator,
    max_attempts: Option<usize>,
    mut call: F,
) -> Result<T>
where
    F: FnMut(SelectedKey) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: ClassifyError + Display,
{
    let max_attempts = max_attempts.unwrap_or_else(|| rotator.key_count()).max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let Some(selected) = rotator.next_credential() else {
            return Err(Error::NoCredentialAvailable);
        };
        let index = selected.index;

        match call(selected).await {
            Ok(value) => {
                rotator.record_success(index);
                debug!(attempt, key_index = index, "Gemini call succeeded");
                return Ok(value);
            }
            Err(e) => {
                let classification = e.classification();
                match classification {
                    ErrorClassification::QuotaExceeded => rotator.mark_exhausted(index),
                    ErrorClassification::Permanent => rotator.mark_invalid(index),
                    ErrorClassification::Transient => {}
                }
                warn!(
                    attempt,
                    max_attempts,
                    key_index = index,
                    classification = classification.label(),
                    error = %e,
                    "Gemini call failed"
                );
                last_error = e.to_string();
            }
        }
    }

    Err(Error::HighDemand {
        attempts: max_attempts,
        last_error,
    })
}
