//! Ordered pool of Gemini API keys loaded from the environment
//!
//! Numbered variables (`GEMINI_API_KEY_1`, `GEMINI_API_KEY_2`, …) are read
//! until the first gap. If none exist, the bare `GEMINI_API_KEY` is used as a
//! single-key pool. Position in the pool is the key's identity and priority.

use common::Secret;
use tracing::{info, warn};

/// Environment prefix used when none is configured.
pub const DEFAULT_ENV_PREFIX: &str = "GEMINI_API_KEY";

/// Immutable, ordered list of API keys. Earlier keys are tried first.
#[derive(Debug, Clone, Default)]
pub struct CredentialPool {
    keys: Vec<Secret<String>>,
}

impl CredentialPool {
    /// Build a pool from raw key strings, preserving order.
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(|k| Secret::new(k.into())).collect(),
        }
    }

    /// Load keys from the process environment.
    pub fn from_env(prefix: &str) -> Self {
        Self::from_lookup(prefix, |name| std::env::var(name).ok())
    }

    /// Load keys through an arbitrary variable lookup.
    ///
    /// Values are trimmed; blank values count as missing, so a blank
    /// `PREFIX_2` ends the numbered scan.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        let mut keys = Vec::new();
        for n in 1.. {
            match read(&format!("{prefix}_{n}")) {
                Some(key) => keys.push(Secret::new(key)),
                None => break,
            }
        }

        if keys.is_empty() {
            if let Some(key) = read(prefix) {
                keys.push(Secret::new(key));
            }
        }

        if keys.is_empty() {
            warn!(prefix, "no API keys found in environment");
        } else {
            info!(prefix, keys = keys.len(), "loaded API keys");
        }

        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Secret<String>> {
        self.keys.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Secret<String>> {
        self.keys.iter()
    }
}
