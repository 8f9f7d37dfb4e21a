//! Key rotation state machine
//!
//! Keys are offered in configured order: the first key that is neither
//! invalid nor cooling down and still has local quota wins. There is no
//! round-robin; lower indices are always preferred.
//!
//! Per-key state is derived from the `KeyBook`:
//! - Available: not invalid, not exhausted (may still be at its usage ceiling)
//! - Exhausted: has an exhaustion timestamp, recovers once the cooldown elapses
//! - Invalid: permanent
//!
//! Recovery happens lazily: every read runs a sweep that compares exhaustion
//! timestamps against the injected clock. Every mutation is written through
//! to the state store; store failures are logged and the in-memory state
//! stays authoritative.
//!
//! Several processes may share one state file (the service and the admin
//! CLI). Each operation reloads the store before reading or mutating, so a
//! write made elsewhere is merged rather than overwritten. While a save is
//! failing the reload is skipped and the in-memory book wins.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Secret;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::credentials::CredentialPool;
use crate::state::{JsonFileStore, KeyBook, StateStore};

/// Default local daily quota per key.
pub const DEFAULT_DAILY_LIMIT: u32 = 250;

/// Default time an exhausted key sits out before it is offered again.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Rotation limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotatorConfig {
    /// Successful calls allowed per key before it is skipped.
    pub daily_limit: u32,
    /// How long a key stays exhausted after `mark_exhausted`.
    pub cooldown: Duration,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Derived state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Available,
    /// `since` is `None` when the stored timestamp was unreadable.
    Exhausted { since: Option<DateTime<Utc>> },
    Invalid,
}

impl KeyState {
    /// Status label for diagnostics/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyState::Available => "available",
            KeyState::Exhausted { .. } => "exhausted",
            KeyState::Invalid => "invalid",
        }
    }
}

/// A key handed out for one outbound call.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub index: usize,
    pub key: Secret<String>,
}

/// Pool-wide counts for the diagnostics endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total_keys: usize,
    pub active_keys: usize,
    pub exhausted_keys: usize,
    pub invalid_keys: usize,
    pub total_remaining: u64,
}

/// Per-key view for operators. Never carries the key itself.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub index: usize,
    pub fingerprint: String,
    pub state: &'static str,
    pub usage: u32,
    pub remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exhausted_at: Option<DateTime<Utc>>,
}

/// Hands out Gemini API keys and tracks what happened to them.
///
/// All methods take `&self`; the book lives behind a mutex and store writes
/// happen while it is held, so one instance can be shared through an `Arc`
/// and a single process never interleaves writes to the state file.
pub struct KeyRotator {
    pool: CredentialPool,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: RotatorConfig,
    cooldown: chrono::Duration,
    book: Mutex<KeyBook>,
    /// Set while the last save failed, so the book is newer than the store.
    unsaved: AtomicBool,
}

impl KeyRotator {
    /// Build a rotator, reload persisted state, and clear stale cooldowns.
    ///
    /// A missing or unreadable state leaves every key Available with zero
    /// usage.
    pub fn new(
        pool: CredentialPool,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: RotatorConfig,
    ) -> Self {
        let cooldown = chrono::Duration::from_std(config.cooldown).unwrap_or(chrono::Duration::MAX);

        info!(
            keys = pool.len(),
            daily_limit = config.daily_limit,
            cooldown_secs = config.cooldown.as_secs(),
            "key rotator initialized"
        );

        let rotator = Self {
            pool,
            store,
            clock,
            config,
            cooldown,
            book: Mutex::new(KeyBook::default()),
            unsaved: AtomicBool::new(false),
        };
        {
            let mut book = rotator.lock();
            rotator.recover(&mut book);
        }
        rotator
    }

    /// Rotator over a JSON state file using the system clock.
    pub fn open(pool: CredentialPool, state_path: impl Into<PathBuf>, config: RotatorConfig) -> Self {
        Self::new(
            pool,
            Arc::new(JsonFileStore::new(state_path)),
            Arc::new(SystemClock),
            config,
        )
    }

    pub fn config(&self) -> RotatorConfig {
        self.config
    }

    /// Number of configured keys.
    pub fn key_count(&self) -> usize {
        self.pool.len()
    }

    /// First eligible key in priority order, or `None` when the pool has no
    /// capacity left.
    pub fn next_credential(&self) -> Option<SelectedKey> {
        let mut book = self.lock();
        self.recover(&mut book);

        for (index, key) in self.pool.iter().enumerate() {
            if self.is_eligible(&book, index) {
                debug!(key_index = index, key = %key.fingerprint(), "selected API key");
                metrics::counter!("gemini_key_selections_total", "key_index" => index.to_string())
                    .increment(1);
                return Some(SelectedKey {
                    index,
                    key: key.clone(),
                });
            }
        }

        warn!(
            keys = self.pool.len(),
            exhausted = book.exhausted.len(),
            invalid = book.invalid.len(),
            "no API key available"
        );
        metrics::counter!("gemini_pool_exhausted_total").increment(1);
        None
    }

    /// Count one successful call against `index`.
    ///
    /// Reaching the daily limit here does not start a cooldown; the key is
    /// simply skipped by `next_credential` until something resets its count.
    /// Usage is capped at the limit.
    pub fn record_success(&self, index: usize) {
        let mut book = self.lock();
        self.warn_if_unknown(index);

        let limit = self.config.daily_limit;
        let usage = book.usage.entry(index).or_insert(0);
        if *usage >= limit {
            warn!(
                key_index = index,
                usage = *usage,
                daily_limit = limit,
                "success reported for key at its daily limit"
            );
            *usage = limit;
        } else {
            *usage += 1;
        }
        let usage = *usage;
        let remaining = self.config.daily_limit.saturating_sub(usage);

        info!(key_index = index, usage, remaining, "recorded successful call");
        metrics::counter!("gemini_key_success_total", "key_index" => index.to_string())
            .increment(1);
        self.persist(&book);
    }

    /// Put `index` into cooldown after the API reported a quota/rate-limit
    /// error for it. Its usage is pinned at the daily limit.
    pub fn mark_exhausted(&self, index: usize) {
        let mut book = self.lock();
        self.warn_if_unknown(index);

        let now = self.clock.now();
        book.exhausted.insert(index, Some(now));
        book.usage.insert(index, self.config.daily_limit);

        warn!(
            key_index = index,
            cooldown_secs = self.config.cooldown.as_secs(),
            "API key exhausted, entering cooldown"
        );
        metrics::counter!("gemini_key_exhausted_total", "key_index" => index.to_string())
            .increment(1);
        self.persist(&book);
    }

    /// Disable `index` permanently after the API rejected it.
    pub fn mark_invalid(&self, index: usize) {
        let mut book = self.lock();
        self.warn_if_unknown(index);

        if book.invalid.contains(&index) {
            debug!(key_index = index, "API key already invalid");
        } else {
            book.invalid.push(index);
            warn!(key_index = index, "API key marked invalid");
            metrics::counter!("gemini_key_invalidated_total", "key_index" => index.to_string())
                .increment(1);
        }
        self.persist(&book);
    }

    /// Calls left today across keys that are neither invalid nor cooling
    /// down.
    pub fn total_remaining(&self) -> u64 {
        let mut book = self.lock();
        self.recover(&mut book);
        self.remaining_in(&book)
    }

    /// Pool summary. Only configured indices are counted; a key that is both
    /// invalid and exhausted counts as invalid.
    pub fn status(&self) -> PoolStatus {
        let mut book = self.lock();
        self.recover(&mut book);

        let total_keys = self.pool.len();
        let mut exhausted_keys = 0;
        let mut invalid_keys = 0;
        for index in 0..total_keys {
            if book.is_invalid(index) {
                invalid_keys += 1;
            } else if book.is_exhausted(index) {
                exhausted_keys += 1;
            }
        }

        PoolStatus {
            total_keys,
            active_keys: total_keys - exhausted_keys - invalid_keys,
            exhausted_keys,
            invalid_keys,
            total_remaining: self.remaining_in(&book),
        }
    }

    /// Current state of one key.
    pub fn key_state(&self, index: usize) -> KeyState {
        let mut book = self.lock();
        self.recover(&mut book);
        state_of(&book, index)
    }

    /// Recorded usage for one key.
    pub fn usage(&self, index: usize) -> u32 {
        let mut book = self.lock();
        self.recover(&mut book);
        book.usage(index)
    }

    /// Per-key snapshots in priority order.
    pub fn key_states(&self) -> Vec<KeySnapshot> {
        let mut book = self.lock();
        self.recover(&mut book);

        self.pool
            .iter()
            .enumerate()
            .map(|(index, key)| {
                let state = state_of(&book, index);
                let usage = book.usage(index);
                let remaining = match state {
                    KeyState::Available => self.config.daily_limit.saturating_sub(usage),
                    _ => 0,
                };
                KeySnapshot {
                    index,
                    fingerprint: key.fingerprint(),
                    state: state.label(),
                    usage,
                    remaining,
                    exhausted_at: match state {
                        KeyState::Exhausted { since } => since,
                        _ => None,
                    },
                }
            })
            .collect()
    }

    /// Lock the book and pick up whatever other writers saved since our last
    /// save. A store with nothing usable leaves the book as it is.
    fn lock(&self) -> MutexGuard<'_, KeyBook> {
        let mut book = self.book.lock().unwrap_or_else(|e| e.into_inner());
        if !self.unsaved.load(Ordering::Relaxed) {
            if let Some(state) = self.store.load() {
                *book = KeyBook::from(state);
            }
        }
        book
    }

    fn is_eligible(&self, book: &KeyBook, index: usize) -> bool {
        !book.is_invalid(index)
            && !book.is_exhausted(index)
            && book.usage(index) < self.config.daily_limit
    }

    fn remaining_in(&self, book: &KeyBook) -> u64 {
        (0..self.pool.len())
            .filter(|&index| !book.is_invalid(index) && !book.is_exhausted(index))
            .map(|index| u64::from(self.config.daily_limit.saturating_sub(book.usage(index))))
            .sum()
    }

    /// Recovery sweep: clear cooldowns that have run their course.
    ///
    /// Unreadable timestamps recover immediately. Timestamps in the future
    /// never do until the clock catches up. Persists only if something
    /// changed.
    fn recover(&self, book: &mut KeyBook) {
        let now = self.clock.now();
        let recovered: Vec<usize> = book
            .exhausted
            .iter()
            .filter(|(_, at)| match at {
                Some(at) => now.signed_duration_since(*at) >= self.cooldown,
                None => true,
            })
            .map(|(index, _)| *index)
            .collect();

        if recovered.is_empty() {
            return;
        }

        for index in &recovered {
            book.exhausted.remove(index);
            book.usage.insert(*index, 0);
            info!(key_index = *index, "cooldown expired, API key available again");
            metrics::counter!("gemini_key_recovered_total", "key_index" => index.to_string())
                .increment(1);
        }
        self.persist(book);
    }

    fn persist(&self, book: &KeyBook) {
        match self.store.save(&book.to_persisted()) {
            Ok(()) => self.unsaved.store(false, Ordering::Relaxed),
            Err(e) => {
                self.unsaved.store(true, Ordering::Relaxed);
                warn!(error = %e, "failed to persist key state, keeping in-memory state");
            }
        }
    }

    fn warn_if_unknown(&self, index: usize) {
        if index >= self.pool.len() {
            warn!(key_index = index, keys = self.pool.len(), "outcome reported for unconfigured key");
        }
    }
}

fn state_of(book: &KeyBook, index: usize) -> KeyState {
    if book.is_invalid(index) {
        KeyState::Invalid
    } else if let Some(since) = book.exhausted.get(&index) {
        KeyState::Exhausted { since: *since }
    } else {
        KeyState::Available
    }
}
