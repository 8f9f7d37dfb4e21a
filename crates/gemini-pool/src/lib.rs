//! Gemini API key pool
//!
//! Rotates outbound Gemini calls across several API keys, each with a local
//! daily quota. Keys move between three states:
//!
//! 1. `Available` → selected in configured order while `usage < daily_limit`
//! 2. Upstream quota/rate-limit error → `Exhausted` for the cooldown (24h)
//! 3. Upstream auth error → `Invalid`, permanently
//! 4. Cooldown elapsed → back to `Available` with usage reset, checked lazily
//!    on every read rather than by a timer
//!
//! State is written through to a JSON file after every mutation so quotas
//! survive restarts. `with_rotation` implements the calling loop that pairs
//! each attempt with exactly one outcome report.

pub mod attempt;
pub mod classify;
pub mod clock;
pub mod credentials;
pub mod error;
pub mod rotator;
pub mod state;

pub use attempt::{ClassifyError, UpstreamError, with_rotation};
pub use classify::{ErrorClassification, classify_status};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{CredentialPool, DEFAULT_ENV_PREFIX};
pub use error::{Error, Result};
pub use rotator::{KeyRotator, KeySnapshot, KeyState, PoolStatus, RotatorConfig, SelectedKey};
pub use state::{DEFAULT_STATE_FILE, JsonFileStore, MemoryStore, PersistedState, StateStore};
