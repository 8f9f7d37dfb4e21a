//! Persisted key usage state
//!
//! On disk the state is a single JSON object:
//!
//! ```json
//! {
//!   "usage": { "key_0": 12, "key_1": 250 },
//!   "exhausted_keys": { "key_1": "2025-03-01T08:00:00+00:00" },
//!   "invalid_keys": [2]
//! }
//! ```
//!
//! Unknown fields are ignored and missing fields default to empty, so older
//! and newer writers can share a file. Writers that emit exhaustion times
//! without an offset are assumed to have used local time. In memory the rotator works on a
//! `KeyBook` indexed by key position.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// File name used under the data directory when none is configured.
pub const DEFAULT_STATE_FILE: &str = "api_key_usage.json";

const KEY_NAME_PREFIX: &str = "key_";

/// Wire format of the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub usage: BTreeMap<String, u32>,
    #[serde(default)]
    pub exhausted_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub invalid_keys: Vec<usize>,
}

/// Name of a key's entry in the `usage` and `exhausted_keys` maps.
pub(crate) fn key_name(index: usize) -> String {
    format!("{KEY_NAME_PREFIX}{index}")
}

fn parse_key_name(name: &str) -> Option<usize> {
    name.strip_prefix(KEY_NAME_PREFIX)?.parse().ok()
}

/// Parse an exhaustion timestamp.
///
/// Accepts RFC 3339 and offset-less ISO-8601. Offset-less values are wall
/// clock time of the host that wrote them and are read in the local zone;
/// a local time skipped by a DST jump falls back to UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Some(
        naive
            .and_local_timezone(Local)
            .earliest()
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(|| naive.and_utc()),
    )
}

/// Typed, index-keyed view of `PersistedState`.
///
/// An exhausted entry holding `None` had a timestamp that could not be parsed;
/// the recovery sweep treats it as already expired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct KeyBook {
    pub usage: BTreeMap<usize, u32>,
    pub exhausted: BTreeMap<usize, Option<DateTime<Utc>>>,
    pub invalid: Vec<usize>,
}

impl KeyBook {
    pub fn usage(&self, index: usize) -> u32 {
        self.usage.get(&index).copied().unwrap_or(0)
    }

    pub fn is_invalid(&self, index: usize) -> bool {
        self.invalid.contains(&index)
    }

    pub fn is_exhausted(&self, index: usize) -> bool {
        self.exhausted.contains_key(&index)
    }

    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            usage: self
                .usage
                .iter()
                .map(|(index, count)| (key_name(*index), *count))
                .collect(),
            exhausted_keys: self
                .exhausted
                .iter()
                .map(|(index, at)| {
                    // Unparseable markers are written back as empty strings so
                    // they stay recoverable on the next load.
                    let raw = at.map(|ts| ts.to_rfc3339()).unwrap_or_default();
                    (key_name(*index), raw)
                })
                .collect(),
            invalid_keys: self.invalid.clone(),
        }
    }
}

impl From<PersistedState> for KeyBook {
    fn from(state: PersistedState) -> Self {
        let mut book = KeyBook::default();

        for (name, count) in state.usage {
            match parse_key_name(&name) {
                Some(index) => {
                    book.usage.insert(index, count);
                }
                None => debug!(entry = %name, "ignoring malformed usage entry"),
            }
        }

        for (name, raw) in state.exhausted_keys {
            match parse_key_name(&name) {
                Some(index) => {
                    let at = parse_timestamp(&raw);
                    if at.is_none() {
                        warn!(key_index = index, raw = %raw, "unparseable exhaustion timestamp");
                    }
                    book.exhausted.insert(index, at);
                }
                None => debug!(entry = %name, "ignoring malformed exhausted entry"),
            }
        }

        for index in state.invalid_keys {
            if !book.invalid.contains(&index) {
                book.invalid.push(index);
            }
        }

        book
    }
}

/// Durable backend for rotator state.
///
/// `load` returns `None` when there is nothing usable to load; the rotator
/// then starts from an empty state.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Option<PersistedState>;

    fn save(&self, state: &PersistedState) -> Result<()>;
}

/// JSON file backend.
///
/// Every save rewrites the whole file through a temp file + rename, so a
/// crash mid-write leaves the previous contents intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<data_dir>/<file_name>`.
    pub fn in_dir(data_dir: impl AsRef<Path>, file_name: &str) -> Self {
        Self::new(data_dir.as_ref().join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Option<PersistedState> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "state file not found");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read state file, starting fresh");
                return None;
            }
        };

        match serde_json::from_str::<PersistedState>(&contents) {
            Ok(state) => {
                debug!(
                    path = %self.path.display(),
                    tracked = state.usage.len(),
                    exhausted = state.exhausted_keys.len(),
                    invalid = state.invalid_keys.len(),
                    "loaded key state"
                );
                Some(state)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                None
            }
        }
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        write_atomic(&self.path, state)
    }
}

/// Write state to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. The parent directory is created if missing. Permissions are
/// 0600 on unix.
fn write_atomic(path: &Path, state: &PersistedState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::StateParse(format!("serializing key state: {e}")))?;

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Io(format!("creating data directory {}: {e}", dir.display())))?;

    let tmp_path = dir.join(format!(".key-state.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes())
        .map_err(|e| Error::Io(format!("writing temp state file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::Io(format!("setting state file permissions: {e}")))?;
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Io(format!("renaming temp state file: {e}")))?;

    debug!(path = %path.display(), "persisted key state");
    Ok(())
}

/// In-memory backend for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<PersistedState>>,
    fail_writes: Mutex<bool>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `state`, as if a previous process had saved it.
    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    /// Make subsequent saves fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    /// Last successfully saved state.
    pub fn snapshot(&self) -> Option<PersistedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Option<PersistedState> {
        self.snapshot()
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        if *self.fail_writes.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(Error::Io("memory store configured to fail writes".into()));
        }
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_state() -> PersistedState {
        let mut state = PersistedState::default();
        state.usage.insert("key_0".into(), 3);
        state.usage.insert("key_1".into(), 250);
        state
            .exhausted_keys
            .insert("key_1".into(), "2025-03-01T08:00:00+00:00".into());
        state.invalid_keys.push(2);
        state
    }

    #[test]
    fn parses_documented_wire_format() {
        let json = r#"{
            "usage": { "key_0": 7, "key_3": 1 },
            "exhausted_keys": { "key_3": "2025-03-01T08:00:00.123456" },
            "invalid_keys": [1, 4]
        }"#;
        let state: PersistedState = serde_json::from_str(json).unwrap();
        assert_eq!(state.usage["key_0"], 7);
        assert_eq!(state.exhausted_keys["key_3"], "2025-03-01T08:00:00.123456");
        assert_eq!(state.invalid_keys, vec![1, 4]);
    }

    #[test]
    fn unknown_fields_ignored_and_missing_fields_default() {
        let json = r#"{ "usage": { "key_0": 2 }, "schema_version": 3, "notes": "x" }"#;
        let state: PersistedState = serde_json::from_str(json).unwrap();
        assert_eq!(state.usage["key_0"], 2);
        assert!(state.exhausted_keys.is_empty());
        assert!(state.invalid_keys.is_empty());
    }

    #[test]
    fn key_book_indexes_entries() {
        let book = KeyBook::from(sample_state());
        assert_eq!(book.usage(0), 3);
        assert_eq!(book.usage(1), 250);
        assert_eq!(book.usage(9), 0);
        assert!(book.is_exhausted(1));
        assert!(!book.is_exhausted(0));
        assert!(book.is_invalid(2));
        assert_eq!(
            book.exhausted[&1],
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap())
        );
    }

    #[test]
    fn key_book_drops_malformed_names_and_duplicate_invalids() {
        let mut state = PersistedState::default();
        state.usage.insert("key_x".into(), 5);
        state.usage.insert("other".into(), 5);
        state.exhausted_keys.insert("k1".into(), "2025-03-01T08:00:00Z".into());
        state.invalid_keys = vec![3, 3, 1];

        let book = KeyBook::from(state);
        assert!(book.usage.is_empty());
        assert!(book.exhausted.is_empty());
        assert_eq!(book.invalid, vec![3, 1]);
    }

    #[test]
    fn key_book_keeps_unparseable_timestamp_as_none() {
        let mut state = PersistedState::default();
        state.exhausted_keys.insert("key_0".into(), "yesterday-ish".into());
        let book = KeyBook::from(state);
        assert_eq!(book.exhausted.get(&0), Some(&None));
    }

    #[test]
    fn key_book_round_trips_through_wire_format() {
        let book = KeyBook::from(sample_state());
        let again = KeyBook::from(book.to_persisted());
        assert_eq!(book, again);
    }

    #[test]
    fn timestamps_accept_rfc3339_and_naive_iso() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2025-03-01T08:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-03-01T10:00:00+02:00"), Some(expected));
        assert!(parse_timestamp("2025-03-01T08:00:00.5").is_some());
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("not a time"), None);
    }

    #[test]
    fn naive_timestamps_are_local_time() {
        let naive = NaiveDateTime::parse_from_str("2025-03-01T08:00:00", "%Y-%m-%dT%H:%M:%S").unwrap();
        let expected = Local
            .from_local_datetime(&naive)
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_timestamp("2025-03-01T08:00:00"), Some(expected));
    }

    #[test]
    fn file_store_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), DEFAULT_STATE_FILE);
        assert!(store.load().is_none());
    }

    #[test]
    fn file_store_corrupt_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_STATE_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(JsonFileStore::new(&path).load().is_none());
    }

    #[test]
    fn file_store_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), DEFAULT_STATE_FILE);
        store.save(&sample_state()).unwrap();

        let reopened = JsonFileStore::in_dir(dir.path(), DEFAULT_STATE_FILE);
        assert_eq!(reopened.load(), Some(sample_state()));
    }

    #[test]
    fn file_store_creates_data_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data").join("keys");
        let store = JsonFileStore::in_dir(&nested, DEFAULT_STATE_FILE);
        store.save(&PersistedState::default()).unwrap();
        assert!(nested.join(DEFAULT_STATE_FILE).exists());
    }

    #[test]
    fn file_store_writes_documented_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), DEFAULT_STATE_FILE);
        store.save(&sample_state()).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["usage"]["key_1"], 250);
        assert_eq!(value["exhausted_keys"]["key_1"], "2025-03-01T08:00:00+00:00");
        assert_eq!(value["invalid_keys"], serde_json::json!([2]));
    }

    #[test]
    fn file_store_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), DEFAULT_STATE_FILE);
        store.save(&sample_state()).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![DEFAULT_STATE_FILE.to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn file_store_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), DEFAULT_STATE_FILE);
        store.save(&sample_state()).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "state file must be 0600, got {mode:o}");
    }

    #[test]
    fn file_store_save_into_file_path_parent_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let store = JsonFileStore::in_dir(&blocker, DEFAULT_STATE_FILE);
        let err = store.save(&sample_state()).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "got: {err:?}");
    }

    #[test]
    fn memory_store_records_saves_and_can_fail() {
        let store = MemoryStore::new();
        assert!(store.load().is_none());

        store.save(&sample_state()).unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load(), Some(sample_state()));

        store.fail_writes(true);
        assert!(store.save(&PersistedState::default()).is_err());
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.snapshot(), Some(sample_state()));
    }
}
