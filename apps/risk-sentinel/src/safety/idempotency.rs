//! Idempotency table for enforcement.
//!
//! Entries are keyed by a SHA-256 of the plan's canonical content and scoped
//! to the account that produced them. The table is bounded by `max_keys`
//! (oldest-created evicted first) and entries older than `ttl` are evicted on
//! every write.
//!
//! A completed key only covers an unbroken run of identical plans for its
//! account: [`IdempotencyStore::supersede`] drops an account's entries as soon
//! as a later evaluation yields a different plan.
//!
//! A store opened with [`IdempotencyStore::open`] rewrites its JSON file after
//! every mutation (temp file, then rename) and reloads it on open, under the
//! same single-writer contract as the lockout store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{AccountId, Action, ActionPlan};

/// Idempotency store error.
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    /// Filesystem failure.
    #[error("idempotency store I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Table could not be encoded or parsed.
    #[error("corrupt idempotency table at {path}: {source}")]
    Corrupt {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Lifecycle of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// Execution started and has not finished.
    Processing,
    /// At least one action succeeded.
    Completed,
    /// Every action failed.
    Failed,
}

/// One idempotency record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyEntry<R> {
    /// Plan hash.
    pub key: String,
    /// Owner of the key, normally the account ID.
    #[serde(default)]
    pub scope: String,
    /// Current status.
    pub status: IdempotencyStatus,
    /// First seen.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// Stored outcome once finished.
    pub result: Option<R>,
}

/// Outcome of [`IdempotencyStore::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin<R> {
    /// Key is now `processing`; the caller owns execution.
    Started,
    /// Key already completed; the stored result is returned.
    AlreadyCompleted(R),
    /// Another execution holds the key.
    InProgress,
}

/// Bounds for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// Maximum live entries.
    pub max_keys: usize,
    /// Entry lifetime.
    pub ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            max_keys: 10_000,
            ttl: Duration::hours(24),
        }
    }
}

#[derive(Debug)]
struct Table<R> {
    entries: HashMap<String, IdempotencyEntry<R>>,
    order: VecDeque<String>,
}

impl<R> Table<R> {
    fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn remove(&mut self, key: &str) -> Option<IdempotencyEntry<R>> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }
}

#[derive(Serialize, Deserialize)]
#[serde(bound(deserialize = "R: DeserializeOwned"))]
struct Snapshot<R> {
    entries: Vec<IdempotencyEntry<R>>,
}

/// Bounded, TTL-evicting idempotency table.
#[derive(Debug)]
pub struct IdempotencyStore<R> {
    config: IdempotencyConfig,
    path: Option<PathBuf>,
    table: Mutex<Table<R>>,
}

impl<R: Clone + Serialize + DeserializeOwned> IdempotencyStore<R> {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new(config: IdempotencyConfig) -> Self {
        Self {
            config,
            path: None,
            table: Mutex::new(Table::empty()),
        }
    }

    /// Open a file-backed store, loading the entries a previous process left.
    ///
    /// Entries still `processing` are kept as they are: the process that
    /// claimed them may have sent orders before it stopped.
    pub fn open(path: impl Into<PathBuf>, config: IdempotencyConfig) -> Result<Self, IdempotencyError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| IdempotencyError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut table = Table::empty();
        if let Some(mut entries) = read_snapshot::<R>(&path)? {
            entries.sort_by_key(|e| e.created_at);
            for entry in entries {
                table.order.push_back(entry.key.clone());
                table.entries.insert(entry.key.clone(), entry);
            }
        }

        let store = Self {
            config,
            path: Some(path),
            table: Mutex::new(table),
        };
        {
            let mut table = store.table.lock();
            store.evict(&mut table, Utc::now());
            tracing::debug!(
                path = ?store.path,
                entries = table.entries.len(),
                "Idempotency table loaded"
            );
        }
        Ok(store)
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry for `key`, if present and unexpired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<IdempotencyEntry<R>> {
        self.get_at(key, Utc::now())
    }

    /// [`get`](Self::get) evaluated at `now`.
    #[must_use]
    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<IdempotencyEntry<R>> {
        let table = self.table.lock();
        table
            .entries
            .get(key)
            .filter(|e| now - e.created_at < self.config.ttl)
            .cloned()
    }

    /// Atomically check `key` and claim it for execution on behalf of `scope`.
    ///
    /// A `failed` or unknown key is (re)claimed; `completed` and `processing`
    /// keys are not. When the claim cannot be persisted it is rolled back and
    /// the error returned, so nothing is executed without a durable claim.
    pub fn begin(&self, scope: &str, key: &str) -> Result<Begin<R>, IdempotencyError> {
        self.begin_at(scope, key, Utc::now())
    }

    /// [`begin`](Self::begin) evaluated at `now`.
    pub fn begin_at(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Begin<R>, IdempotencyError> {
        let mut table = self.table.lock();
        self.evict(&mut table, now);

        let previous = table.entries.get(key).cloned();
        if let Some(entry) = &previous {
            match entry.status {
                IdempotencyStatus::Processing => return Ok(Begin::InProgress),
                IdempotencyStatus::Completed => {
                    return Ok(entry
                        .result
                        .clone()
                        .map_or(Begin::InProgress, Begin::AlreadyCompleted));
                }
                IdempotencyStatus::Failed => {}
            }
        }

        self.upsert(&mut table, scope, key, IdempotencyStatus::Processing, None, now);
        if let Err(e) = self.persist(&table) {
            match previous {
                Some(entry) => {
                    table.entries.insert(key.to_string(), entry);
                }
                None => {
                    table.remove(key);
                }
            }
            return Err(e);
        }
        Ok(Begin::Started)
    }

    /// Mark `key` as `processing`.
    pub fn set_processing(&self, scope: &str, key: &str) -> Result<(), IdempotencyError> {
        let now = Utc::now();
        let mut table = self.table.lock();
        self.evict(&mut table, now);
        self.upsert(&mut table, scope, key, IdempotencyStatus::Processing, None, now);
        self.persist(&table)
    }

    /// Mark `key` as `completed` with its result.
    pub fn mark_completed(&self, key: &str, result: R) -> Result<(), IdempotencyError> {
        self.finish(key, IdempotencyStatus::Completed, result)
    }

    /// Mark `key` as `failed` with its result.
    pub fn mark_failed(&self, key: &str, result: R) -> Result<(), IdempotencyError> {
        self.finish(key, IdempotencyStatus::Failed, result)
    }

    /// Drop every entry of `scope` except `current`. Returns how many were
    /// removed.
    ///
    /// Called with the key of each new evaluation (`None` for a no-op plan),
    /// so a completed key stops covering a breach that returns after the
    /// account changed state.
    pub fn supersede(&self, scope: &str, current: Option<&str>) -> Result<usize, IdempotencyError> {
        let mut table = self.table.lock();
        let stale: Vec<String> = table
            .entries
            .values()
            .filter(|e| e.scope == scope && Some(e.key.as_str()) != current)
            .map(|e| e.key.clone())
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        for key in &stale {
            table.remove(key);
        }
        tracing::debug!(scope, removed = stale.len(), "Superseded idempotency entries");
        self.persist(&table)?;
        Ok(stale.len())
    }

    fn finish(&self, key: &str, status: IdempotencyStatus, result: R) -> Result<(), IdempotencyError> {
        let now = Utc::now();
        let mut table = self.table.lock();
        self.evict(&mut table, now);
        let scope = table
            .entries
            .get(key)
            .map(|e| e.scope.clone())
            .unwrap_or_default();
        self.upsert(&mut table, &scope, key, status, Some(result), now);
        self.persist(&table)
    }

    fn upsert(
        &self,
        table: &mut Table<R>,
        scope: &str,
        key: &str,
        status: IdempotencyStatus,
        result: Option<R>,
        now: DateTime<Utc>,
    ) {
        if let Some(entry) = table.entries.get_mut(key) {
            entry.status = status;
            entry.updated_at = now;
            if result.is_some() {
                entry.result = result;
            }
            return;
        }

        while table.entries.len() >= self.config.max_keys.max(1) {
            let Some(oldest) = table.order.pop_front() else {
                break;
            };
            table.entries.remove(&oldest);
            tracing::debug!(key = %oldest, "Idempotency entry evicted at capacity");
        }

        table.entries.insert(
            key.to_string(),
            IdempotencyEntry {
                key: key.to_string(),
                scope: scope.to_string(),
                status,
                created_at: now,
                updated_at: now,
                result,
            },
        );
        table.order.push_back(key.to_string());
    }

    fn evict(&self, table: &mut Table<R>, now: DateTime<Utc>) {
        // `order` is sorted by creation time, so expired keys sit at the front.
        while let Some(front) = table.order.front() {
            let expired = table
                .entries
                .get(front)
                .is_none_or(|e| now - e.created_at >= self.config.ttl);
            if !expired {
                break;
            }
            if let Some(key) = table.order.pop_front() {
                table.entries.remove(&key);
            }
        }
    }

    /// Rewrite the backing file. Callers hold the table lock, which also
    /// serializes writers.
    fn persist(&self, table: &Table<R>) -> Result<(), IdempotencyError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            entries: table
                .order
                .iter()
                .filter_map(|k| table.entries.get(k).cloned())
                .collect(),
        };
        let json = serde_json::to_vec(&snapshot).map_err(|e| IdempotencyError::Corrupt {
            path: path.clone(),
            source: e,
        })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| IdempotencyError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, path).map_err(|e| IdempotencyError::Io {
            path: path.clone(),
            source: e,
        })
    }
}

impl<R: Clone + Serialize + DeserializeOwned> Default for IdempotencyStore<R> {
    fn default() -> Self {
        Self::new(IdempotencyConfig::default())
    }
}

fn read_snapshot<R: DeserializeOwned>(
    path: &Path,
) -> Result<Option<Vec<IdempotencyEntry<R>>>, IdempotencyError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(IdempotencyError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };
    serde_json::from_slice::<Snapshot<R>>(&bytes)
        .map(|s| Some(s.entries))
        .map_err(|e| IdempotencyError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })
}

#[derive(Serialize)]
struct CanonicalPlan<'a> {
    account_id: &'a AccountId,
    actions: &'a [Action],
    notes: &'a BTreeMap<String, String>,
}

/// Stable hash of an account's plan.
///
/// The correlation ID is excluded so that two evaluations diagnosing the same
/// state produce the same key. Notes are a sorted map, which keeps the JSON
/// canonical.
#[must_use]
pub fn idempotency_key(account: &AccountId, plan: &ActionPlan) -> String {
    let canonical = CanonicalPlan {
        account_id: account,
        actions: &plan.actions,
        notes: &plan.notes,
    };
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;

    fn store(max_keys: usize) -> IdempotencyStore<u32> {
        IdempotencyStore::new(IdempotencyConfig {
            max_keys,
            ttl: Duration::hours(24),
        })
    }

    #[test]
    fn test_begin_claims_once() {
        let store = store(10);
        assert_eq!(store.begin("A", "k").unwrap(), Begin::Started);
        assert_eq!(store.begin("A", "k").unwrap(), Begin::InProgress);

        store.mark_completed("k", 7).unwrap();
        assert_eq!(store.begin("A", "k").unwrap(), Begin::AlreadyCompleted(7));
        let entry = store.get("k").unwrap();
        assert_eq!(entry.status, IdempotencyStatus::Completed);
        assert_eq!(entry.scope, "A");
        assert_eq!(entry.result, Some(7));
    }

    #[test]
    fn test_failed_key_can_be_retried() {
        let store = store(10);
        assert_eq!(store.begin("A", "k").unwrap(), Begin::Started);
        store.mark_failed("k", 0).unwrap();
        assert_eq!(store.begin("A", "k").unwrap(), Begin::Started);
        assert_eq!(
            store.get("k").unwrap().status,
            IdempotencyStatus::Processing
        );
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = store(2);
        store.set_processing("A", "a").unwrap();
        store.set_processing("A", "b").unwrap();
        store.set_processing("A", "c").unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn test_ttl_expiry() {
        let store = store(10);
        let start = Utc::now();
        assert_eq!(store.begin_at("A", "k", start).unwrap(), Begin::Started);
        store.mark_completed("k", 1).unwrap();

        assert!(store.get_at("k", start + Duration::hours(25)).is_none());
        assert_eq!(
            store.begin_at("A", "k", start + Duration::hours(25)).unwrap(),
            Begin::Started
        );
    }

    #[test]
    fn test_supersede_drops_other_keys_of_scope() {
        let store = store(10);
        store.begin("A", "k1").unwrap();
        store.mark_completed("k1", 1).unwrap();
        store.begin("B", "k2").unwrap();
        store.mark_completed("k2", 2).unwrap();

        // The same plan again keeps its key.
        assert_eq!(store.supersede("A", Some("k1")).unwrap(), 0);
        assert_eq!(store.begin("A", "k1").unwrap(), Begin::AlreadyCompleted(1));

        // A different evaluation (here a no-op) releases it.
        assert_eq!(store.supersede("A", None).unwrap(), 1);
        assert!(store.get("k1").is_none());
        assert_eq!(store.begin("A", "k1").unwrap(), Begin::Started);

        // Other accounts are untouched.
        assert_eq!(store.get("k2").unwrap().result, Some(2));
    }

    #[test]
    fn test_open_reloads_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("idempotency.json");
        let config = IdempotencyConfig::default();

        {
            let store = IdempotencyStore::<u32>::open(&path, config).unwrap();
            store.begin("A", "done").unwrap();
            store.mark_completed("done", 3).unwrap();
            store.begin("A", "pending").unwrap();
        }
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = IdempotencyStore::<u32>::open(&path, config).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.begin("A", "done").unwrap(),
            Begin::AlreadyCompleted(3)
        );
        // A claim left by a stopped process still blocks re-execution.
        assert_eq!(reopened.begin("A", "pending").unwrap(), Begin::InProgress);

        reopened.supersede("A", None).unwrap();
        let emptied = IdempotencyStore::<u32>::open(&path, config).unwrap();
        assert!(emptied.is_empty());
    }

    #[test]
    fn test_open_drops_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.json");
        {
            let store = IdempotencyStore::<u32>::open(&path, IdempotencyConfig::default()).unwrap();
            store
                .begin_at("A", "old", Utc::now() - Duration::hours(30))
                .unwrap();
        }

        let reopened = IdempotencyStore::<u32>::open(&path, IdempotencyConfig::default()).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_corrupt_table_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            IdempotencyStore::<u32>::open(&path, IdempotencyConfig::default()),
            Err(IdempotencyError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_unwritable_claim_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.json");
        let store = IdempotencyStore::<u32>::open(&path, IdempotencyConfig::default()).unwrap();
        // A directory at the temp path makes the write fail.
        fs::create_dir(path.with_extension("json.tmp")).unwrap();

        assert!(matches!(
            store.begin("A", "k"),
            Err(IdempotencyError::Io { .. })
        ));
        assert!(store.get("k").is_none());
    }

    #[test]
    fn test_key_ignores_correlation_id() {
        let account = AccountId::from("ACC-1");
        let mut a = ActionPlan::new();
        a.actions.push(Action::lockout("Lockout active", Severity::Crit));
        a.note("policy", "LockoutActive");
        let mut b = a.clone();
        b.correlation_id = uuid::Uuid::new_v4();

        assert_eq!(idempotency_key(&account, &a), idempotency_key(&account, &b));
        assert_eq!(idempotency_key(&account, &a).len(), 64);
    }

    #[test]
    fn test_key_depends_on_account_and_content() {
        let mut plan = ActionPlan::new();
        plan.actions.push(Action::reduce("ESZ24", 1, "MaxContracts"));
        let a = idempotency_key(&AccountId::from("A"), &plan);
        let b = idempotency_key(&AccountId::from("B"), &plan);
        assert_ne!(a, b);

        let mut other = plan.clone();
        other.actions[0].quantity = Some(2);
        assert_ne!(a, idempotency_key(&AccountId::from("A"), &other));
    }
}
