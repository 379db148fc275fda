//! File-backed lockout records.
//!
//! One JSON document per account under the store directory. Writes go to a
//! `.tmp` sibling and are renamed over the record, so readers never observe a
//! partial file.
//!
//! # Concurrency contract
//!
//! Single writer process. Within the process, writes are serialized by a
//! mutex; across processes only the rename is atomic and a second enforcing
//! process may overwrite a fresher record with an older one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::AccountId;

/// Lockout store error.
#[derive(Debug, thiserror::Error)]
pub enum LockoutError {
    /// Filesystem failure.
    #[error("lockout store I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Record could not be parsed.
    #[error("corrupt lockout record at {path}: {source}")]
    Corrupt {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted lock state for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutRecord {
    /// Account.
    pub account_id: AccountId,
    /// Whether the lock is in force.
    pub locked: bool,
    /// Trigger.
    pub reason: String,
    /// Expiry.
    pub until: DateTime<Utc>,
    /// When the lock was written.
    pub created_at: DateTime<Utc>,
}

impl LockoutRecord {
    /// Whether the record locks the account at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.locked && now < self.until
    }
}

/// Persisted per-account lockouts.
#[derive(Debug)]
pub struct LockoutStore {
    dir: PathBuf,
    default_duration: Duration,
    write_lock: Mutex<()>,
}

impl LockoutStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, default_duration: Duration) -> Result<Self, LockoutError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| LockoutError::Io {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self {
            dir,
            default_duration,
            write_lock: Mutex::new(()),
        })
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Duration applied when a lock does not specify one.
    #[must_use]
    pub const fn default_duration(&self) -> Duration {
        self.default_duration
    }

    /// Active record for `account`. Expired records are deleted and reported
    /// as absent.
    pub fn get(&self, account: &AccountId) -> Result<Option<LockoutRecord>, LockoutError> {
        self.get_at(account, Utc::now())
    }

    /// [`get`](Self::get) evaluated at `now`.
    pub fn get_at(
        &self,
        account: &AccountId,
        now: DateTime<Utc>,
    ) -> Result<Option<LockoutRecord>, LockoutError> {
        let path = self.path_for(account);
        let Some(record) = read_record(&path)? else {
            return Ok(None);
        };

        if record.is_active_at(now) {
            return Ok(Some(record));
        }
        self.expire(account, &path, now)
    }

    /// Delete the record at `path` unless it is active at `now`. The record is
    /// re-read under the write lock, so a `set` racing the caller's first read
    /// is kept.
    fn expire(
        &self,
        account: &AccountId,
        path: &Path,
        now: DateTime<Utc>,
    ) -> Result<Option<LockoutRecord>, LockoutError> {
        let _guard = self.write_lock.lock();
        let Some(record) = read_record(path)? else {
            return Ok(None);
        };
        if record.is_active_at(now) {
            return Ok(Some(record));
        }

        remove_if_exists(path)?;
        tracing::info!(
            account_id = %account,
            until = %record.until,
            "Expired lockout removed"
        );
        Ok(None)
    }

    /// Whether `account` is locked now.
    pub fn is_locked(&self, account: &AccountId) -> Result<bool, LockoutError> {
        Ok(self.get(account)?.is_some())
    }

    /// Lock `account` for `duration` (or the store default).
    pub fn set(
        &self,
        account: &AccountId,
        reason: &str,
        duration: Option<Duration>,
    ) -> Result<LockoutRecord, LockoutError> {
        let now = Utc::now();
        let record = LockoutRecord {
            account_id: account.clone(),
            locked: true,
            reason: reason.to_string(),
            until: now + duration.unwrap_or(self.default_duration),
            created_at: now,
        };
        self.put(&record)?;
        tracing::warn!(
            account_id = %account,
            reason,
            until = %record.until,
            "Account locked out"
        );
        Ok(record)
    }

    /// Write a record as-is.
    pub fn put(&self, record: &LockoutRecord) -> Result<(), LockoutError> {
        let path = self.path_for(&record.account_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record).map_err(|e| LockoutError::Corrupt {
            path: path.clone(),
            source: e,
        })?;

        let _guard = self.write_lock.lock();
        fs::write(&tmp, json).map_err(|e| LockoutError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| LockoutError::Io { path, source: e })
    }

    /// Remove any lock on `account`. Returns whether a record existed.
    pub fn clear(&self, account: &AccountId) -> Result<bool, LockoutError> {
        let path = self.path_for(account);
        let _guard = self.write_lock.lock();
        let existed = remove_if_exists(&path)?;
        if existed {
            tracing::info!(account_id = %account, "Lockout cleared");
        }
        Ok(existed)
    }

    /// All active records, expiring stale ones on the way.
    pub fn list(&self) -> Result<Vec<LockoutRecord>, LockoutError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| LockoutError::Io {
            path: self.dir.clone(),
            source: e,
        })?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_record(&path)?
                && let Some(active) = self.get(&record.account_id)?
            {
                records.push(active);
            }
        }
        records.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(records)
    }

    /// Record file for `account`. IDs made only of `[A-Za-z0-9_-]` map to
    /// `<id>.json`; any other ID is sanitized and suffixed with `~` and a hash
    /// of the raw ID, so distinct accounts never share a file.
    fn path_for(&self, account: &AccountId) -> PathBuf {
        let raw = account.as_str();
        let safe = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
        if !raw.is_empty() && raw.chars().all(safe) {
            return self.dir.join(format!("{raw}.json"));
        }

        let name: String = raw.chars().map(|c| if safe(c) { c } else { '_' }).collect();
        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        self.dir.join(format!("{name}~{}.json", &digest[..16]))
    }
}

fn read_record(path: &Path) -> Result<Option<LockoutRecord>, LockoutError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(LockoutError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| LockoutError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })
}

fn remove_if_exists(path: &Path) -> Result<bool, LockoutError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(LockoutError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LockoutStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LockoutStore::open(dir.path().join("lockouts"), Duration::hours(24)).unwrap();
        (dir, store)
    }

    #[test]
    fn test_set_then_get() {
        let (_dir, store) = store();
        let account = AccountId::from("ACC-1");
        let record = store.set(&account, "Hit t0 daily loss", None).unwrap();

        let loaded = store.get(&account).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(loaded.until - loaded.created_at == Duration::hours(24));
        assert!(store.is_locked(&account).unwrap());
    }

    #[test]
    fn test_expired_record_removed_on_read() {
        let (_dir, store) = store();
        let account = AccountId::from("ACC-1");
        let now = Utc::now();
        store
            .put(&LockoutRecord {
                account_id: account.clone(),
                locked: true,
                reason: "old".to_string(),
                until: now - Duration::minutes(1),
                created_at: now - Duration::hours(25),
            })
            .unwrap();
        let path = store.path_for(&account);
        assert!(path.exists());

        assert!(store.get(&account).unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_unlocked_record_treated_as_absent() {
        let (_dir, store) = store();
        let account = AccountId::from("ACC-1");
        let now = Utc::now();
        store
            .put(&LockoutRecord {
                account_id: account.clone(),
                locked: false,
                reason: "manual".to_string(),
                until: now + Duration::hours(1),
                created_at: now,
            })
            .unwrap();
        assert!(!store.is_locked(&account).unwrap());
    }

    #[test]
    fn test_custom_duration() {
        let (_dir, store) = store();
        let account = AccountId::from("ACC-1");
        let record = store
            .set(&account, "News blackout", Some(Duration::minutes(25)))
            .unwrap();
        assert_eq!(record.until - record.created_at, Duration::minutes(25));
        assert!(store
            .get_at(&account, record.created_at + Duration::minutes(26))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_clear_and_no_tmp_left_behind() {
        let (_dir, store) = store();
        let account = AccountId::from("ACC/../1");
        store.set(&account, "x", None).unwrap();

        let path = store.path_for(&account);
        assert!(path.starts_with(store.dir()));
        assert!(!path.with_extension("json.tmp").exists());

        assert!(store.clear(&account).unwrap());
        assert!(!store.clear(&account).unwrap());
        assert!(store.get(&account).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record_is_error() {
        let (_dir, store) = store();
        let account = AccountId::from("ACC-1");
        fs::write(store.path_for(&account), b"{not json").unwrap();
        assert!(matches!(
            store.get(&account),
            Err(LockoutError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_list_active() {
        let (_dir, store) = store();
        store.set(&AccountId::from("B"), "x", None).unwrap();
        store.set(&AccountId::from("A"), "y", None).unwrap();
        let listed = store.list().unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.account_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn test_similar_ids_use_distinct_files() {
        let (_dir, store) = store();
        let slash = AccountId::from("A/B");
        let underscore = AccountId::from("A_B");
        assert_ne!(store.path_for(&slash), store.path_for(&underscore));

        store.set(&slash, "breach", None).unwrap();
        assert!(store.is_locked(&slash).unwrap());
        assert!(!store.is_locked(&underscore).unwrap());

        store.set(&underscore, "other", None).unwrap();
        assert!(store.clear(&underscore).unwrap());
        assert!(store.is_locked(&slash).unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_expiry_keeps_record_set_after_stale_read() {
        let (_dir, store) = store();
        let account = AccountId::from("ACC-1");
        let now = Utc::now();
        store
            .put(&LockoutRecord {
                account_id: account.clone(),
                locked: true,
                reason: "old".to_string(),
                until: now - Duration::minutes(1),
                created_at: now - Duration::hours(25),
            })
            .unwrap();
        let path = store.path_for(&account);
        let stale = read_record(&path).unwrap().unwrap();
        assert!(!stale.is_active_at(now));

        // A new lock lands between the stale read and the removal.
        let fresh = store.set(&account, "new breach", None).unwrap();

        assert_eq!(store.expire(&account, &path, now).unwrap(), Some(fresh));
        assert!(path.exists());
    }
}
