//! Account storage
//!
//! The connection engine only needs two things from an account store:
//! create-if-absent and credential verification. Both stores here serialize
//! the check-then-insert of `create` behind one lock.

use crate::auth;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    /// PHC-format Argon2id digest
    pub password_hash: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(username: &str, password_hash: &str, email: Option<&str>) -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(10);
        Self {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            email: email.map(str::to_string),
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

pub trait AccountStore: Send + Sync {
    /// Insert a new account unless the username is taken. An existing
    /// account is never modified.
    fn create(
        &self,
        username: &str,
        password_hash: &str,
        email: Option<&str>,
    ) -> Result<CreateOutcome, StoreError>;

    fn account(&self, username: &str) -> Result<Option<Account>, StoreError>;

    /// Check a password against the stored digest. Unknown users are
    /// simply invalid.
    fn verify(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        match self.account(username)? {
            Some(account) => Ok(auth::verify_password(password, &account.password_hash)?),
            None => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<String, Account>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.lock().is_empty()
    }
}

impl AccountStore for MemoryAccountStore {
    fn create(
        &self,
        username: &str,
        password_hash: &str,
        email: Option<&str>,
    ) -> Result<CreateOutcome, StoreError> {
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(username) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        accounts.insert(
            username.to_string(),
            Account::new(username, password_hash, email),
        );
        Ok(CreateOutcome::Created)
    }

    fn account(&self, username: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.lock().get(username).cloned())
    }
}

/// Accounts persisted as a JSON array, rewritten atomically on every insert
pub struct JsonAccountStore {
    path: PathBuf,
    accounts: Mutex<HashMap<String, Account>>,
}

impl JsonAccountStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let accounts = if path.exists() {
            let raw = std::fs::read(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let list: Vec<Account> = serde_json::from_slice(&raw)?;
            list.into_iter().map(|a| (a.username.clone(), a)).collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            accounts: Mutex::new(accounts),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, accounts: &HashMap<String, Account>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io_err)?;

        let mut list: Vec<&Account> = accounts.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.username.cmp(&b.username)));

        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        serde_json::to_writer_pretty(&mut tmp, &list)?;
        tmp.write_all(b"\n").map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

impl AccountStore for JsonAccountStore {
    fn create(
        &self,
        username: &str,
        password_hash: &str,
        email: Option<&str>,
    ) -> Result<CreateOutcome, StoreError> {
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(username) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        accounts.insert(
            username.to_string(),
            Account::new(username, password_hash, email),
        );
        if let Err(e) = self.persist(&accounts) {
            // Keep memory and disk in agreement
            accounts.remove(username);
            return Err(e);
        }
        Ok(CreateOutcome::Created)
    }

    fn account(&self, username: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.lock().get(username).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_create_twice() {
        let store = MemoryAccountStore::new();
        let digest = auth::hash_password("pw").unwrap();
        assert_eq!(
            store.create("alice", &digest, Some("a@example.com")).unwrap(),
            CreateOutcome::Created
        );
        let before = store.account("alice").unwrap().unwrap();
        assert_eq!(
            store.create("alice", "other", None).unwrap(),
            CreateOutcome::AlreadyExists
        );
        // Untouched by the second attempt
        assert_eq!(store.account("alice").unwrap().unwrap(), before);
        assert_eq!(before.id.len(), 10);
        assert_eq!(before.email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn test_usernames_are_case_sensitive() {
        let store = MemoryAccountStore::new();
        store.create("Alice", "d", None).unwrap();
        assert_eq!(store.create("alice", "d", None).unwrap(), CreateOutcome::Created);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_verify() {
        let store = MemoryAccountStore::new();
        store
            .create("bob", &auth::hash_password("s3cret").unwrap(), None)
            .unwrap();
        assert!(store.verify("bob", "s3cret").unwrap());
        assert!(!store.verify("bob", "S3cret").unwrap());
        assert!(!store.verify("nobody", "s3cret").unwrap());
    }

    #[test]
    fn test_concurrent_create_single_winner() {
        let store = Arc::new(MemoryAccountStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.create("race", "d", None).unwrap())
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == CreateOutcome::Created)
            .count();
        assert_eq!(created, 1);
    }

    #[test]
    fn test_json_store_persists_across_reopen() {
        let t = TempDir::new().unwrap();
        let path = t.path().join("db").join("accounts.json");
        {
            let store = JsonAccountStore::open(&path).unwrap();
            let digest = auth::hash_password("pw").unwrap();
            store.create("carol", &digest, None).unwrap();
        }
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("\"pw\""));

        let store = JsonAccountStore::open(&path).unwrap();
        assert!(store.verify("carol", "pw").unwrap());
        assert_eq!(
            store.create("carol", "x", None).unwrap(),
            CreateOutcome::AlreadyExists
        );
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let t = TempDir::new().unwrap();
        let path = t.path().join("accounts.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            JsonAccountStore::open(&path),
            Err(StoreError::Corrupt(_))
        ));
    }
}
