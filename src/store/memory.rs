//! In-process token store for `--no-token-cache` sessions and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::TokenStore;
use crate::auth::CredentialRecord;
use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    records: Mutex<HashMap<String, CredentialRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with one record.
    pub fn with_record(key: &str, record: CredentialRecord) -> Self {
        let store = Self::new();
        store.records().insert(key.to_string(), record);
        store
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records().contains_key(key)
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, CredentialRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, key: &str) -> Option<CredentialRecord> {
        self.records().get(key).cloned()
    }

    fn save(&self, key: &str, record: &CredentialRecord) -> Result<(), StoreError> {
        self.records().insert(key.to_string(), record.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records().remove(key);
        Ok(())
    }
}
