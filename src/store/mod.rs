//! Durable credential storage.
//!
//! The broker owns one [`TokenStore`] and treats it as a soft dependency:
//! a failed save is logged and the session continues from memory.

pub mod file;
pub mod memory;
pub mod secure;

use crate::auth::CredentialRecord;
use crate::error::StoreError;

pub use file::FileTokenStore;
pub use memory::MemoryTokenStore;
pub use secure::SecureString;

/// Persistence for one credential record per account key.
pub trait TokenStore: Send + Sync {
    /// Missing, unreadable and corrupt entries all read as `None`.
    fn load(&self, key: &str) -> Option<CredentialRecord>;

    /// Replace the record for `key`. Readers never observe a partial write.
    fn save(&self, key: &str, record: &CredentialRecord) -> Result<(), StoreError>;

    /// Remove the record for `key`. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}
