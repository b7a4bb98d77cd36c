//! JSON file token cache.
//!
//! One file per account key under the cache directory. Writes go to a
//! temporary sibling first and are renamed into place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::TokenStore;
use crate::auth::CredentialRecord;
use crate::error::StoreError;

const FILE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct TokenFile {
    version: u32,
    key: String,
    record: CredentialRecord,
    saved_at: DateTime<Utc>,
}

/// Token store backed by files in a single directory.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the cache file for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_label(key)))
    }

    fn write_atomically(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self
            .dir
            .join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));

        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            restrict_permissions(&tmp)?;
            file.write_all(contents)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self, key: &str) -> Option<CredentialRecord> {
        let path = self.path_for(key);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Token cache {} unreadable: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<TokenFile>(&contents) {
            Ok(file) if file.version == FILE_VERSION && file.key == key => {
                debug!("Loaded cached credentials from {}", path.display());
                Some(file.record)
            }
            Ok(file) => {
                warn!(
                    "Ignoring token cache {} (version {}, key '{}')",
                    path.display(),
                    file.version,
                    file.key
                );
                None
            }
            Err(e) => {
                warn!("Token cache {} is corrupt, ignoring: {}", path.display(), e);
                None
            }
        }
    }

    fn save(&self, key: &str, record: &CredentialRecord) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let file = TokenFile {
            version: FILE_VERSION,
            key: key.to_string(),
            record: record.clone(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        self.write_atomically(&path, &json)
            .map_err(|e| StoreError::WriteFailed(format!("{}: {}", path.display(), e)))?;

        debug!("Saved credentials to {}", path.display());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Deleted token cache {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::DeleteFailed(format!(
                "{}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// File-name-safe label for an account key.
fn file_label(key: &str) -> String {
    let label: String = key
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect();
    let label = label.trim_start_matches('.');
    if label.is_empty() {
        "default".to_string()
    } else {
        label.to_string()
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
