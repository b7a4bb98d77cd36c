//! Platform paths for logs and the token cache.

use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("de", "malvik", "m365-mcp")
}

/// Get the path to the log directory.
pub fn log_directory() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_local_dir().join("logs"))
        .unwrap_or_else(|| std::env::temp_dir().join("m365-mcp").join("logs"))
}

/// Default directory for the on-disk token cache.
pub fn token_cache_directory() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.cache_dir().join("tokens"))
        .unwrap_or_else(|| std::env::temp_dir().join("m365-mcp").join("tokens"))
}

/// Initialize the log directory.
pub fn init_log_directory() -> Result<PathBuf> {
    let log_dir = log_directory();
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    }
    Ok(log_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory() {
        let path = log_directory();
        assert!(path.to_string_lossy().contains("m365-mcp"));
        assert!(path.ends_with("logs"));
    }

    #[test]
    fn test_token_cache_directory() {
        let path = token_cache_directory();
        assert!(path.ends_with("tokens"));
        assert_ne!(path, log_directory());
    }
}
