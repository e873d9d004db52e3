//! Persistent storage
//!
//! Panel settings live as JSON under the platform data directory.

pub mod settings;

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or writing persisted data
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No data directory available on this platform")]
    NoDataDir,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns the application data directory
///
/// Linux: ~/.local/share/loratuner, macOS: ~/Library/Application Support/com.loratuner.loratuner,
/// Windows: %APPDATA%/loratuner/loratuner/data
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "loratuner", "loratuner")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
