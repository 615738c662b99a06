//! Cross-platform utilities.

use std::path::PathBuf;

/// Get the application data directory.
///
/// - Linux: `~/.local/share/chatsnap`
/// - Windows: `%LOCALAPPDATA%\chatsnap`
/// - macOS: `~/Library/Application Support/chatsnap`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatsnap")
}

/// Get the configuration directory.
///
/// - Linux: `~/.config/chatsnap`
/// - Windows: `%APPDATA%\chatsnap`
/// - macOS: `~/Library/Application Support/chatsnap`
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatsnap")
}

/// Get the path to the main config file.
pub fn config_file_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Get the default location of the local message cache.
pub fn cache_dir() -> PathBuf {
    data_dir().join("cache.db")
}
