use std::path::PathBuf;
use std::sync::OnceLock;

static GAMEPIPE_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Returns the Gamepipe home directory (`~/.gamepipe/`).
/// Supports `$GAMEPIPE_HOME` env override. Cached via `OnceLock`.
pub fn gamepipe_home() -> &'static PathBuf {
    GAMEPIPE_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("GAMEPIPE_HOME") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gamepipe")
    })
}

/// `~/.gamepipe/config/`
pub fn config_dir() -> PathBuf {
    gamepipe_home().join("config")
}

/// `~/.gamepipe/data/`
pub fn data_dir() -> PathBuf {
    gamepipe_home().join("data")
}

/// `~/.gamepipe/logs/`
pub fn logs_dir() -> PathBuf {
    gamepipe_home().join("logs")
}

/// Default settings file location.
pub fn settings_file() -> PathBuf {
    config_dir().join("settings.toml")
}

/// Default SQLite database location.
pub fn database_file() -> PathBuf {
    data_dir().join("gateway.db")
}

/// Lockfile guarding ownership of the MCP adapter process.
pub fn adapter_lock_file() -> PathBuf {
    data_dir().join("mcp_adapter.lock")
}
