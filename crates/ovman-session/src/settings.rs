//! Settings
//!
//! On-disk key/value configuration for the session manager. Loaded once at
//! startup and passed immutably to [`SessionManager::new`](crate::SessionManager::new);
//! no component reads the file ad hoc.
//!
//! Resolution order for the settings file:
//!
//! 1. `OVMAN_CONFIG` environment variable
//! 2. `$XDG_CONFIG_HOME/ovman/config.toml`
//! 3. `~/.config/ovman/config.toml`
//!
//! A default file is written on first run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const CONFIG_ENV_VAR: &str = "OVMAN_CONFIG";
const CONFIG_DIR_NAME: &str = "ovman";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Session manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory scanned for `.ovpn` profiles
    pub profile_dir: PathBuf,
    /// Directory holding encrypted credential files
    pub credential_dir: PathBuf,
    /// OpenVPN executable to launch
    #[serde(default = "default_binary")]
    pub openvpn_binary: String,
    /// Wrap the subprocess in `sudo` when not already root
    #[serde(default = "default_true")]
    pub use_sudo: bool,
    /// How long to wait for "Initialization Sequence Completed"
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// OpenVPN `--verb` level for debug sessions
    #[serde(default = "default_debug_verbosity")]
    pub debug_verbosity: u8,
}

fn default_binary() -> String {
    "openvpn".to_string()
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_grace_period() -> u64 {
    5
}

fn default_debug_verbosity() -> u8 {
    4
}

impl Default for Settings {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            profile_dir: home.join("openvpn").join("profiles"),
            credential_dir: home.join("openvpn").join(".credentials"),
            openvpn_binary: default_binary(),
            use_sudo: default_true(),
            handshake_timeout_secs: default_handshake_timeout(),
            grace_period_secs: default_grace_period(),
            debug_verbosity: default_debug_verbosity(),
        }
    }
}

impl Settings {
    /// Resolve the settings file path.
    ///
    /// Honors the `OVMAN_CONFIG` override, otherwise lands in the
    /// user config directory.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return PathBuf::from(path);
        }

        if let Some(config) = dirs::config_dir() {
            return config.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        }

        // Headless fallback without XDG dirs
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".config")
                .join(CONFIG_DIR_NAME)
                .join(CONFIG_FILE_NAME);
        }

        PathBuf::from(CONFIG_FILE_NAME)
    }

    /// Load settings from a TOML file, creating it with defaults if absent.
    pub fn load_or_create(path: &Path) -> Result<Self, SettingsError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| SettingsError::Io(path.to_path_buf(), e))?;
            let mut settings: Settings = toml::from_str(&content)
                .map_err(|e| SettingsError::Parse(path.to_path_buf(), e.to_string()))?;
            settings.expand_paths();
            Ok(settings)
        } else {
            let settings = Settings::default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SettingsError::Io(parent.to_path_buf(), e))?;
            }
            let content = toml::to_string_pretty(&settings)
                .map_err(|e| SettingsError::Parse(path.to_path_buf(), e.to_string()))?;
            std::fs::write(path, content).map_err(|e| SettingsError::Io(path.to_path_buf(), e))?;
            info!("Created default settings file: {}", path.display());
            Ok(settings)
        }
    }

    /// Load settings from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let mut settings: Settings = toml::from_str(content)
            .map_err(|e| SettingsError::Parse(PathBuf::new(), e.to_string()))?;
        settings.expand_paths();
        Ok(settings)
    }

    /// Validate that the configured directories are usable.
    ///
    /// The profile directory must already exist; the credential directory is
    /// created owner-only on first use by the store.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.profile_dir.is_dir() {
            return Err(SettingsError::ProfileDirMissing(self.profile_dir.clone()));
        }
        Ok(())
    }

    /// Expand `~` and `$HOME` in the directory paths.
    fn expand_paths(&mut self) {
        self.profile_dir = expand_home(&self.profile_dir);
        self.credential_dir = expand_home(&self.credential_dir);
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };

    let home = dirs::home_dir();
    if let Some(stripped) = s.strip_prefix("~/") {
        if let Some(home) = &home {
            return home.join(stripped);
        }
    }
    if s.contains("$HOME") {
        if let Some(home) = &home {
            if let Some(home_str) = home.to_str() {
                return PathBuf::from(s.replace("$HOME", home_str));
            }
        }
    }
    path.to_path_buf()
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings io error at {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse settings {0}: {1}")]
    Parse(PathBuf, String),

    #[error("profile directory not found: {0}")]
    ProfileDirMissing(PathBuf),
}
