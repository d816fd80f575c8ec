//! Daemon configuration.
//!
//! The configuration file is JSON and every key is optional. Values that
//! depend on the user running the daemon (media root, home directory, group)
//! stay unset in [`Config`] and are filled in by [`Config::resolve`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use nix::unistd::{Uid, User};
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{OptionExt, ResultExt};

use crate::error::{ConfigParseSnafu, IoResultExt, Result, UserLookupSnafu, UserNotFoundSnafu};
use crate::responder::FilePolicy;
use crate::session::DEFAULT_SESSION_TERMINAL;
use crate::storage::{DEFAULT_REMOVABLE_MAX_FILE_SIZE, DEFAULT_RESERVE_SPACE, StorageLimits};
use crate::transport::{DEFAULT_RETRY_INTERVAL, DEFAULT_TRANSPORT_PATH};

/// Configuration file read when no path is given explicitly.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mtp-server/config.json";

/// Parent of the per-user automount directories.
pub const MEDIA_BASE: &str = "/media";

/// Label used when neither the board model nor the hostname is available.
pub const FALLBACK_HOME_LABEL: &str = "MTP Device";

const DEVICE_TREE_MODEL: &str = "/proc/device-tree/model";

pub const DEFAULT_FILE_MODE: u32 = 0o664;
pub const DEFAULT_DIRECTORY_MODE: u32 = 0o755;

/// Daemon configuration as read from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport_path: PathBuf,
    pub transport_retry_ms: u64,
    pub media_root: Option<PathBuf>,
    pub home_path: Option<PathBuf>,
    pub home_label: Option<String>,
    pub session_terminal: String,
    pub track_session_lock: bool,
    #[serde(deserialize_with = "deserialize_mode")]
    pub file_mode: u32,
    #[serde(deserialize_with = "deserialize_mode")]
    pub directory_mode: u32,
    pub group: Option<u32>,
    pub reserve_space: u64,
    pub removable_max_file_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport_path: PathBuf::from(DEFAULT_TRANSPORT_PATH),
            transport_retry_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            media_root: None,
            home_path: None,
            home_label: None,
            session_terminal: DEFAULT_SESSION_TERMINAL.to_string(),
            track_session_lock: true,
            file_mode: DEFAULT_FILE_MODE,
            directory_mode: DEFAULT_DIRECTORY_MODE,
            group: None,
            reserve_space: DEFAULT_RESERVE_SPACE,
            removable_max_file_size: DEFAULT_REMOVABLE_MAX_FILE_SIZE,
        }
    }
}

/// The user the daemon serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl UserInfo {
    /// Looks up the user running the process.
    pub fn current() -> Result<Self> {
        let uid = nix::unistd::getuid();
        Self::from_uid(uid)
    }

    fn from_uid(uid: Uid) -> Result<Self> {
        let user = User::from_uid(uid)
            .context(UserLookupSnafu {
                uid: uid.as_raw(),
            })?
            .context(UserNotFoundSnafu {
                uid: uid.as_raw(),
            })?;

        Ok(Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        })
    }
}

/// Fully resolved settings, every default filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub user: UserInfo,
    pub transport_path: PathBuf,
    pub transport_retry_ms: u64,
    pub media_root: PathBuf,
    pub home_path: PathBuf,
    pub home_label: String,
    pub session_terminal: String,
    pub track_session_lock: bool,
    pub file_mode: u32,
    pub directory_mode: u32,
    pub group: u32,
    pub reserve_space: u64,
    pub removable_max_file_size: u64,
}

impl Settings {
    /// Delay between transport open attempts.
    pub fn transport_retry(&self) -> Duration {
        Duration::from_millis(self.transport_retry_ms)
    }

    /// Ownership and permissions for objects created by hosts.
    pub fn file_policy(&self) -> FilePolicy {
        FilePolicy {
            group: self.group,
            file_mode: self.file_mode,
            directory_mode: self.directory_mode,
        }
    }

    /// Limits applied to new storage entries.
    pub fn storage_limits(&self) -> StorageLimits {
        StorageLimits {
            reserve_space: self.reserve_space,
            removable_max_file_size: self.removable_max_file_size,
        }
    }
}

impl Config {
    /// Loads the configuration.
    ///
    /// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
    /// read if present, otherwise defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load_from(default)
                } else {
                    debug!("No config at {}, using defaults", default.display());
                    Ok(Self::default())
                }
            }
        }
    }

    /// Reads and parses a configuration file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).config_read_context(path)?;
        let config = serde_json::from_str(&content).context(ConfigParseSnafu { path })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Fills in the user-dependent defaults for the current user.
    pub fn resolve(self) -> Result<Settings> {
        let user = UserInfo::current()?;
        Ok(self.resolve_for(user))
    }

    /// Fills in the user-dependent defaults for `user`.
    pub fn resolve_for(self, user: UserInfo) -> Settings {
        let media_root = self
            .media_root
            .unwrap_or_else(|| Path::new(MEDIA_BASE).join(&user.name));
        let home_path = self.home_path.unwrap_or_else(|| user.home.clone());
        let home_label = self.home_label.unwrap_or_else(default_home_label);
        let group = self.group.unwrap_or(user.gid);

        Settings {
            transport_path: self.transport_path,
            transport_retry_ms: self.transport_retry_ms,
            media_root,
            home_path,
            home_label,
            session_terminal: self.session_terminal,
            track_session_lock: self.track_session_lock,
            file_mode: self.file_mode,
            directory_mode: self.directory_mode,
            group,
            reserve_space: self.reserve_space,
            removable_max_file_size: self.removable_max_file_size,
            user,
        }
    }
}

/// Board model from the device tree, else the hostname, else a fixed label.
pub fn default_home_label() -> String {
    if let Ok(raw) = fs::read_to_string(DEVICE_TREE_MODEL)
        && let Some(model) = clean_label(&raw)
    {
        return model;
    }

    if let Ok(hostname) = nix::unistd::gethostname()
        && let Some(hostname) = hostname.to_str().and_then(clean_label)
    {
        return hostname;
    }

    FALLBACK_HOME_LABEL.to_string()
}

/// Trims the NUL terminator and whitespace device-tree strings carry.
fn clean_label(raw: &str) -> Option<String> {
    let label = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if label.is_empty() {
        None
    } else {
        Some(label.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModeRepr {
    Number(u32),
    Octal(String),
}

/// Accepts a permission mode either as a number or as an octal string
/// such as `"0664"` or `"0o664"`.
fn deserialize_mode<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match ModeRepr::deserialize(deserializer)? {
        ModeRepr::Number(mode) => Ok(mode),
        ModeRepr::Octal(text) => {
            let digits = text.strip_prefix("0o").unwrap_or(&text);
            u32::from_str_radix(digits, 8).map_err(|_| {
                serde::de::Error::custom(format!("invalid octal permission mode '{text}'"))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    fn user() -> UserInfo {
        UserInfo {
            name: "deck".to_string(),
            uid: 1000,
            gid: 1000,
            home: PathBuf::from("/home/deck"),
        }
    }

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.transport_path, PathBuf::from("/dev/mtp_usb"));
        assert_eq!(config.transport_retry_ms, 5000);
        assert_eq!(config.session_terminal, "tty7");
        assert!(config.track_session_lock);
        assert_eq!(config.file_mode, 0o664);
        assert_eq!(config.directory_mode, 0o755);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{ "media_root": "/run/media/deck", "track_session_lock": false }"#,
        );

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.media_root, Some(PathBuf::from("/run/media/deck")));
        assert!(!config.track_session_lock);
        assert_eq!(config.reserve_space, DEFAULT_RESERVE_SPACE);
        assert_eq!(config.transport_path, PathBuf::from(DEFAULT_TRANSPORT_PATH));
    }

    #[test]
    fn test_octal_modes() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{ "file_mode": "0640", "directory_mode": "0o750" }"#);

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.file_mode, 0o640);
        assert_eq!(config.directory_mode, 0o750);

        let path = write_config(&dir, r#"{ "file_mode": 420 }"#);
        assert_eq!(Config::load_from(&path).unwrap().file_mode, 0o644);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{ "file_mode": "rw-r--r--" }"#);
        assert!(matches!(
            Config::load_from(&path),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_invalid_json_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{ not json");
        assert!(matches!(
            Config::load(Some(&path)),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn test_resolve_user_defaults() {
        let config = Config {
            home_label: Some("Deck".to_string()),
            ..Config::default()
        };
        let settings = config.resolve_for(user());

        assert_eq!(settings.media_root, PathBuf::from("/media/deck"));
        assert_eq!(settings.home_path, PathBuf::from("/home/deck"));
        assert_eq!(settings.home_label, "Deck");
        assert_eq!(settings.group, 1000);
        assert_eq!(settings.transport_retry(), Duration::from_secs(5));
        assert_eq!(settings.storage_limits(), StorageLimits::default());
        assert_eq!(settings.file_policy().mode_for(true), DEFAULT_DIRECTORY_MODE);
    }

    #[test]
    fn test_resolve_keeps_explicit_values() {
        let config = Config {
            media_root: Some(PathBuf::from("/mnt/media")),
            home_path: Some(PathBuf::from("/srv/share")),
            group: Some(100),
            ..Config::default()
        };
        let settings = config.resolve_for(user());

        assert_eq!(settings.media_root, PathBuf::from("/mnt/media"));
        assert_eq!(settings.home_path, PathBuf::from("/srv/share"));
        assert_eq!(settings.group, 100);
        assert!(!settings.home_label.is_empty());
    }

    #[test]
    fn test_clean_label() {
        assert_eq!(
            clean_label("Raspberry Pi 4 Model B Rev 1.4\0"),
            Some("Raspberry Pi 4 Model B Rev 1.4".to_string())
        );
        assert_eq!(clean_label(" \0\n"), None);
    }
}
