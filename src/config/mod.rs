//! JSON configuration shared by `sockexec` and `sockexecd`
//!
//! ```json
//! {
//!   "common": { "root": "/run/sockexec", "name": "build" },
//!   "server": { "startdir": "/work", "env": { "LANG": "C.UTF-8" } },
//!   "client": { "env": { "CI": "1" }, "id": "0123abcd", "summary": true }
//! }
//! ```
//!
//! Every key is optional. The file is looked up in this order, the last one
//! present winning: `./config.json`, `$SOCKEXEC_CONFIG`, `--config PATH`.
//! Only a path given with `--config` must exist and parse; the other two are
//! skipped (with a warning if unreadable). Command-line flags override
//! whatever the file says.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_PATH: &str = "./config.json";

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "SOCKEXEC_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommonSection {
    pub root: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub startdir: String,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub env: HashMap<String, String>,
    pub id: String,
    pub summary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub common: CommonSection,
    pub server: ServerSection,
    pub client: ClientSection,
}

impl Config {
    /// Parse a config file; `Ok(None)` when it does not exist
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if meta.is_dir() {
            return Err(ConfigError::IsDirectory(path.to_path_buf()));
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "config loaded");
        Ok(Some(config))
    }

    /// Locate and load the effective config
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::discover_with(explicit, std::env::var(CONFIG_ENV).ok())
    }

    pub fn discover_with(explicit: Option<&Path>, env_path: Option<String>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path)?.ok_or_else(|| ConfigError::NotFound(path.to_path_buf()));
        }

        let path = env_path
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        match Self::load(&path) {
            Ok(config) => Ok(config.unwrap_or_default()),
            Err(e) => {
                warn!(error = %e, "ignoring config");
                Ok(Self::default())
            }
        }
    }
}

/// Flag value if given, else the config value, else `None`
pub fn pick(flag: Option<String>, config: &str) -> Option<String> {
    flag.filter(|v| !v.is_empty())
        .or_else(|| (!config.is_empty()).then(|| config.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn write_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"{
                "common": {"root": "/run/sx", "name": "build"},
                "server": {"startdir": "/work", "env": {"LANG": "C"}},
                "client": {"env": {"CI": "1"}, "id": "abcd", "summary": true}
            }"#,
        );
        let config = Config::load(file.path()).unwrap().unwrap();
        assert_eq!(config.common.root, "/run/sx");
        assert_eq!(config.common.name, "build");
        assert_eq!(config.server.startdir, "/work");
        assert_eq!(config.server.env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(config.client.id, "abcd");
        assert!(config.client.summary);
    }

    #[test]
    fn test_partial_config_defaults() {
        let file = write_config(r#"{"common": {"name": "only"}}"#);
        let config = Config::load(file.path()).unwrap().unwrap();
        assert_eq!(config.common.name, "only");
        assert!(config.common.root.is_empty());
        assert!(!config.client.summary);
    }

    #[test]
    fn test_missing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        assert!(Config::load(&path).unwrap().is_none());

        let err = Config::discover_with(Some(&path), None).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_explicit_bad_json_is_error() {
        let file = write_config("{not json");
        let err = Config::discover_with(Some(file.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_path_used_and_errors_ignored() {
        let file = write_config(r#"{"common": {"root": "/from/env"}}"#);
        let config = Config::discover_with(None, Some(file.path().display().to_string())).unwrap();
        assert_eq!(config.common.root, "/from/env");

        let bad = write_config("[]");
        let config = Config::discover_with(None, Some(bad.path().display().to_string())).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_directory_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = Config::load(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::IsDirectory(_)));
    }

    #[test]
    fn test_pick_flag_over_config() {
        assert_eq!(pick(Some("flag".into()), "cfg"), Some("flag".to_string()));
        assert_eq!(pick(None, "cfg"), Some("cfg".to_string()));
        assert_eq!(pick(Some(String::new()), ""), None);
    }
}
