use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::api::DEFAULT_SERVER_URL;
use crate::error::{DbError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server_url: Option<String>,
    pub project: Option<String>,
    pub username: Option<String>,
    pub root_folder: Option<String>,
    pub include_trial_name: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_url: Some(DEFAULT_SERVER_URL.to_string()),
            project: None,
            username: None,
            root_folder: None,
            include_trial_name: true,
        }
    }
}

impl AppConfig {
    pub fn server_url(&self) -> &str {
        self.server_url.as_deref().unwrap_or(DEFAULT_SERVER_URL)
    }

    pub fn project(&self) -> Result<&str> {
        self.project
            .as_deref()
            .ok_or_else(|| DbError::Config("no project configured; run `mosa login`".into()))
    }

    pub fn username(&self) -> Result<&str> {
        self.username
            .as_deref()
            .ok_or_else(|| DbError::Config("no username configured; run `mosa login`".into()))
    }

    pub fn root_folder(&self) -> Result<PathBuf> {
        self.root_folder
            .as_deref()
            .map(expand_home)
            .ok_or_else(|| DbError::Config("no root folder configured; run `mosa login`".into()))
    }
}

/// Fields to change in [`ConfigManager::update`]; `None` leaves a field as is.
#[derive(Debug, Default, Clone)]
pub struct ConfigUpdate {
    pub server_url: Option<String>,
    pub project: Option<String>,
    pub username: Option<String>,
    pub root_folder: Option<String>,
    pub include_trial_name: Option<bool>,
}

pub struct ConfigManager {
    config_path: PathBuf,
    pub config: AppConfig,
}

impl ConfigManager {
    /// Load `~/.config/mosa/dbinterface.conf`.
    pub fn load_default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let config_dir = PathBuf::from(&home).join(".config").join("mosa");
        Self::new(&config_dir)
    }

    pub fn new(config_dir: &Path) -> Self {
        let config_path = config_dir.join("dbinterface.conf");

        let config = match fs::read_to_string(&config_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable config {:?}: {}", config_path, e);
                AppConfig::default()
            }),
            Err(_) => AppConfig::default(),
        };

        Self {
            config_path,
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.config_path.parent() {
            fs::create_dir_all(dir).map_err(|e| DbError::io(dir, e))?;
        }
        let content = serde_json::to_string_pretty(&self.config)
            .map_err(|e| DbError::Config(e.to_string()))?;
        fs::write(&self.config_path, content).map_err(|e| DbError::io(&self.config_path, e))?;
        Ok(())
    }

    /// Merge `update` into the config and save it.
    pub fn update(&mut self, update: ConfigUpdate) -> Result<()> {
        if let Some(u) = update.server_url {
            self.config.server_url = Some(u);
        }
        if let Some(p) = update.project {
            self.config.project = Some(p);
        }
        if let Some(u) = update.username {
            self.config.username = Some(u);
        }
        if let Some(r) = update.root_folder {
            self.config.root_folder = Some(r);
        }
        if let Some(t) = update.include_trial_name {
            self.config.include_trial_name = t;
        }

        self.save()
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let cm = ConfigManager::new(dir.path());
        assert_eq!(cm.config, AppConfig::default());
        assert_eq!(cm.config.server_url(), DEFAULT_SERVER_URL);
        assert!(cm.config.project().is_err());
    }

    #[test]
    fn test_update_persists() {
        let dir = tempdir().unwrap();
        let mut cm = ConfigManager::new(dir.path());
        cm.update(ConfigUpdate {
            project: Some("FC_XX16E".into()),
            username: Some("felix".into()),
            root_folder: Some("/data/FC_XX16E".into()),
            ..ConfigUpdate::default()
        })
        .unwrap();

        let reloaded = ConfigManager::new(dir.path());
        assert_eq!(reloaded.config.project().unwrap(), "FC_XX16E");
        assert_eq!(reloaded.config.username().unwrap(), "felix");
        assert_eq!(reloaded.config.root_folder().unwrap(), PathBuf::from("/data/FC_XX16E"));
        assert!(reloaded.config.include_trial_name);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("dbinterface.conf"), r#"{"project": "P"}"#).unwrap();
        let cm = ConfigManager::new(dir.path());
        assert_eq!(cm.config.project.as_deref(), Some("P"));
        assert!(cm.config.include_trial_name);
        assert_eq!(cm.config.server_url(), DEFAULT_SERVER_URL);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("dbinterface.conf"), "not json").unwrap();
        assert_eq!(ConfigManager::new(dir.path()).config, AppConfig::default());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        let expanded = expand_home("~/data");
        assert!(expanded.ends_with("data"));
        assert!(!expanded.starts_with("~"));
    }
}
