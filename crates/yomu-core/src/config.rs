use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::YomuError;

const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub filters: FilterConfig,
    pub results: ResultsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub user_agent: String,
    pub download_timeout_ms: u64,
}

/// Limits applied to filter scripts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// 0 means unlimited.
    pub max_operations: u64,
    /// 0 keeps the engine default.
    pub max_call_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    pub overview_max_entries: usize,
}

impl AppConfig {
    /// Load config: user file (if exists) merged over built-in defaults.
    pub fn load() -> Result<Self, YomuError> {
        let user_path = Self::config_path();
        if user_path.exists() {
            let user_str = std::fs::read_to_string(&user_path)?;
            Self::from_toml(&user_str)
        } else {
            Self::from_toml("")
        }
    }

    /// Parse `user` on top of the built-in defaults. Missing keys keep their
    /// default value.
    pub fn from_toml(user: &str) -> Result<Self, YomuError> {
        let mut merged: toml::Table =
            toml::from_str(DEFAULT_CONFIG).map_err(|e| YomuError::Config(e.to_string()))?;
        let overlay: toml::Table =
            toml::from_str(user).map_err(|e| YomuError::Config(e.to_string()))?;
        merge_tables(&mut merged, overlay);
        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| YomuError::Config(e.to_string()))
    }

    /// Save current config to the user config file.
    pub fn save(&self) -> Result<(), YomuError> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| YomuError::Config(e.to_string()))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Path to user config file (XDG on Linux, AppData on Windows).
    pub fn config_path() -> PathBuf {
        Self::project_dirs()
            .map(|d| d.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Path to the database file.
    pub fn db_path() -> PathBuf {
        Self::project_dirs()
            .map(|d| d.data_dir().join("yomu.db"))
            .unwrap_or_else(|| PathBuf::from("yomu.db"))
    }

    /// Ensure the data directory exists and return the DB path.
    pub fn ensure_db_path() -> Result<PathBuf, YomuError> {
        let path = Self::db_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("", "", "yomu")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("built-in default config is valid TOML")
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(overlay_table) => match base.get_mut(&key) {
                Some(toml::Value::Table(base_table)) => merge_tables(base_table, overlay_table),
                _ => {
                    base.insert(key, toml::Value::Table(overlay_table));
                }
            },
            other => {
                base.insert(key, other);
            }
        }
    }
}
