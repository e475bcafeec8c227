use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::defaults::{
    default_config, DEFAULT_ARCHIVE_NAME, DEFAULT_CORE_INFO_URL, DEFAULT_INSTALL_EXCLUDES,
    DEFAULT_MANIFEST_URL, DEFAULT_PLATFORM, DEFAULT_USER_AGENT,
};
use super::paths::AppPaths;
use super::validation::validate_config;
use crate::core::errors::ConfigError;
use crate::workflow::BackupPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSettings {
    pub base_url: String,
    pub platform: String,
    pub archive_name: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl DownloadSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSettings {
    pub backup_policy: BackupPolicy,
    pub exclude: Vec<String>,
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
}

impl InstallSettings {
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreInfoSettings {
    pub enabled: bool,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastSelection {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub target: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    pub manifest: ManifestSettings,
    pub download: DownloadSettings,
    pub install: InstallSettings,
    pub core_info: CoreInfoSettings,
    #[serde(default)]
    pub last_selection: LastSelection,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            manifest: ManifestSettings {
                base_url: DEFAULT_MANIFEST_URL.to_string(),
                platform: DEFAULT_PLATFORM.to_string(),
                archive_name: DEFAULT_ARCHIVE_NAME.to_string(),
                user_agent: DEFAULT_USER_AGENT.to_string(),
                request_timeout_secs: 10,
            },
            download: DownloadSettings {
                connect_timeout_secs: 30,
                idle_timeout_secs: 30,
            },
            install: InstallSettings {
                backup_policy: BackupPolicy::default(),
                exclude: DEFAULT_INSTALL_EXCLUDES
                    .iter()
                    .map(|item| item.to_string())
                    .collect(),
                temp_root: None,
            },
            core_info: CoreInfoSettings {
                enabled: false,
                url: DEFAULT_CORE_INFO_URL.to_string(),
            },
            last_selection: LastSelection::default(),
        }
    }
}

#[derive(Clone)]
pub struct ConfigService {
    paths: Arc<AppPaths>,
}

impl ConfigService {
    pub fn new(paths: Arc<AppPaths>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config_path(&self) -> PathBuf {
        self.paths.config_path.clone()
    }

    /// Built-in defaults with the user's file merged on top.
    pub fn load_config(&self) -> Result<Value, ConfigError> {
        let user_config = load_yaml_file(&self.config_path());
        let merged = deep_merge(&default_config(), &user_config);
        validate_config(&merged)?;
        Ok(merged)
    }

    pub fn settings(&self) -> Result<UpdaterConfig, ConfigError> {
        let merged = self.load_config()?;
        serde_json::from_value(merged).map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    pub fn update_config(&self, config_data: Value, merge: bool) -> Result<(), ConfigError> {
        let to_save = if merge {
            let current = load_yaml_file(&self.config_path());
            deep_merge(&current, &config_data)
        } else {
            config_data
        };

        validate_config(&deep_merge(&default_config(), &to_save))?;
        save_config_file(&self.config_path(), &to_save)
    }

    pub fn record_selection(&self, version: &str, target: &Path) -> Result<(), ConfigError> {
        let update = serde_json::json!({
            "last_selection": {
                "version": version,
                "target": target.to_string_lossy(),
            }
        });
        self.update_config(update, true)
    }
}

fn load_yaml_file(path: &Path) -> Value {
    if !path.exists() {
        return Value::Object(Map::new());
    }

    match fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<Value>(&contents) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => Value::Object(Map::new()),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Ignoring unreadable config file");
                Value::Object(Map::new())
            }
        },
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Failed to read config file");
            Value::Object(Map::new())
        }
    }
}

fn save_config_file(path: &Path, config: &Value) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let yaml = serde_yaml::to_string(config)?;
    fs::write(path, yaml).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn deep_merge(base: &Value, override_value: &Value) -> Value {
    match (base, override_value) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged: Map<String, Value> = base_map.clone();
            for (key, value) in override_map {
                let merged_value = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        _ => override_value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn service_in(dir: &TempDir) -> ConfigService {
        let paths = AppPaths {
            user_data_dir: dir.path().to_path_buf(),
            log_dir: dir.path().join("logs"),
            config_path: dir.path().join("config.yml"),
        };
        ConfigService::new(Arc::new(paths))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = service_in(&dir).settings().unwrap();
        assert_eq!(settings.manifest.archive_name, DEFAULT_ARCHIVE_NAME);
        assert_eq!(settings.install.backup_policy, BackupPolicy::TimestampSuffix);
        assert!(!settings.core_info.enabled);
        assert!(settings.last_selection.target.is_none());
    }

    #[test]
    fn user_file_overrides_single_keys() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.yml"),
            "download:\n  idle_timeout_secs: 5\ninstall:\n  backup_policy: overwrite\n",
        )
        .unwrap();

        let settings = service_in(&dir).settings().unwrap();
        assert_eq!(settings.download.idle_timeout_secs, 5);
        assert_eq!(settings.download.connect_timeout_secs, 30);
        assert_eq!(settings.install.backup_policy, BackupPolicy::Overwrite);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.yml"),
            "download:\n  idle_timeout_secs: -4\n",
        )
        .unwrap();
        assert!(service_in(&dir).settings().is_err());
    }

    #[test]
    fn record_selection_round_trips_through_yaml() {
        let dir = TempDir::new().unwrap();
        let service = service_in(&dir);
        service
            .record_selection("1.21.0", Path::new("/home/deck/cores"))
            .unwrap();

        let settings = service.settings().unwrap();
        assert_eq!(settings.last_selection.version.as_deref(), Some("1.21.0"));
        assert_eq!(
            settings.last_selection.target,
            Some(PathBuf::from("/home/deck/cores"))
        );
    }

    #[test]
    fn deep_merge_keeps_nested_defaults() {
        let merged = deep_merge(
            &json!({"a": {"b": 1, "c": 2}}),
            &json!({"a": {"c": 3}, "d": true}),
        );
        assert_eq!(merged, json!({"a": {"b": 1, "c": 3}, "d": true}));
    }
}
