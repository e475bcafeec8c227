use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub user_data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_path: PathBuf,
}

impl AppPaths {
    pub fn new() -> Self {
        Self::from_data_dir(discover_user_data_dir())
    }

    pub fn from_data_dir(user_data_dir: impl Into<PathBuf>) -> Self {
        let user_data_dir = user_data_dir.into();
        let log_dir = user_data_dir.join("logs");
        let config_path = match env::var("CORE_UPDATER_CONFIG_PATH") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => user_data_dir.join("config.yml"),
        };

        for dir in [&user_data_dir, &log_dir] {
            let _ = fs::create_dir_all(dir);
        }

        AppPaths {
            user_data_dir,
            log_dir,
            config_path,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

fn discover_user_data_dir() -> PathBuf {
    if let Ok(dir) = env::var("CORE_UPDATER_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let xdg = env::var("XDG_CONFIG_HOME").unwrap_or_else(|_| {
        home_dir()
            .join(".config")
            .to_string_lossy()
            .to_string()
    });
    PathBuf::from(xdg).join("retroarch-core-updater")
}

pub fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

