use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::config::paths::home_dir;

const STEAM_RETROARCH: &str = "steamapps/common/RetroArch";
const SD_MOUNT_ROOTS: [&str; 2] = ["/run/media", "/media"];
const RETROARCH_MARKERS: [&str; 3] = [
    "retroarch",
    "retroarch.cfg",
    "RetroArch-Linux-x86_64.AppImage",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLocation {
    Internal,
    SdCard,
    Custom,
}

/// A directory that holds, or may hold, the emulator's cores.
#[derive(Debug, Clone, Serialize)]
pub struct InstallTarget {
    pub path: PathBuf,
    pub location: TargetLocation,
    pub display_name: String,
    pub writable: bool,
    pub free_space: Option<u64>,
}

impl InstallTarget {
    pub fn probe(path: impl Into<PathBuf>, location: TargetLocation) -> Self {
        let path = path.into();
        let path = fs::canonicalize(&path).unwrap_or(path);
        let display_name = match location {
            TargetLocation::Internal => "Internal Storage".to_string(),
            TargetLocation::SdCard => format!("SD Card ({})", sd_card_label(&path)),
            TargetLocation::Custom => path.display().to_string(),
        };
        Self {
            writable: is_writable(&path),
            free_space: fs2::available_space(&path).ok(),
            path,
            location,
            display_name,
        }
    }
}

/// Every RetroArch core directory found on internal storage and mounted SD cards.
pub fn discover_targets() -> Vec<InstallTarget> {
    let sd_roots: Vec<PathBuf> = SD_MOUNT_ROOTS.iter().map(PathBuf::from).collect();
    discover_targets_in(&home_dir(), &sd_roots)
}

pub fn discover_targets_in(home: &Path, sd_roots: &[PathBuf]) -> Vec<InstallTarget> {
    let mut targets = Vec::new();

    let internal = home.join(".local/share/Steam").join(STEAM_RETROARCH);
    if let Some(cores) = usable_cores_dir(&internal) {
        targets.push(InstallTarget::probe(cores, TargetLocation::Internal));
    }

    let mut libraries = Vec::new();
    for root in sd_roots {
        let Ok(mounts) = fs::read_dir(root) else {
            continue;
        };
        let mut mounts: Vec<PathBuf> = mounts.flatten().map(|entry| entry.path()).collect();
        mounts.sort();
        libraries.extend(mounts.into_iter().map(|mount| mount.join(STEAM_RETROARCH)));
    }

    for library in libraries {
        let Some(cores) = usable_cores_dir(&library) else {
            continue;
        };
        let candidate = InstallTarget::probe(cores, TargetLocation::SdCard);
        if targets.iter().any(|known| known.path == candidate.path) {
            continue;
        }
        targets.push(candidate);
    }

    tracing::debug!(count = targets.len(), "Discovered install targets");
    targets
}

/// Internal storage wins; otherwise the first SD card.
pub fn recommended_target(targets: &[InstallTarget]) -> Option<&InstallTarget> {
    targets
        .iter()
        .find(|target| target.location == TargetLocation::Internal)
        .or_else(|| targets.first())
}

/// A cores path looks right when its parent holds a RetroArch executable or config.
pub fn validate_installation_path(path: &Path) -> bool {
    let Some(parent) = path.parent() else {
        return false;
    };
    parent.is_dir()
        && RETROARCH_MARKERS
            .iter()
            .any(|marker| parent.join(marker).exists())
}

pub fn is_handheld_host() -> bool {
    if Path::new("/home/deck").exists() || Path::new("/usr/bin/steamos-session-select").exists() {
        return true;
    }
    env::var_os("SteamOS").is_some() || env::var_os("STEAM_COMPAT_CLIENT_INSTALL_PATH").is_some()
}

pub fn is_writable(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    let marker = path.join(format!(".write_test_{}", uuid::Uuid::new_v4()));
    match fs::OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(file) => {
            drop(file);
            if let Err(err) = fs::remove_file(&marker) {
                tracing::warn!(marker = %marker.display(), error = %err, "Could not remove write marker");
            }
            true
        }
        Err(_) => false,
    }
}

fn usable_cores_dir(retroarch_dir: &Path) -> Option<PathBuf> {
    if !retroarch_dir.is_dir() {
        return None;
    }
    let cores = retroarch_dir.join("cores");
    if cores.is_dir() || fs::create_dir_all(&cores).is_ok() {
        return Some(cores);
    }
    None
}

fn sd_card_label(cores: &Path) -> String {
    // <mount>/steamapps/common/RetroArch/cores
    cores
        .ancestors()
        .nth(4)
        .and_then(|mount| mount.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
