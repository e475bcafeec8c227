use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::progress::format_bytes;
use crate::core::errors::WorkflowError;

/// What to do when a snapshot for the same version already sits next to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPolicy {
    /// `<dir>_backup_<version>_<timestamp>`, with `-N` appended on collision.
    #[default]
    TimestampSuffix,
    /// Replace `<dir>_backup_<version>`.
    Overwrite,
    /// Fail if `<dir>_backup_<version>` exists.
    Refuse,
}

impl std::str::FromStr for BackupPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "timestamp_suffix" | "timestamp" => Ok(BackupPolicy::TimestampSuffix),
            "overwrite" => Ok(BackupPolicy::Overwrite),
            "refuse" => Ok(BackupPolicy::Refuse),
            other => Err(format!("unknown backup policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupSnapshot {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub total_bytes: u64,
}

type Inventory = BTreeMap<PathBuf, u64>;

/// Copies the core directory into a sibling snapshot. Returns `None` when the
/// directory holds nothing worth preserving.
pub(crate) fn create_snapshot(
    target: &Path,
    version: &str,
    policy: BackupPolicy,
) -> Result<Option<BackupSnapshot>, WorkflowError> {
    if !has_existing_cores(target)? {
        return Ok(None);
    }

    let source_inventory = inventory(target).map_err(|err| {
        WorkflowError::BackupFailed(format!("cannot read {}: {}", target.display(), err))
    })?;
    let total_bytes: u64 = source_inventory.values().sum();

    let parent = target.parent().ok_or_else(|| {
        WorkflowError::BackupFailed(format!("{} has no parent directory", target.display()))
    })?;
    match fs2::available_space(parent) {
        Ok(available) if available < total_bytes => {
            return Err(WorkflowError::BackupFailed(format!(
                "not enough free space next to {}: need {}, have {}",
                target.display(),
                format_bytes(total_bytes),
                format_bytes(available)
            )));
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(error = %err, "Could not determine free space; attempting backup anyway");
        }
    }

    let created_at = Utc::now();
    let location = snapshot_location(target, version, policy, created_at)?;
    let partial = partial_path(&location);
    if partial.exists() {
        fs::remove_dir_all(&partial).map_err(|err| {
            WorkflowError::BackupFailed(format!(
                "cannot clear stale {}: {}",
                partial.display(),
                err
            ))
        })?;
    }

    if let Err(err) = copy_dir_recursive(target, &partial) {
        let _ = fs::remove_dir_all(&partial);
        return Err(WorkflowError::BackupFailed(format!(
            "copy to {} failed: {}",
            partial.display(),
            err
        )));
    }

    match inventory(&partial) {
        Ok(copied) if copied == source_inventory => {}
        Ok(_) => {
            let _ = fs::remove_dir_all(&partial);
            return Err(WorkflowError::BackupFailed(
                "snapshot does not match the source directory".to_string(),
            ));
        }
        Err(err) => {
            let _ = fs::remove_dir_all(&partial);
            return Err(WorkflowError::BackupFailed(format!(
                "cannot verify snapshot: {}",
                err
            )));
        }
    }

    if policy == BackupPolicy::Overwrite && location.exists() {
        if let Err(err) = fs::remove_dir_all(&location) {
            let _ = fs::remove_dir_all(&partial);
            return Err(WorkflowError::BackupFailed(format!(
                "cannot replace {}: {}",
                location.display(),
                err
            )));
        }
    }
    if let Err(err) = fs::rename(&partial, &location) {
        let _ = fs::remove_dir_all(&partial);
        return Err(WorkflowError::BackupFailed(format!(
            "cannot finalize {}: {}",
            location.display(),
            err
        )));
    }

    Ok(Some(BackupSnapshot {
        path: location,
        created_at,
        file_count: source_inventory.len(),
        total_bytes,
    }))
}

fn has_existing_cores(target: &Path) -> Result<bool, WorkflowError> {
    if !target.exists() {
        return Ok(false);
    }
    let mut entries = fs::read_dir(target).map_err(|err| {
        WorkflowError::BackupFailed(format!("cannot list {}: {}", target.display(), err))
    })?;
    Ok(entries.next().is_some())
}

fn snapshot_location(
    target: &Path,
    version: &str,
    policy: BackupPolicy,
    now: DateTime<Utc>,
) -> Result<PathBuf, WorkflowError> {
    let parent = target.parent().unwrap_or(target);
    let dir_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("cores");
    let base = format!("{}_backup_{}", dir_name, sanitize_component(version));

    match policy {
        BackupPolicy::Overwrite => Ok(parent.join(base)),
        BackupPolicy::Refuse => {
            let path = parent.join(base);
            if path.exists() {
                return Err(WorkflowError::BackupFailed(format!(
                    "{} already exists and the backup policy refuses to replace it",
                    path.display()
                )));
            }
            Ok(path)
        }
        BackupPolicy::TimestampSuffix => {
            let stamped = format!("{}_{}", base, now.format("%Y%m%d-%H%M%S"));
            let mut candidate = parent.join(&stamped);
            let mut counter = 1;
            while candidate.exists() || partial_path(&candidate).exists() {
                candidate = parent.join(format!("{}-{}", stamped, counter));
                counter += 1;
            }
            Ok(candidate)
        }
    }
}

fn partial_path(location: &Path) -> PathBuf {
    let mut name = location
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    location.with_file_name(name)
}

fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Relative path → byte size of every regular file below `root`.
fn inventory(root: &Path) -> std::io::Result<Inventory> {
    let mut files = Inventory::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = fs::metadata(&path)?;
            if metadata.is_dir() {
                stack.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                files.insert(relative.to_path_buf(), metadata.len());
            }
        }
    }
    Ok(files)
}

fn copy_dir_recursive(source: &Path, destination: &Path) -> std::io::Result<()> {
    fs::create_dir_all(destination)?;
    for item in fs::read_dir(source)? {
        let entry = item?;
        let source_path = entry.path();
        let destination_path = destination.join(entry.file_name());
        if source_path.is_dir() {
            copy_dir_recursive(&source_path, &destination_path)?;
        } else {
            fs::copy(&source_path, &destination_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_cores(root: &Path) -> PathBuf {
        let cores = root.join("cores");
        fs::create_dir_all(cores.join("info")).unwrap();
        fs::write(cores.join("snes9x_libretro.so"), b"old snes").unwrap();
        fs::write(cores.join("info").join("snes9x_libretro.info"), b"info").unwrap();
        cores
    }

    #[test]
    fn empty_directory_needs_no_snapshot() {
        let dir = TempDir::new().unwrap();
        let cores = dir.path().join("cores");
        fs::create_dir_all(&cores).unwrap();

        let snapshot = create_snapshot(&cores, "1.21.0", BackupPolicy::TimestampSuffix).unwrap();
        assert!(snapshot.is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn snapshot_copies_every_file_next_to_target() {
        let dir = TempDir::new().unwrap();
        let cores = seeded_cores(dir.path());

        let snapshot = create_snapshot(&cores, "1.21.0", BackupPolicy::TimestampSuffix)
            .unwrap()
            .expect("cores exist, snapshot expected");

        assert_eq!(snapshot.path.parent(), Some(dir.path()));
        assert!(snapshot
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("cores_backup_1.21.0_"));
        assert_eq!(snapshot.file_count, 2);
        assert_eq!(
            fs::read(snapshot.path.join("snes9x_libretro.so")).unwrap(),
            b"old snes"
        );
        assert!(snapshot.path.join("info/snes9x_libretro.info").exists());
        assert!(!partial_path(&snapshot.path).exists());
    }

    #[test]
    fn timestamp_policy_never_collides() {
        let dir = TempDir::new().unwrap();
        let cores = seeded_cores(dir.path());
        let now = Utc::now();

        let first = snapshot_location(&cores, "1.21.0", BackupPolicy::TimestampSuffix, now).unwrap();
        fs::create_dir_all(&first).unwrap();
        let second =
            snapshot_location(&cores, "1.21.0", BackupPolicy::TimestampSuffix, now).unwrap();

        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("-1"));
    }

    #[test]
    fn refuse_policy_rejects_existing_snapshot() {
        let dir = TempDir::new().unwrap();
        let cores = seeded_cores(dir.path());
        fs::create_dir_all(dir.path().join("cores_backup_1.21.0")).unwrap();

        let err = create_snapshot(&cores, "1.21.0", BackupPolicy::Refuse).unwrap_err();
        assert!(matches!(err, WorkflowError::BackupFailed(_)));
    }

    #[test]
    fn overwrite_policy_replaces_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let cores = seeded_cores(dir.path());
        let previous = dir.path().join("cores_backup_1.21.0");
        fs::create_dir_all(&previous).unwrap();
        fs::write(previous.join("stale.so"), b"stale").unwrap();

        let snapshot = create_snapshot(&cores, "1.21.0", BackupPolicy::Overwrite)
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.path, previous);
        assert!(!previous.join("stale.so").exists());
        assert!(previous.join("snes9x_libretro.so").exists());
    }

    #[test]
    fn policy_parses_from_cli_spelling() {
        assert_eq!(
            "timestamp-suffix".parse::<BackupPolicy>().unwrap(),
            BackupPolicy::TimestampSuffix
        );
        assert_eq!("Overwrite".parse::<BackupPolicy>().unwrap(), BackupPolicy::Overwrite);
        assert!("rename".parse::<BackupPolicy>().is_err());
    }
}
