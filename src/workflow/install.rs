use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::cancel::CancelToken;
use crate::core::errors::{FailedFile, WorkflowError};

/// One file waiting to be placed: where it sits now, and where it goes relative to the target.
#[derive(Debug, Clone)]
pub(crate) struct StagedFile {
    pub source: PathBuf,
    pub relative: PathBuf,
}

#[derive(Debug, Default)]
pub(crate) struct InstallReport {
    pub placed: Vec<PathBuf>,
    pub failed: Vec<FailedFile>,
    pub cancelled: bool,
}

impl InstallReport {
    pub(crate) fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Shallowest directory named `cores`; otherwise the tree with single wrapper
/// directories stripped.
pub(crate) fn locate_core_root(extracted: &Path) -> PathBuf {
    let mut queue = VecDeque::from([extracted.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut children: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        children.sort();
        for child in children {
            if child.file_name().and_then(|name| name.to_str()) == Some("cores") {
                return child;
            }
            queue.push_back(child);
        }
    }
    strip_wrapper_dirs(extracted)
}

fn strip_wrapper_dirs(root: &Path) -> PathBuf {
    let mut current = root.to_path_buf();
    loop {
        let Ok(entries) = fs::read_dir(&current) else {
            return current;
        };
        let entries: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
        match entries.as_slice() {
            [only] if only.is_dir() => current = only.clone(),
            _ => return current,
        }
    }
}

/// Every regular file below `root`, skipping top-level entries named in `exclude`.
pub(crate) fn stage_files(root: &Path, exclude: &[String]) -> io::Result<Vec<StagedFile>> {
    let mut staged = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let top_level = relative
                .components()
                .next()
                .map(|component| component.as_os_str().to_string_lossy().to_string());
            if top_level.is_some_and(|name| exclude.iter().any(|skip| *skip == name)) {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else {
                staged.push(StagedFile {
                    relative: relative.to_path_buf(),
                    source: path,
                });
            }
        }
    }
    staged.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(staged)
}

/// Moves staged files into `target` one by one, each on the blocking pool so
/// the run keeps yielding between files. Nothing is rolled back: the report
/// says exactly which files landed and which did not.
pub(crate) async fn install_files(
    files: Vec<StagedFile>,
    target: &Path,
    cancel: &CancelToken,
    mut progress_cb: impl FnMut(usize, usize, &Path),
) -> Result<InstallReport, WorkflowError> {
    let mut report = InstallReport::default();
    let total = files.len();

    for (index, file) in files.into_iter().enumerate() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let destination = target.join(&file.relative);
        let source = file.source;
        let placed = tokio::task::spawn_blocking(move || place_file(&source, &destination))
            .await
            .map_err(WorkflowError::internal)?;
        match placed {
            Ok(()) => report.placed.push(file.relative.clone()),
            Err(err) => {
                tracing::warn!(file = %file.relative.display(), error = %err, "Failed to place file");
                report.failed.push(FailedFile {
                    path: file.relative.clone(),
                    reason: err.to_string(),
                });
            }
        }
        progress_cb(index + 1, total, &file.relative);
    }

    Ok(report)
}

fn place_file(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    if destination.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "a directory with this name exists in the target",
        ));
    }
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(_) => copy_then_swap(source, destination),
    }
}

/// Cross-filesystem fallback: the copy lands beside the destination first so
/// an interrupted copy never leaves a truncated core behind.
fn copy_then_swap(source: &Path, destination: &Path) -> io::Result<()> {
    let file_name = destination
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let staging = destination.with_file_name(format!(".{}.{}.partial", file_name, uuid::Uuid::new_v4()));
    if let Err(err) = fs::copy(source, &staging) {
        let _ = fs::remove_file(&staging);
        return Err(err);
    }
    if let Err(err) = fs::rename(&staging, destination) {
        let _ = fs::remove_file(&staging);
        return Err(err);
    }
    let _ = fs::remove_file(source);
    Ok(())
}
