use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::workflow::Phase;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid target {}: {reason}", path.display())]
    InvalidTarget { path: PathBuf, reason: String },
    #[error("version {0} is not listed in the manifest")]
    UnknownVersion(String),
    #[error("backup failed: {0}")]
    BackupFailed(String),
    #[error("download incomplete from {url}: {detail}")]
    DownloadIncomplete { url: String, detail: String },
    #[error("download from {url} stalled for {idle_secs}s")]
    DownloadTimedOut { url: String, idle_secs: u64 },
    #[error("extraction failed: {0}")]
    ExtractFailed(String),
    #[error("{0}")]
    PartialInstall(PartialInstallReport),
    #[error("an update is already running for {}", .0.display())]
    RunAlreadyInProgress(PathBuf),
    #[error("cancelled during {0}")]
    Cancelled(Phase),
    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        WorkflowError::Internal(err.to_string())
    }

    pub fn invalid_target(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        WorkflowError::InvalidTarget {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for scripted callers. Each top-level kind is distinct.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkflowError::Internal(_) => 1,
            WorkflowError::InvalidTarget { .. } => 2,
            WorkflowError::UnknownVersion(_) => 3,
            WorkflowError::BackupFailed(_) => 10,
            WorkflowError::DownloadIncomplete { .. } => 11,
            WorkflowError::DownloadTimedOut { .. } => 12,
            WorkflowError::ExtractFailed(_) => 13,
            WorkflowError::PartialInstall(_) => 20,
            WorkflowError::RunAlreadyInProgress(_) => 30,
            WorkflowError::Cancelled(_) => 130,
        }
    }

    /// True when the live target directory is guaranteed to be untouched.
    pub fn target_untouched(&self) -> bool {
        !matches!(
            self,
            WorkflowError::PartialInstall(_) | WorkflowError::Internal(_)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// File-level breakdown of an install that stopped partway.
#[derive(Debug, Clone, Serialize)]
pub struct PartialInstallReport {
    pub placed: Vec<PathBuf>,
    pub failed: Vec<FailedFile>,
    pub cancelled: bool,
    pub backup_location: Option<PathBuf>,
}

impl fmt::Display for PartialInstallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cause = if self.cancelled {
            "cancelled"
        } else {
            "failed"
        };
        write!(
            f,
            "partial install ({}): {} file(s) placed, {} file(s) failed",
            cause,
            self.placed.len(),
            self.failed.len()
        )?;
        for failed in &self.failed {
            write!(f, "\n  - {}: {}", failed.path.display(), failed.reason)?;
        }
        match &self.backup_location {
            Some(path) => write!(f, "\nprevious cores are preserved in {}", path.display()),
            None => write!(f, "\nno backup was taken (target held no cores)"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("manifest endpoint returned {0}")]
    Status(reqwest::StatusCode),
    #[error("manifest listing contained no versions")]
    Empty,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let errors = vec![
            WorkflowError::internal("boom"),
            WorkflowError::invalid_target("/nope", "missing"),
            WorkflowError::UnknownVersion("9.9.9".to_string()),
            WorkflowError::BackupFailed("disk full".to_string()),
            WorkflowError::DownloadIncomplete {
                url: "http://x".to_string(),
                detail: "short".to_string(),
            },
            WorkflowError::DownloadTimedOut {
                url: "http://x".to_string(),
                idle_secs: 5,
            },
            WorkflowError::ExtractFailed("corrupt".to_string()),
            WorkflowError::PartialInstall(PartialInstallReport {
                placed: Vec::new(),
                failed: Vec::new(),
                cancelled: false,
                backup_location: None,
            }),
            WorkflowError::RunAlreadyInProgress(PathBuf::from("/cores")),
            WorkflowError::Cancelled(Phase::Fetch),
        ];

        let mut codes: Vec<i32> = errors.iter().map(WorkflowError::exit_code).collect();
        assert!(codes.iter().all(|code| *code != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn partial_install_report_lists_failed_files() {
        let report = PartialInstallReport {
            placed: vec![PathBuf::from("a_libretro.so")],
            failed: vec![FailedFile {
                path: PathBuf::from("b_libretro.so"),
                reason: "permission denied".to_string(),
            }],
            cancelled: false,
            backup_location: Some(PathBuf::from("/deck/cores_backup")),
        };

        let text = report.to_string();
        assert!(text.contains("1 file(s) placed, 1 file(s) failed"));
        assert!(text.contains("b_libretro.so: permission denied"));
        assert!(text.contains("/deck/cores_backup"));
    }
}
