//! The install workflow: Backup → Fetch → Extract → Install → Cleanup.
//!
//! The live core directory is only written during Install, and Install only
//! starts once a verified snapshot exists and every archive extracted
//! cleanly. Any failure before that point leaves the directory as it was.

mod backup;
mod cancel;
mod extract;
mod fetch;
mod install;
mod phase;
mod progress;

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fs2::FileExt;
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use backup::{BackupPolicy, BackupSnapshot};
pub use cancel::CancelToken;
pub use phase::{Phase, PhaseTracker};
pub use progress::{format_bytes, EventLog, ProgressEvent, ProgressSink};

use crate::core::config::UpdaterConfig;
use crate::core::errors::{PartialInstallReport, WorkflowError};
use crate::discovery::is_writable;
use crate::manifest::VersionManifest;
use install::StagedFile;
use progress::{band, ProgressReporter};

const CORES_LABEL: &str = "cores";
const CORE_INFO_LABEL: &str = "core-info";

#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub backup_policy: BackupPolicy,
    pub exclude: Vec<String>,
    pub temp_root: PathBuf,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub user_agent: String,
    pub core_info_url: Option<String>,
}

impl WorkflowOptions {
    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self {
            backup_policy: config.install.backup_policy,
            exclude: config.install.exclude.clone(),
            temp_root: config.install.temp_root(),
            connect_timeout: config.download.connect_timeout(),
            idle_timeout: config.download.idle_timeout(),
            user_agent: config.manifest.user_agent.clone(),
            core_info_url: config
                .core_info
                .enabled
                .then(|| config.core_info.url.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveDigest {
    pub label: String,
    pub url: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub version: String,
    pub target_dir: PathBuf,
    pub backup_location: Option<PathBuf>,
    pub installed_files: Vec<PathBuf>,
    pub archives: Vec<ArchiveDigest>,
    pub log: Vec<String>,
}

#[derive(Debug, Clone)]
struct ArchiveSource {
    label: &'static str,
    url: String,
    file_name: String,
}

/// One execution of the workflow. Lives only as long as the run itself.
struct WorkflowRun {
    id: Uuid,
    version: String,
    target: PathBuf,
    tracker: PhaseTracker,
    cancel: CancelToken,
}

impl WorkflowRun {
    /// Phase boundary: the only place cancellation is honored between phases.
    fn enter(&mut self, phase: Phase) -> Result<Phase, WorkflowError> {
        if self.cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled(phase));
        }
        self.transition(phase)
    }

    /// Moves the tracker and returns the phase every following event carries.
    fn transition(&mut self, phase: Phase) -> Result<Phase, WorkflowError> {
        if !self.tracker.advance(phase) {
            return Err(WorkflowError::internal(format!(
                "phase {} cannot follow {}",
                phase,
                self.tracker.current()
            )));
        }
        Ok(self.tracker.current())
    }
}

/// Per-run scratch space under the system temp area.
struct RunWorkspace {
    root: PathBuf,
}

impl RunWorkspace {
    fn new(temp_root: &Path, run_id: Uuid) -> Self {
        Self {
            root: temp_root.join(format!("core-updater-{}", run_id)),
        }
    }

    fn downloads(&self) -> PathBuf {
        self.root.join("downloads")
    }

    fn extract(&self) -> PathBuf {
        self.root.join("extract")
    }

    fn create(&self) -> Result<(), WorkflowError> {
        for dir in [self.downloads(), self.extract()] {
            fs::create_dir_all(&dir).map_err(|err| {
                WorkflowError::internal(format!("cannot create {}: {}", dir.display(), err))
            })?;
        }
        Ok(())
    }

    fn remove(&self) -> std::io::Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

/// Released when the run that holds it ends, however it ends. The lock file
/// extends the refusal to runs started by other processes.
struct ActiveRunGuard {
    active: Arc<Mutex<HashSet<PathBuf>>>,
    target: PathBuf,
    lock: Option<File>,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            let _ = FileExt::unlock(&lock);
        }
        let mut guard = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(&self.target);
    }
}

/// Lock file guarding `target` across processes. It sits beside the target,
/// never inside it.
pub fn run_lock_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "cores".to_string());
    target
        .parent()
        .unwrap_or(target)
        .join(format!(".{}.core-updater.lock", name))
}

/// Handle to a run started with [`WorkflowEngine::start`].
pub struct RunHandle {
    pub run_id: Uuid,
    cancel: CancelToken,
    task: JoinHandle<Result<InstallOutcome, WorkflowError>>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> Result<InstallOutcome, WorkflowError> {
        self.task.await.map_err(WorkflowError::internal)?
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    manifest: Arc<VersionManifest>,
    options: WorkflowOptions,
    client: Client,
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl WorkflowEngine {
    pub fn new(manifest: VersionManifest, options: WorkflowOptions) -> Result<Self, WorkflowError> {
        let client = Client::builder()
            .user_agent(options.user_agent.clone())
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(WorkflowError::internal)?;
        Ok(Self {
            manifest: Arc::new(manifest),
            options,
            client,
            active: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn is_running(&self, target_dir: &Path) -> bool {
        let key = fs::canonicalize(target_dir).unwrap_or_else(|_| target_dir.to_path_buf());
        let guard = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.contains(&key)
    }

    /// Runs the whole workflow on the caller's task.
    pub async fn run(
        &self,
        version: &str,
        target_dir: &Path,
        progress_sink: &dyn ProgressSink,
        cancel_token: &CancelToken,
    ) -> Result<InstallOutcome, WorkflowError> {
        let (target, guard) = match self.admit(version, target_dir) {
            Ok(admitted) => admitted,
            Err(err) => {
                refuse(progress_sink, &err);
                return Err(err);
            }
        };
        self.execute(
            guard,
            Uuid::new_v4(),
            version.to_string(),
            target,
            progress_sink,
            cancel_token.clone(),
        )
        .await
    }

    /// Spawns the workflow on the tokio runtime and returns immediately.
    /// Refusals (unknown version, bad target, run already active) are
    /// reported synchronously.
    pub fn start<S>(&self, version: &str, target_dir: &Path, sink: S) -> Result<RunHandle, WorkflowError>
    where
        S: ProgressSink + 'static,
    {
        let (target, guard) = match self.admit(version, target_dir) {
            Ok(admitted) => admitted,
            Err(err) => {
                refuse(&sink, &err);
                return Err(err);
            }
        };

        let cancel = CancelToken::new();
        let engine = self.clone();
        let version = version.to_string();
        let task_cancel = cancel.clone();
        let run_id = Uuid::new_v4();
        let task = tokio::spawn(async move {
            engine
                .execute(guard, run_id, version, target, &sink, task_cancel)
                .await
        });

        Ok(RunHandle {
            run_id,
            cancel,
            task,
        })
    }

    fn admit(&self, version: &str, target_dir: &Path) -> Result<(PathBuf, ActiveRunGuard), WorkflowError> {
        if !self.manifest.contains(version) {
            return Err(WorkflowError::UnknownVersion(version.to_string()));
        }
        let target = validate_target(target_dir)?;

        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !active.insert(target.clone()) {
            return Err(WorkflowError::RunAlreadyInProgress(target));
        }
        drop(active);

        let mut guard = ActiveRunGuard {
            active: self.active.clone(),
            target: target.clone(),
            lock: None,
        };
        let lock_path = run_lock_path(&target);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|err| {
                WorkflowError::invalid_target(
                    &target,
                    format!("cannot create lock {}: {}", lock_path.display(), err),
                )
            })?;
        if lock.try_lock_exclusive().is_err() {
            return Err(WorkflowError::RunAlreadyInProgress(target));
        }
        guard.lock = Some(lock);
        Ok((target, guard))
    }

    async fn execute(
        &self,
        _guard: ActiveRunGuard,
        run_id: Uuid,
        version: String,
        target: PathBuf,
        sink: &dyn ProgressSink,
        cancel: CancelToken,
    ) -> Result<InstallOutcome, WorkflowError> {
        let mut run = WorkflowRun {
            id: run_id,
            version,
            target,
            tracker: PhaseTracker::new(),
            cancel,
        };
        let mut reporter = ProgressReporter::new(sink);
        let workspace = RunWorkspace::new(&self.options.temp_root, run.id);
        tracing::info!(run_id = %run.id, version = %run.version, target = %run.target.display(), "Starting core update");

        let result = self.run_phases(&mut run, &mut reporter, &workspace).await;

        // Cleanup follows any non-terminal phase.
        let result = match run.transition(Phase::Cleanup) {
            Ok(_) => result,
            Err(err) => result.and(Err(err)),
        };
        let cleanup = run.tracker.current();
        let cleanup_percent = if result.is_ok() {
            97
        } else {
            reporter.percentage()
        };
        reporter.report(cleanup, cleanup_percent, "Removing temporary files...");
        if let Err(err) = workspace.remove() {
            reporter.log(
                cleanup,
                format!(
                    "Could not remove {}: {} (safe to delete manually)",
                    workspace.root.display(),
                    err
                ),
            );
        }

        let result = result.and_then(|outcome| run.transition(Phase::Done).map(|_| outcome));
        match result {
            Ok(mut outcome) => {
                let backup_note = match &outcome.backup_location {
                    Some(path) => format!("previous cores saved in {}", path.display()),
                    None => "no backup was needed".to_string(),
                };
                reporter.report(
                    run.tracker.current(),
                    100,
                    format!(
                        "Update to {} completed: {} file(s) installed into {}; {}",
                        outcome.version,
                        outcome.installed_files.len(),
                        outcome.target_dir.display(),
                        backup_note
                    ),
                );
                outcome.log = reporter.into_lines();
                Ok(outcome)
            }
            Err(err) => {
                let terminal = match &err {
                    WorkflowError::Cancelled(_) => Phase::Cancelled,
                    WorkflowError::PartialInstall(report) if report.cancelled => Phase::Cancelled,
                    _ => Phase::Failed,
                };
                if run.transition(terminal).is_err() {
                    tracing::error!(run_id = %run.id, phase = %terminal, "Run already reached a terminal phase");
                }
                reporter.log(run.tracker.current(), summarize_failure(&err));
                tracing::warn!(run_id = %run.id, error = %err, "Core update did not complete");
                Err(err)
            }
        }
    }

    async fn run_phases(
        &self,
        run: &mut WorkflowRun,
        reporter: &mut ProgressReporter<'_>,
        workspace: &RunWorkspace,
    ) -> Result<InstallOutcome, WorkflowError> {
        // Backup
        let phase = run.enter(Phase::Backup)?;
        reporter.report(phase, 0, "Backing up existing cores...");
        let snapshot = {
            let target = run.target.clone();
            let version = run.version.clone();
            let policy = self.options.backup_policy;
            tokio::task::spawn_blocking(move || backup::create_snapshot(&target, &version, policy))
                .await
                .map_err(|err| WorkflowError::BackupFailed(err.to_string()))??
        };
        match &snapshot {
            Some(snapshot) => reporter.report(
                phase,
                10,
                format!(
                    "Backed up {} file(s) ({}) to {}",
                    snapshot.file_count,
                    format_bytes(snapshot.total_bytes),
                    snapshot.path.display()
                ),
            ),
            None => reporter.report(phase, 10, "No existing cores, skipping backup"),
        }
        let backup_location = snapshot.map(|snapshot| snapshot.path);

        // Fetch
        let phase = run.enter(Phase::Fetch)?;
        workspace.create()?;
        let sources = self.archive_sources(&run.version);
        let mut downloads = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let (start, end) = split_band(10, 70, index, sources.len());
            reporter.report(
                phase,
                start,
                format!("Downloading {} from {}", source.label, source.url),
            );
            let destination = workspace.downloads().join(&source.file_name);
            let mut last_percent = start;
            let mut last_unsized_report = 0u64;
            let archive = fetch::download_archive(
                &self.client,
                &source.url,
                &destination,
                self.options.idle_timeout,
                &run.cancel,
                |downloaded, total| match total {
                    Some(total) if total > 0 => {
                        let percent = band(start, end, downloaded as f64 / total as f64);
                        if percent > last_percent {
                            last_percent = percent;
                            reporter.report(
                                phase,
                                percent,
                                format!(
                                    "Downloading {}... {} / {}",
                                    source.label,
                                    format_bytes(downloaded),
                                    format_bytes(total)
                                ),
                            );
                        }
                    }
                    _ => {
                        if downloaded - last_unsized_report >= 5 * 1024 * 1024 {
                            last_unsized_report = downloaded;
                            reporter.log(
                                phase,
                                format!(
                                    "Downloading {}... {}",
                                    source.label,
                                    format_bytes(downloaded)
                                ),
                            );
                        }
                    }
                },
            )
            .await?;
            reporter.report(
                phase,
                end,
                format!(
                    "Downloaded {} ({}, sha256 {})",
                    source.label,
                    format_bytes(archive.bytes),
                    archive.sha256
                ),
            );
            downloads.push((source, archive));
        }

        // Extract
        let phase = run.enter(Phase::Extract)?;
        let mut staged: Vec<StagedFile> = Vec::new();
        let mut archives = Vec::with_capacity(downloads.len());
        for (index, (source, archive)) in downloads.iter().enumerate() {
            let (start, end) = split_band(70, 85, index, downloads.len());
            reporter.report(phase, start, format!("Extracting {}...", source.label));
            let destination = workspace.extract().join(source.label);
            let archive_path = archive.path.clone();
            let extract_to = destination.clone();
            tokio::task::spawn_blocking(move || extract::extract_archive(&archive_path, &extract_to))
                .await
                .map_err(|err| WorkflowError::ExtractFailed(err.to_string()))??;
            let _ = fs::remove_file(&archive.path);

            let root = install::locate_core_root(&destination);
            let files = install::stage_files(&root, &self.options.exclude)
                .map_err(|err| WorkflowError::ExtractFailed(err.to_string()))?;
            if files.is_empty() {
                return Err(WorkflowError::ExtractFailed(format!(
                    "{} archive contained no installable files",
                    source.label
                )));
            }
            reporter.report(
                phase,
                end,
                format!("Extracted {} file(s) from {}", files.len(), source.label),
            );
            staged.extend(files);
            archives.push(ArchiveDigest {
                label: source.label.to_string(),
                url: source.url.clone(),
                bytes: archive.bytes,
                sha256: archive.sha256.clone(),
            });
        }

        // Install
        let phase = run.enter(Phase::Install)?;
        reporter.report(
            phase,
            85,
            format!("Installing {} file(s) into {}", staged.len(), run.target.display()),
        );
        let report = install::install_files(staged, &run.target, &run.cancel, |done, total, relative| {
            reporter.report(
                phase,
                band(85, 97, done as f64 / total.max(1) as f64),
                format!("Installed {}", relative.display()),
            );
        })
        .await?;

        if report.is_complete() {
            return Ok(InstallOutcome {
                version: run.version.clone(),
                target_dir: run.target.clone(),
                backup_location,
                installed_files: report.placed,
                archives,
                log: Vec::new(),
            });
        }
        if report.cancelled && report.placed.is_empty() && report.failed.is_empty() {
            return Err(WorkflowError::Cancelled(Phase::Install));
        }
        Err(WorkflowError::PartialInstall(PartialInstallReport {
            placed: report.placed,
            failed: report.failed,
            cancelled: report.cancelled,
            backup_location,
        }))
    }

    fn archive_sources(&self, version: &str) -> Vec<ArchiveSource> {
        let mut sources = vec![ArchiveSource {
            label: CORES_LABEL,
            url: self.manifest.archive_url(version),
            file_name: self.manifest.archive_name().to_string(),
        }];
        if let Some(url) = &self.options.core_info_url {
            let file_name = url
                .rsplit('/')
                .next()
                .filter(|name| name.to_ascii_lowercase().ends_with(".zip"))
                .unwrap_or("core-info.zip")
                .to_string();
            sources.push(ArchiveSource {
                label: CORE_INFO_LABEL,
                url: url.clone(),
                file_name,
            });
        }
        sources
    }
}

fn validate_target(target_dir: &Path) -> Result<PathBuf, WorkflowError> {
    if !target_dir.exists() {
        return Err(WorkflowError::invalid_target(target_dir, "directory does not exist"));
    }
    if !target_dir.is_dir() {
        return Err(WorkflowError::invalid_target(target_dir, "not a directory"));
    }
    if !is_writable(target_dir) {
        return Err(WorkflowError::invalid_target(target_dir, "directory is not writable"));
    }
    fs::canonicalize(target_dir)
        .map_err(|err| WorkflowError::invalid_target(target_dir, err.to_string()))
}

/// Splits `[start, end]` evenly across `count` items and returns item `index`'s slice.
fn split_band(start: u8, end: u8, index: usize, count: usize) -> (u8, u8) {
    let count = count.max(1) as f64;
    let from = band(start, end, index as f64 / count);
    let to = band(start, end, (index + 1) as f64 / count);
    (from, to)
}

fn refuse(sink: &dyn ProgressSink, err: &WorkflowError) {
    tracing::warn!(error = %err, "Refused to start core update");
    sink.emit(ProgressEvent {
        percentage: 0,
        message: format!("Update not started: {}", err),
        phase: Phase::Failed,
    });
}

fn summarize_failure(err: &WorkflowError) -> String {
    match err {
        WorkflowError::Cancelled(phase) => format!(
            "Update cancelled before {} finished; installed cores were not modified",
            phase
        ),
        WorkflowError::PartialInstall(report) => format!("Update incomplete: {}", report),
        _ if err.target_untouched() => format!(
            "Update failed: {}. Installed cores were not modified; it is safe to retry.",
            err
        ),
        _ => format!("Update failed: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_refuses_to_move_backwards() {
        let mut run = WorkflowRun {
            id: Uuid::new_v4(),
            version: "1.21.0".to_string(),
            target: PathBuf::from("/cores"),
            tracker: PhaseTracker::new(),
            cancel: CancelToken::new(),
        };

        assert_eq!(run.enter(Phase::Fetch).unwrap(), Phase::Fetch);
        let err = run.enter(Phase::Backup).unwrap_err();
        assert!(matches!(err, WorkflowError::Internal(_)));
        assert_eq!(run.tracker.current(), Phase::Fetch);

        run.cancel.cancel();
        let err = run.enter(Phase::Extract).unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled(Phase::Extract)));
    }

    #[test]
    fn lock_file_sits_beside_target() {
        assert_eq!(
            run_lock_path(Path::new("/deck/RetroArch/cores")),
            PathBuf::from("/deck/RetroArch/.cores.core-updater.lock")
        );
    }

    #[test]
    fn split_band_covers_range_without_gaps() {
        assert_eq!(split_band(10, 70, 0, 1), (10, 70));
        assert_eq!(split_band(10, 70, 0, 2), (10, 40));
        assert_eq!(split_band(10, 70, 1, 2), (40, 70));
    }

    #[test]
    fn core_info_source_is_added_when_enabled() {
        let mut config = UpdaterConfig::default();
        config.core_info.enabled = true;
        let manifest = VersionManifest::new(&config.manifest, vec!["1.21.0".to_string()]);
        let engine = WorkflowEngine::new(manifest, WorkflowOptions::from_config(&config)).unwrap();

        let sources = engine.archive_sources("1.21.0");
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].file_name, "RetroArch_cores.7z");
        assert_eq!(sources[1].label, CORE_INFO_LABEL);
        assert_eq!(sources[1].file_name, "master.zip");
    }

    #[test]
    fn unknown_version_is_refused_with_summary_line() {
        let config = UpdaterConfig::default();
        let manifest = VersionManifest::new(&config.manifest, vec!["1.21.0".to_string()]);
        let engine = WorkflowEngine::new(manifest, WorkflowOptions::from_config(&config)).unwrap();
        let log = EventLog::new();
        let dir = tempfile::TempDir::new().unwrap();

        let err = engine
            .admit("0.0.1", dir.path())
            .map(|_| ())
            .unwrap_err();
        refuse(&log, &err);

        assert!(matches!(err, WorkflowError::UnknownVersion(_)));
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.events()[0].phase, Phase::Failed);
    }
}
