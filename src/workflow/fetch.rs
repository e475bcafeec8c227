use std::fs;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::time::{timeout, Instant};

use super::cancel::CancelToken;
use super::phase::Phase;
use crate::core::errors::WorkflowError;

const CANCEL_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub(crate) struct DownloadedArchive {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Streams `url` into `destination`. The body lands in `<destination>.part`
/// first and is only renamed once its length checks out.
pub(crate) async fn download_archive(
    client: &Client,
    url: &str,
    destination: &Path,
    idle_timeout: Duration,
    cancel: &CancelToken,
    mut progress_cb: impl FnMut(u64, Option<u64>),
) -> Result<DownloadedArchive, WorkflowError> {
    let partial = part_path(destination);
    let result = stream_to_file(
        client,
        url,
        &partial,
        idle_timeout,
        cancel,
        &mut progress_cb,
    )
    .await;

    let (bytes, sha256) = match result {
        Ok(done) => done,
        Err(err) => {
            let _ = fs::remove_file(&partial);
            return Err(err);
        }
    };

    if destination.exists() {
        let _ = fs::remove_file(destination);
    }
    if let Err(err) = fs::rename(&partial, destination) {
        let _ = fs::remove_file(&partial);
        return Err(WorkflowError::internal(format!(
            "cannot move download into place: {}",
            err
        )));
    }

    Ok(DownloadedArchive {
        path: destination.to_path_buf(),
        bytes,
        sha256,
    })
}

async fn stream_to_file(
    client: &Client,
    url: &str,
    partial: &Path,
    idle_timeout: Duration,
    cancel: &CancelToken,
    progress_cb: &mut impl FnMut(u64, Option<u64>),
) -> Result<(u64, String), WorkflowError> {
    let idle_secs = idle_timeout.as_secs().max(1);
    let timed_out = || WorkflowError::DownloadTimedOut {
        url: url.to_string(),
        idle_secs,
    };
    let incomplete = |detail: String| WorkflowError::DownloadIncomplete {
        url: url.to_string(),
        detail,
    };

    let request = client
        .get(url)
        .header(header::ACCEPT, "application/octet-stream")
        .send();
    let response = match wait_idle(request, idle_timeout, cancel).await {
        Wait::Cancelled => return Err(WorkflowError::Cancelled(Phase::Fetch)),
        Wait::TimedOut => return Err(timed_out()),
        Wait::Ready(Err(err)) if err.is_timeout() => return Err(timed_out()),
        Wait::Ready(Err(err)) => return Err(incomplete(err.to_string())),
        Wait::Ready(Ok(response)) => response,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(incomplete(format!("server returned {}", status)));
    }

    let expected = response.content_length();
    let mut stream = response.bytes_stream();
    let mut file = fs::File::create(partial)
        .map_err(|err| incomplete(format!("cannot create {}: {}", partial.display(), err)))?;
    let mut downloaded: u64 = 0;
    let mut hasher = Sha256::new();

    loop {
        let chunk = match wait_idle(stream.next(), idle_timeout, cancel).await {
            Wait::Cancelled => return Err(WorkflowError::Cancelled(Phase::Fetch)),
            Wait::TimedOut => return Err(timed_out()),
            Wait::Ready(None) => break,
            Wait::Ready(Some(Err(err))) if err.is_timeout() => return Err(timed_out()),
            Wait::Ready(Some(Err(err))) => {
                return Err(incomplete(format!(
                    "connection failed after {} bytes: {}",
                    downloaded, err
                )))
            }
            Wait::Ready(Some(Ok(chunk))) => chunk,
        };

        file.write_all(&chunk)
            .map_err(|err| incomplete(format!("write failed after {} bytes: {}", downloaded, err)))?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
        progress_cb(downloaded, expected);
    }

    file.flush()
        .map_err(|err| incomplete(format!("flush failed: {}", err)))?;

    if let Some(expected) = expected {
        if downloaded != expected {
            return Err(incomplete(format!(
                "received {} of {} bytes",
                downloaded, expected
            )));
        }
    }

    Ok((downloaded, hex::encode(hasher.finalize())))
}

enum Wait<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Awaits `fut` until it resolves, `idle_timeout` passes with nothing, or the
/// run is cancelled. A stalled server therefore never delays cancellation.
async fn wait_idle<F: Future>(fut: F, idle_timeout: Duration, cancel: &CancelToken) -> Wait<F::Output> {
    tokio::pin!(fut);
    let deadline = Instant::now() + idle_timeout;
    loop {
        if cancel.is_cancelled() {
            return Wait::Cancelled;
        }
        let now = Instant::now();
        if now >= deadline {
            return Wait::TimedOut;
        }
        let slice = (deadline - now).min(CANCEL_POLL);
        if let Ok(output) = timeout(slice, fut.as_mut()).await {
            return Wait::Ready(output);
        }
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}
