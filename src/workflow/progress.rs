use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use super::phase::Phase;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub percentage: u8,
    pub message: String,
    pub phase: Phase,
}

/// Receiver side of a run's progress stream. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching anymore.
        let _ = self.send(event);
    }
}

/// Sink that keeps every event in memory, for callers that poll.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.message).collect()
    }
}

impl ProgressSink for EventLog {
    fn emit(&self, event: ProgressEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Per-run front for a sink: keeps the percentage non-decreasing and
/// records every line so the outcome can carry the run's log.
pub(crate) struct ProgressReporter<'a> {
    sink: &'a dyn ProgressSink,
    percentage: u8,
    lines: Vec<String>,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            percentage: 0,
            lines: Vec::new(),
        }
    }

    pub(crate) fn report(&mut self, phase: Phase, percentage: u8, message: impl Into<String>) {
        let message = message.into();
        self.percentage = self.percentage.max(percentage.min(100));
        tracing::info!(phase = %phase, percent = self.percentage, "{}", message);
        self.lines.push(message.clone());
        self.sink.emit(ProgressEvent {
            percentage: self.percentage,
            message,
            phase,
        });
    }

    /// Log line at the current percentage.
    pub(crate) fn log(&mut self, phase: Phase, message: impl Into<String>) {
        self.report(phase, self.percentage, message);
    }

    pub(crate) fn percentage(&self) -> u8 {
        self.percentage
    }

    pub(crate) fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// Maps a 0.0..=1.0 fraction into the `[start, end]` percentage band.
pub(crate) fn band(start: u8, end: u8, fraction: f64) -> u8 {
    let fraction = fraction.clamp(0.0, 1.0);
    let span = f64::from(end.saturating_sub(start));
    start + (span * fraction).floor() as u8
}

pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} TB", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_never_lowers_percentage() {
        let log = EventLog::new();
        let mut reporter = ProgressReporter::new(&log);
        reporter.report(Phase::Backup, 10, "backed up");
        reporter.report(Phase::Fetch, 5, "late byte count");
        reporter.report(Phase::Fetch, 40, "halfway");
        reporter.log(Phase::Fetch, "note");

        let percents: Vec<u8> = log.events().iter().map(|e| e.percentage).collect();
        assert_eq!(percents, vec![10, 10, 40, 40]);
        assert_eq!(reporter.into_lines().len(), 4);
    }

    #[test]
    fn band_maps_fraction_into_range() {
        assert_eq!(band(10, 70, 0.0), 10);
        assert_eq!(band(10, 70, 0.5), 40);
        assert_eq!(band(10, 70, 1.0), 70);
        assert_eq!(band(10, 70, 3.0), 70);
    }

    #[test]
    fn format_bytes_picks_unit() {
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(50_000_000), "47.7 MB");
    }
}
