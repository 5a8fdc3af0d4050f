//! Resolution progress reporting.
//!
//! The pipeline emits `{stage, percent, detail}` events through a
//! [`ProgressSink`]. The CLI sinks write to **stderr** so stdout remains
//! parseable for scripts; encoding events into any other transport is left
//! to whoever implements the trait.

use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;

/// Stage of a resolution job, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extracting,
    Channels,
    Resolving,
    Fetching,
    Inferring,
    Locating,
    Downloading,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extracting => "extracting",
            Stage::Channels => "channels",
            Stage::Resolving => "resolving",
            Stage::Fetching => "fetching",
            Stage::Inferring => "inferring",
            Stage::Locating => "locating",
            Stage::Downloading => "downloading",
            Stage::Complete => "complete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    /// 0..=100
    pub percent: u8,
    pub detail: String,
}

impl ProgressEvent {
    pub fn new(stage: Stage, percent: u8, detail: impl Into<String>) -> Self {
        Self {
            stage,
            percent: percent.min(100),
            detail: detail.into(),
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "[ 40%] fetching  cloning 2 / 5 repositories".
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = format!(
            "[{:>3}%] {:<11} {}\n",
            event.percent,
            event.stage.as_str(),
            event.detail
        );
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressSink for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "stage": event.stage,
            "percent": event.percent,
            "detail": event.detail,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op sink when progress is disabled.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct CollectingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ProgressSink for CollectingProgress {
    fn report(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// Percentage of `done` within the span `start..end`.
pub fn scaled(start: u8, end: u8, done: usize, total: usize) -> u8 {
    if total == 0 || end <= start {
        return end;
    }
    let span = (end - start) as usize;
    start + (span * done.min(total) / total) as u8
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn sink(&self) -> Box<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_stays_in_span() {
        assert_eq!(scaled(50, 70, 0, 4), 50);
        assert_eq!(scaled(50, 70, 2, 4), 60);
        assert_eq!(scaled(50, 70, 4, 4), 70);
        assert_eq!(scaled(50, 70, 9, 4), 70);
        assert_eq!(scaled(50, 70, 0, 0), 70);
    }

    #[test]
    fn percent_is_clamped_and_collected() {
        let sink = CollectingProgress::new();
        sink.report(ProgressEvent::new(Stage::Complete, 150, "done"));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].percent, 100);
        assert_eq!(events[0].stage.as_str(), "complete");
    }
}
