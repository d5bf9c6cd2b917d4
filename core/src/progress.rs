//! Progress reporting sink (spec §4.7 step g: "emit progress every 100
//! records"). A thin interface so the CLI shell can render a progress bar
//! without the importer depending on any particular UI.

use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    FileStarted { path: String },
    RecordsProcessed { path: String, count: u64 },
    FileFinished { path: String, added: usize, duplicates: usize, rejected: usize },
    CommitStarted,
    CommitFinished,
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Default sink: discards every event. Used by tests and by callers that
/// don't care about progress.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}

/// Logs each event at `info` (file boundaries) or `debug` (record counts),
/// the way the CLI shell wires progress by default.
pub struct LoggingProgressSink;

impl ProgressSink for LoggingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::FileStarted { path } => log::info!("importing {path}"),
            ProgressEvent::RecordsProcessed { path, count } => log::debug!("{path}: {count} records processed"),
            ProgressEvent::FileFinished { path, added, duplicates, rejected } => {
                log::info!("{path}: {added} added, {duplicates} duplicates, {rejected} rejected")
            }
            ProgressEvent::CommitStarted => log::info!("committing repository changes"),
            ProgressEvent::CommitFinished => log::info!("commit complete"),
        }
    }
}

pub fn null_sink() -> Arc<dyn ProgressSink> {
    Arc::new(NullProgressSink)
}
