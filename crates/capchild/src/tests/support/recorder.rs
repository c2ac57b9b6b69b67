//! Test double for [`CaptureEvents`] that records every callback.

use std::sync::{Arc, Mutex};

use crate::dispatcher::CaptureEvents;

/// Callbacks observed during a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    NewFile(String),
    Packets(u64),
    Drops(u64, Option<String>),
    Error(String, Option<String>),
    CFilterError(u32, String),
    Closed(Option<String>),
}

/// Records callbacks into a log shared by every clone.
#[derive(Debug, Clone)]
pub struct RecordingEvents {
    log: Arc<Mutex<Vec<RecordedEvent>>>,
    accept_files: bool,
}

impl Default for RecordingEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            accept_files: true,
        }
    }

    /// A recorder whose `new_file` callback asks the session to stop.
    pub fn rejecting() -> Self {
        Self {
            accept_files: false,
            ..Self::new()
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.log.lock().expect("event log poisoned").clone()
    }

    pub fn closed_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, RecordedEvent::Closed(_)))
            .count()
    }

    fn record(&self, event: RecordedEvent) {
        self.log.lock().expect("event log poisoned").push(event);
    }
}

impl CaptureEvents for RecordingEvents {
    fn new_file(&mut self, path: &str) -> bool {
        self.record(RecordedEvent::NewFile(path.to_owned()));
        self.accept_files
    }

    fn new_packets(&mut self, count: u64) {
        self.record(RecordedEvent::Packets(count));
    }

    fn drops(&mut self, count: u64, interface: Option<&str>) {
        self.record(RecordedEvent::Drops(count, interface.map(str::to_owned)));
    }

    fn error(&mut self, primary: &str, secondary: Option<&str>) {
        self.record(RecordedEvent::Error(
            primary.to_owned(),
            secondary.map(str::to_owned),
        ));
    }

    fn cfilter_error(&mut self, index: u32, message: &str) {
        self.record(RecordedEvent::CFilterError(index, message.to_owned()));
    }

    fn closed(&mut self, diagnostic: Option<&str>) {
        self.record(RecordedEvent::Closed(diagnostic.map(str::to_owned)));
    }
}
