//! The output-builder collaborator boundary: the engine reports exit
//! status, kill signal, and listener metrics through this trait. Its wire
//! format and rendering are owned elsewhere -- this crate only defines the
//! seam and a minimal in-memory implementation used by the demo binary and
//! the tests.

use std::collections::BTreeMap;

pub trait OutputSink {
    fn set_exit_status(&mut self, status: i32);
    fn set_kill_signal(&mut self, signal: i32);
    fn record_metric(&mut self, name: &str, value: i64);
}

/// A minimal `OutputSink` that just remembers what it was told. Good
/// enough for the demo binary and for asserting engine behavior in tests;
/// a real judging pipeline's human-readable verdict formatting lives
/// outside this crate.
#[derive(Debug, Default, Clone)]
pub struct BasicOutputSink {
    pub exit_status: Option<i32>,
    pub kill_signal: Option<i32>,
    pub metrics: BTreeMap<String, i64>,
}

impl OutputSink for BasicOutputSink {
    fn set_exit_status(&mut self, status: i32) {
        self.exit_status = Some(status);
    }

    fn set_kill_signal(&mut self, signal: i32) {
        self.kill_signal = Some(signal);
    }

    fn record_metric(&mut self, name: &str, value: i64) {
        self.metrics.insert(name.to_string(), value);
    }
}
