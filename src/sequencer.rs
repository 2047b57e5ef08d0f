//! Multi-run batch sequencing and output naming.
//!
//! A batch is started by a user `start()`. After each run finalizes the
//! controller asks [`RunSequencer::advance`] whether another run follows.
//! `multi_run_stop()` sets a stop flag that stays set until the next batch
//! begins, so no further run is scheduled even if the current one was already
//! finishing.

use std::path::{Path, PathBuf};

use crate::timing::MultiRun;

/// Append `suffix` to the file name of `stem` without touching any dot
/// already in it.
pub fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// `<base>/<run name>` for a single run, `<base>/<run name>_NNNNN` inside a
/// batch.
pub fn output_stem(base: &Path, run_name: &str, index: Option<u32>) -> PathBuf {
    match index {
        Some(index) => base.join(format!("{run_name}_{index:05}")),
        None => base.join(run_name),
    }
}

/// Position within the current batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSequencer {
    enabled: bool,
    count: u32,
    index: u32,
    stop_requested: bool,
}

impl RunSequencer {
    /// Idle sequencer; no batch is active.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new batch started by the user.
    pub fn begin_batch(&mut self, multi_run: MultiRun) {
        self.enabled = multi_run.enabled;
        self.count = multi_run.count.max(1);
        self.index = 0;
        self.stop_requested = false;
    }

    /// Forget the batch (free run, uninitialize).
    pub fn end_batch(&mut self) {
        self.enabled = false;
        self.index = 0;
    }

    /// Whether the current batch repeats.
    pub fn is_multi_run(&self) -> bool {
        self.enabled
    }

    /// Zero-based index of the current run.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Batch index used for output naming; `None` outside multi-run.
    pub fn naming_index(&self) -> Option<u32> {
        self.enabled.then_some(self.index)
    }

    /// Number of runs in the batch.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Sticky for the rest of the batch.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Whether `multi_run_stop()` was called during this batch.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Move to the next run, if the batch has one left.
    pub fn advance(&mut self) -> Option<u32> {
        if !self.enabled || self.stop_requested || self.index + 1 >= self.count {
            return None;
        }
        self.index += 1;
        Some(self.index)
    }
}
