//! Electrode log worker.
//!
//! Wakes every poll interval, reads whatever the analog input buffered and
//! appends it to one contiguous trace. Reads are sized from the expected
//! per-interval count with headroom so a late wake-up drains the backlog. The
//! final chunk is trimmed so a timed run stores exactly its expected number of
//! samples. A decimated copy of every chunk goes to the live preview.
//!
//! In free run nothing is accumulated or saved; samples only feed the
//! preview.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error};

use super::{
    spawn_worker, StopSignal, TimeoutBudget, WorkerEvent, WorkerHandle, WorkerKind, WorkerOutcome,
};
use crate::config::ElectrodeConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{AnalogInputDevice, StorageBackend};

/// Reads may return up to this many intervals' worth of samples.
const READ_HEADROOM: usize = 3;

/// Keeps every `stride`-th sample across chunk boundaries.
#[derive(Debug, Clone)]
pub struct Decimator {
    stride: usize,
    phase: usize,
}

impl Decimator {
    /// Decimator from `sample_rate` down to roughly `preview_rate`.
    pub fn new(sample_rate: f64, preview_rate: f64) -> Self {
        let stride = if preview_rate > 0.0 {
            (sample_rate / preview_rate).round().max(1.0) as usize
        } else {
            1
        };
        Self { stride, phase: 0 }
    }

    /// Decimation factor.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Decimate one chunk, continuing where the previous chunk ended.
    pub fn decimate(&mut self, chunk: &[f64]) -> Vec<f64> {
        let skip = (self.stride - self.phase) % self.stride;
        let kept = chunk.iter().skip(skip).step_by(self.stride).copied().collect();
        self.phase = (self.phase + chunk.len()) % self.stride;
        kept
    }
}

/// Drains the electrode input.
pub struct ElectrodeLogWorker {
    input: Arc<dyn AnalogInputDevice>,
    storage: Arc<dyn StorageBackend>,
    sample_rate: f64,
    poll_interval: Duration,
    preview_rate: f64,
    max_consecutive_timeouts: u32,
    preview: Option<broadcast::Sender<Arc<Vec<f64>>>>,
}

impl ElectrodeLogWorker {
    /// Worker reading `input` at `sample_rate`.
    pub fn new(
        input: Arc<dyn AnalogInputDevice>,
        storage: Arc<dyn StorageBackend>,
        config: &ElectrodeConfig,
        sample_rate: f64,
        max_consecutive_timeouts: u32,
    ) -> Self {
        Self {
            input,
            storage,
            sample_rate,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            preview_rate: config.preview_rate,
            max_consecutive_timeouts,
            preview: None,
        }
    }

    /// Publish decimated chunks on `preview`.
    pub fn with_preview(mut self, preview: broadcast::Sender<Arc<Vec<f64>>>) -> Self {
        self.preview = Some(preview);
        self
    }

    /// Samples read per poll.
    pub fn read_size(&self) -> usize {
        let per_interval = (self.sample_rate * self.poll_interval.as_secs_f64()).ceil() as usize;
        per_interval.max(1) * READ_HEADROOM
    }

    /// Start polling. `output` is where the trace is saved; `None` in free run.
    pub fn spawn(
        self,
        run_id: u64,
        expected_total: Option<u64>,
        output: Option<PathBuf>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> WorkerHandle {
        spawn_worker(WorkerKind::ElectrodeLog, run_id, expected_total, events, move |stop| {
            self.run(expected_total, output, stop)
        })
    }

    async fn run(
        self,
        expected_total: Option<u64>,
        output: Option<PathBuf>,
        mut stop: StopSignal,
    ) -> WorkerOutcome {
        let read_size = self.read_size();
        let mut decimator = Decimator::new(self.sample_rate, self.preview_rate);
        let mut timeouts = TimeoutBudget::new("electrode input", self.max_consecutive_timeouts);
        let mut trace: Vec<f64> = Vec::new();
        if output.is_some() {
            trace.reserve(expected_total.unwrap_or(0) as usize);
        }
        let mut produced: u64 = 0;

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut result: AppResult<()> = loop {
            if expected_total.is_some_and(|n| produced >= n) {
                break Ok(());
            }
            tokio::select! {
                biased;
                _ = stop.stopped() => break Ok(()),
                _ = ticker.tick() => {}
            }

            let mut chunk = match self.input.read_available(read_size, self.poll_interval).await {
                Ok(chunk) => chunk,
                Err(e @ DaqError::TransientTimeout { .. }) => match timeouts.record(&e) {
                    Ok(()) => continue,
                    Err(escalated) => break Err(escalated),
                },
                Err(e) => break Err(e),
            };
            timeouts.reset();

            if let Some(n) = expected_total {
                let room = usize::try_from(n - produced).unwrap_or(usize::MAX);
                chunk.truncate(room);
            }
            if chunk.is_empty() {
                continue;
            }

            if let Some(preview) = &self.preview {
                let decimated = decimator.decimate(&chunk);
                if preview.receiver_count() > 0 && !decimated.is_empty() {
                    let _ = preview.send(Arc::new(decimated));
                }
            }
            produced += chunk.len() as u64;
            if output.is_some() {
                trace.extend_from_slice(&chunk);
            }
        };

        if let Some(stem) = &output {
            match self.storage.save_samples(stem, self.sample_rate, &trace) {
                Ok(path) => debug!("Electrode trace at '{}'", path.display()),
                Err(e) => {
                    error!("Failed to save electrode trace: {e}");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        WorkerOutcome { produced, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockAnalogInput, MockStorage, TaskTrace, TriggerLine};
    use crate::trigger_graph::TriggerSource;

    #[test]
    fn test_decimator_keeps_phase_across_chunks() {
        let mut decimator = Decimator::new(10_000.0, 1000.0);
        assert_eq!(decimator.stride(), 10);
        let samples: Vec<f64> = (0..25).map(f64::from).collect();

        let first = decimator.decimate(&samples[..13]);
        let second = decimator.decimate(&samples[13..]);
        assert_eq!(first, vec![0.0, 10.0]);
        assert_eq!(second, vec![20.0]);
    }

    #[test]
    fn test_read_size_has_headroom() {
        let worker = ElectrodeLogWorker::new(
            Arc::new(MockAnalogInput::new(TaskTrace::default(), TriggerLine::new())),
            Arc::new(MockStorage::default()),
            &ElectrodeConfig::default(),
            10_000.0,
            10,
        );
        // 1500 samples per 150 ms interval, three intervals of headroom
        assert_eq!(worker.read_size(), 4500);
    }

    async fn armed_input(line: &TriggerLine, rate: f64) -> Arc<MockAnalogInput> {
        let input = Arc::new(MockAnalogInput::new(TaskTrace::default(), line.clone()));
        input
            .configure("ai0", rate, 2.0, TriggerSource::Master)
            .await
            .unwrap();
        input.arm().await.unwrap();
        input
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_trace_is_trimmed_to_expected_count() {
        let line = TriggerLine::new();
        let input = armed_input(&line, 1000.0).await;
        let storage = MockStorage::default();
        let (preview_tx, mut preview_rx) = broadcast::channel(64);
        let worker = ElectrodeLogWorker::new(
            input,
            Arc::new(storage.clone()),
            &ElectrodeConfig::default(),
            1000.0,
            10,
        )
        .with_preview(preview_tx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stem = PathBuf::from("/out/run_electrode");

        let _handle = worker.spawn(1, Some(1000), Some(stem.clone()), tx);
        line.fire(50.0);

        let event = rx.recv().await.unwrap();
        assert!(event.ok);
        assert_eq!(event.produced, 1000);
        assert_eq!(storage.samples(&stem).unwrap().len(), 1000);
        assert!(preview_rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_run_never_persists() {
        let line = TriggerLine::new();
        let input = armed_input(&line, 1000.0).await;
        let storage = MockStorage::default();
        let worker = ElectrodeLogWorker::new(
            input,
            Arc::new(storage.clone()),
            &ElectrodeConfig::default(),
            1000.0,
            10,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = worker.spawn(1, None, None, tx);
        line.fire(50.0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.stop();

        let event = rx.recv().await.unwrap();
        assert!(event.produced >= 1800);
        assert!(storage.samples(&PathBuf::from("/out/run_electrode")).is_none());
    }
}
