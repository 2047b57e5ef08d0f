//! Image stack worker.
//!
//! Polls the scientific camera and distributes frames between the stacks of
//! the enabled illumination channels: with both channels on, even frames go
//! to `<stem>_led1` and odd frames to `<stem>_led2`.
//!
//! Every frame is checked by a [`FrameLossDetector`]. A skipped hardware
//! sequence stamp means a frame was lost and fails the run immediately; a
//! timestamp interval far from the master period is logged as a warning, or
//! fails the run past the critical threshold.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{
    spawn_worker, StopSignal, TimeoutBudget, WorkerEvent, WorkerHandle, WorkerKind, WorkerOutcome,
};
use crate::config::CameraConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{CameraDevice, FrameWriter, StorageBackend};

/// Result of checking one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameCheck {
    /// Stamp and interval as expected
    OnTime,
    /// Interval off by more than the warning threshold
    Late {
        /// `|interval − period| / period`
        deviation: f64,
    },
}

/// Detects lost and late frames from stamps and device timestamps.
///
/// The camera restarts its sequence stamps at zero when acquisition starts,
/// so frame `n` of a run must carry stamp `n`.
#[derive(Debug, Clone)]
pub struct FrameLossDetector {
    period: f64,
    warn_deviation: f64,
    fail_deviation: f64,
    next_stamp: u64,
    last_timestamp: Option<Duration>,
    checked: u64,
}

impl FrameLossDetector {
    /// Detector for frames expected every `period` seconds.
    pub fn new(period: f64, warn_deviation: f64, fail_deviation: f64) -> Self {
        Self {
            period,
            warn_deviation,
            fail_deviation,
            next_stamp: 0,
            last_timestamp: None,
            checked: 0,
        }
    }

    /// Check the next frame.
    pub fn check(&mut self, stamp: u64, timestamp: Duration) -> AppResult<FrameCheck> {
        let index = self.checked;
        self.checked += 1;

        if stamp != self.next_stamp {
            return Err(DaqError::TimingViolation(format!(
                "lost frame before #{index}: expected stamp {}, camera reported {stamp}",
                self.next_stamp
            )));
        }
        self.next_stamp = stamp.wrapping_add(1);

        let previous = self.last_timestamp.replace(timestamp);
        let Some(previous) = previous else {
            return Ok(FrameCheck::OnTime);
        };
        let interval = timestamp.abs_diff(previous).as_secs_f64();
        let deviation = (interval - self.period).abs() / self.period;
        if deviation > self.fail_deviation {
            return Err(DaqError::TimingViolation(format!(
                "frame #{index} arrived {:.3} ms after the previous one, expected {:.3} ms",
                interval * 1e3,
                self.period * 1e3
            )));
        }
        if deviation > self.warn_deviation {
            return Ok(FrameCheck::Late { deviation });
        }
        Ok(FrameCheck::OnTime)
    }
}

/// Drains the image camera into one or two stacks.
pub struct ImageStackWorker {
    camera: Arc<dyn CameraDevice>,
    storage: Arc<dyn StorageBackend>,
    frame_period: f64,
    poll_timeout: Duration,
    warn_deviation: f64,
    fail_deviation: f64,
    max_consecutive_timeouts: u32,
}

impl ImageStackWorker {
    /// Worker for a camera triggered at `master_frequency`.
    pub fn new(
        camera: Arc<dyn CameraDevice>,
        storage: Arc<dyn StorageBackend>,
        config: &CameraConfig,
        master_frequency: f64,
    ) -> Self {
        Self {
            camera,
            storage,
            frame_period: 1.0 / master_frequency,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            warn_deviation: config.warn_deviation,
            fail_deviation: config.fail_deviation,
            max_consecutive_timeouts: config.max_consecutive_timeouts,
        }
    }

    /// Start polling. `outputs` are the stack stems frames rotate through;
    /// empty means frames are only counted (free run).
    pub fn spawn(
        self,
        run_id: u64,
        expected_total: Option<u64>,
        outputs: Vec<PathBuf>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> WorkerHandle {
        spawn_worker(WorkerKind::ImageStack, run_id, expected_total, events, move |stop| {
            self.run(expected_total, outputs, stop)
        })
    }

    async fn run(
        self,
        expected_total: Option<u64>,
        outputs: Vec<PathBuf>,
        mut stop: StopSignal,
    ) -> WorkerOutcome {
        let mut writers: Vec<Box<dyn FrameWriter>> = Vec::with_capacity(outputs.len());
        for stem in &outputs {
            match self.storage.open_stack(stem) {
                Ok(writer) => writers.push(writer),
                Err(e) => {
                    return WorkerOutcome {
                        produced: 0,
                        result: Err(e),
                    }
                }
            }
        }

        let mut detector =
            FrameLossDetector::new(self.frame_period, self.warn_deviation, self.fail_deviation);
        let mut timeouts = TimeoutBudget::new("image camera", self.max_consecutive_timeouts);
        let mut produced: u64 = 0;

        let mut result: AppResult<()> = loop {
            if expected_total.is_some_and(|n| produced >= n) {
                break Ok(());
            }
            let polled = tokio::select! {
                biased;
                _ = stop.stopped() => break Ok(()),
                polled = self.camera.next_frame(self.poll_timeout) => polled,
            };
            let frame = match polled {
                Ok(frame) => frame,
                Err(e @ DaqError::TransientTimeout { .. }) => match timeouts.record(&e) {
                    Ok(()) => continue,
                    Err(escalated) => break Err(escalated),
                },
                Err(e) => break Err(e),
            };
            timeouts.reset();

            match detector.check(frame.sequence_stamp, frame.device_timestamp) {
                Ok(FrameCheck::OnTime) => {}
                Ok(FrameCheck::Late { deviation }) => warn!(
                    "Frame #{produced} interval off by {:.0}% of the master period",
                    deviation * 100.0
                ),
                Err(e) => {
                    error!("Critical frame loss at #{produced}: {e}");
                    break Err(e);
                }
            }

            if !writers.is_empty() {
                let slot = (produced % writers.len() as u64) as usize;
                if let Err(e) = writers[slot].write(&frame) {
                    break Err(e);
                }
            }
            produced += 1;
            if produced % 1000 == 0 {
                debug!("Image stack at {produced} frames");
            }
        };

        for writer in &mut writers {
            if let Err(e) = writer.close() {
                error!("Failed to close image stack: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        match expected_total {
            Some(n) => info!("Saved {produced}/{n} frames into {} stack(s)", outputs.len()),
            None => info!("Displayed {produced} frames"),
        }

        WorkerOutcome { produced, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::{CameraDriver, TriggerTask, TriggerTaskFactory};
    use crate::hardware::mock::{
        MockCameraConfig, MockCameraDriver, MockStorage, MockTriggerConfig, MockTriggerFactory,
        TaskTrace, TriggerLine,
    };
    use crate::trigger_graph::{
        IdleLevel, SampleMode, TaskKind, TaskTiming, TriggerSource, TriggerTaskSpec,
    };
    use tracing_test::traced_test;

    const PERIOD: f64 = 0.02;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_contiguous_frames_pass() {
        let mut detector = FrameLossDetector::new(PERIOD, 0.75, 1.0);
        for i in 0..5 {
            assert_eq!(detector.check(i, ms(20 * i)).unwrap(), FrameCheck::OnTime);
        }
    }

    #[test]
    fn test_stamp_gap_of_two_is_fatal() {
        let mut detector = FrameLossDetector::new(PERIOD, 0.75, 1.0);
        detector.check(0, ms(0)).unwrap();
        detector.check(1, ms(20)).unwrap();
        let err = detector.check(3, ms(40)).unwrap_err();
        assert!(matches!(err, DaqError::TimingViolation(_)));
    }

    #[test]
    fn test_missing_first_frame_is_fatal() {
        let mut detector = FrameLossDetector::new(PERIOD, 0.75, 1.0);
        let err = detector.check(1, ms(40)).unwrap_err();
        assert!(matches!(err, DaqError::TimingViolation(ref m) if m.contains("before #0")));
    }

    #[test]
    fn test_stamp_at_counter_limit_wraps() {
        let mut detector = FrameLossDetector {
            next_stamp: u64::MAX,
            ..FrameLossDetector::new(PERIOD, 0.75, 1.0)
        };
        detector.check(u64::MAX, ms(0)).unwrap();
        detector.check(0, ms(20)).unwrap();
    }

    #[test]
    fn test_backwards_timestamp_is_fatal() {
        let mut detector = FrameLossDetector::new(PERIOD, 0.75, 1.0);
        detector.check(0, ms(100)).unwrap();
        // 30 ms before the previous frame: 250% off the period
        assert!(detector.check(1, ms(70)).is_err());
    }

    #[test]
    fn test_interval_thresholds() {
        let mut detector = FrameLossDetector::new(PERIOD, 0.75, 1.0);
        detector.check(0, ms(0)).unwrap();
        // 80% over the period: warning only
        match detector.check(1, ms(36)).unwrap() {
            FrameCheck::Late { deviation } => assert!((deviation - 0.8).abs() < 1e-9),
            other => panic!("expected a late frame, got {other:?}"),
        }
        // 150% over: critical
        assert!(detector.check(2, ms(86)).is_err());
    }

    async fn rig(config: MockCameraConfig) -> (Arc<dyn CameraDevice>, MockTriggerFactory) {
        let trace = TaskTrace::default();
        let line = TriggerLine::new();
        let camera = MockCameraDriver::new(config, trace.clone(), line.clone())
            .open(0)
            .await
            .unwrap();
        camera.start_acquisition().await.unwrap();
        let factory = MockTriggerFactory::new(trace, line, MockTriggerConfig::default());
        (camera, factory)
    }

    async fn fire_master(factory: &MockTriggerFactory) -> Box<dyn TriggerTask> {
        let spec = TriggerTaskSpec {
            name: "master".into(),
            channel: "ao0".into(),
            kind: TaskKind::AnalogOutput,
            trigger_source: TriggerSource::None,
            phase_delay: 0.0,
            timing: TaskTiming::Frequency {
                frequency: 1.0 / PERIOD,
                duty: 0.5,
            },
            sample_mode: SampleMode::Finite { pulse_count: 100 },
            idle_level: IdleLevel::Low,
            inverted: false,
            shares_generator_of: None,
            samples: None,
        };
        let mut master = factory.create(&spec).await.unwrap();
        master.start().await.unwrap();
        master
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_alternate_between_stacks() {
        let (camera, factory) = rig(MockCameraConfig::image("cam")).await;
        let storage = MockStorage::default();
        let worker = ImageStackWorker::new(
            camera,
            Arc::new(storage.clone()),
            &CameraConfig::default(),
            1.0 / PERIOD,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let led1 = PathBuf::from("/out/run_led1");
        let led2 = PathBuf::from("/out/run_led2");
        let _master = fire_master(&factory).await;

        let mut handle = worker.spawn(1, Some(5), vec![led1.clone(), led2.clone()], tx);
        let event = rx.recv().await.unwrap();
        handle.join(Duration::from_secs(1)).await;

        assert!(event.ok);
        assert_eq!(event.produced, 5);
        assert_eq!(storage.stack(&led1), Some(vec![0, 2, 4]));
        assert_eq!(storage.stack(&led2), Some(vec![1, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_frame_fails_the_worker() {
        let mut config = MockCameraConfig::image("cam");
        config.skip_stamp_at = Some(3);
        let (camera, factory) = rig(config).await;
        let storage = MockStorage::default();
        let worker = ImageStackWorker::new(
            camera,
            Arc::new(storage.clone()),
            &CameraConfig::default(),
            1.0 / PERIOD,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _master = fire_master(&factory).await;

        let _handle = worker.spawn(1, Some(10), vec![PathBuf::from("/out/run")], tx);
        let event = rx.recv().await.unwrap();
        assert!(!event.ok);
        assert_eq!(event.produced, 3);
        assert!(event.failure.unwrap().contains("lost frame"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_late_frame_only_warns() {
        let mut config = MockCameraConfig::image("cam");
        config.late_frame = Some((2, 0.8));
        let (camera, factory) = rig(config).await;
        let worker = ImageStackWorker::new(
            camera,
            Arc::new(MockStorage::default()),
            &CameraConfig::default(),
            1.0 / PERIOD,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _master = fire_master(&factory).await;

        let _handle = worker.spawn(1, Some(5), vec![PathBuf::from("/out/run")], tx);
        let event = rx.recv().await.unwrap();
        assert!(event.ok);
        assert!(logs_contain("interval off by 80%"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_quota_reports_not_ok() {
        let (camera, _factory) = rig(MockCameraConfig::image("cam")).await;
        let worker = ImageStackWorker::new(
            camera,
            Arc::new(MockStorage::default()),
            &CameraConfig::default(),
            1.0 / PERIOD,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Master never fires: the worker only sees timeouts until stopped.
        let handle = worker.spawn(1, Some(5), Vec::new(), tx);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.stop();

        let event = rx.recv().await.unwrap();
        assert!(!event.ok);
        assert_eq!(event.produced, 0);
        assert!(event.failure.is_none());
    }
}
