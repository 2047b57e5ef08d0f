//! Behavior video worker.
//!
//! Polls the behavior camera, appends every frame to the video file and
//! forwards at most `preview_fps` frames per second to the live preview. In
//! free run there is no file and no frame limit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{error, info};

use super::{
    spawn_worker, StopSignal, TimeoutBudget, WorkerEvent, WorkerHandle, WorkerKind, WorkerOutcome,
};
use crate::config::BehaviorConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{CameraDevice, Frame, FrameWriter, StorageBackend};

/// Lets one frame through per interval.
#[derive(Debug, Clone)]
pub struct PreviewThrottle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl PreviewThrottle {
    /// Throttle to at most `fps` frames per second; zero or less disables
    /// throttling.
    pub fn new(fps: f64) -> Self {
        let min_interval = if fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            last: None,
        }
    }

    /// Whether a frame arriving at `now` should be shown.
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Drains the behavior camera into a video file.
pub struct BehaviorVideoWorker {
    camera: Arc<dyn CameraDevice>,
    storage: Arc<dyn StorageBackend>,
    frame_rate: f64,
    poll_timeout: Duration,
    preview_fps: f64,
    max_consecutive_timeouts: u32,
    preview: Option<broadcast::Sender<Arc<Frame>>>,
}

impl BehaviorVideoWorker {
    /// Worker for a behavior camera configured by `config`.
    pub fn new(
        camera: Arc<dyn CameraDevice>,
        storage: Arc<dyn StorageBackend>,
        config: &BehaviorConfig,
        max_consecutive_timeouts: u32,
    ) -> Self {
        Self {
            camera,
            storage,
            frame_rate: config.frame_rate,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            preview_fps: config.preview_fps,
            max_consecutive_timeouts,
            preview: None,
        }
    }

    /// Publish throttled frames on `preview`.
    pub fn with_preview(mut self, preview: broadcast::Sender<Arc<Frame>>) -> Self {
        self.preview = Some(preview);
        self
    }

    /// Start polling. `output` is the video stem; `None` in free run.
    pub fn spawn(
        self,
        run_id: u64,
        expected_total: Option<u64>,
        output: Option<PathBuf>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> WorkerHandle {
        spawn_worker(WorkerKind::BehaviorVideo, run_id, expected_total, events, move |stop| {
            self.run(expected_total, output, stop)
        })
    }

    async fn run(
        self,
        expected_total: Option<u64>,
        output: Option<PathBuf>,
        mut stop: StopSignal,
    ) -> WorkerOutcome {
        let mut writer: Option<Box<dyn FrameWriter>> = match &output {
            Some(stem) => match self.storage.open_video(stem, self.frame_rate) {
                Ok(writer) => Some(writer),
                Err(e) => {
                    return WorkerOutcome {
                        produced: 0,
                        result: Err(e),
                    }
                }
            },
            None => None,
        };
        let mut throttle = PreviewThrottle::new(self.preview_fps);
        let mut timeouts = TimeoutBudget::new("behavior camera", self.max_consecutive_timeouts);
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

            if let Some(writer) = writer.as_mut() {
                if let Err(e) = writer.write(&frame) {
                    break Err(e);
                }
            }
            produced += 1;

            if let Some(preview) = &self.preview {
                if throttle.admit(Instant::now()) && preview.receiver_count() > 0 {
                    let _ = preview.send(Arc::new(frame));
                }
            }
        };

        if let Some(writer) = writer.as_mut() {
            if let Err(e) = writer.close() {
                error!("Failed to close behavior video: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
            info!("Recorded {produced} behavior frames");
        }

        WorkerOutcome { produced, result }
    }
}
