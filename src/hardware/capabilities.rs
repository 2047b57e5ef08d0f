//! Device capability traits.
//!
//! The run core never talks to a vendor SDK. Each kind of device a run needs
//! is reached through one of the narrow async traits below, and driver crates
//! (or the simulated devices in [`super::mock`]) implement them.
//!
//! # Capabilities
//!
//! - [`CameraDriver`] / [`CameraDevice`]: a polled frame source with a hardware
//!   sequence stamp and timestamp per frame
//! - [`TriggerTaskFactory`] / [`TriggerTask`]: hardware-timed output tasks
//!   (pulse generators, analog and digital waveforms)
//! - [`AnalogInputDevice`]: a buffered, trigger-started analog input
//! - [`StorageBackend`] / [`FrameWriter`]: persistent sinks for frames, sample
//!   traces and run metadata
//!
//! A poll that simply ran out of time returns
//! [`DaqError::TransientTimeout`](crate::error::DaqError::TransientTimeout);
//! every other failure is a [`DaqError::Device`](crate::error::DaqError::Device).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::AppResult;
use crate::metadata::RunMetadata;
use crate::trigger_graph::{TriggerSource, TriggerTaskSpec};

// =============================================================================
// Frames
// =============================================================================

/// Pixel storage of a frame, in the sensor's native depth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelBuffer {
    /// 8-bit pixels (behavior camera, Mono8)
    U8(Vec<u8>),
    /// 16-bit pixels (scientific image sensor)
    U16(Vec<u16>),
}

impl PixelBuffer {
    /// Number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
        }
    }

    /// Returns true if the buffer contains no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Little-endian byte image of the pixels, as written to raw files.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            PixelBuffer::U8(data) => data.clone(),
            PixelBuffer::U16(data) => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

/// One frame delivered by a camera.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel data
    pub pixels: PixelBuffer,
    /// Hardware frame counter; consecutive frames differ by exactly one.
    pub sequence_stamp: u64,
    /// Hardware timestamp relative to the start of acquisition.
    pub device_timestamp: Duration,
}

// =============================================================================
// Cameras
// =============================================================================

/// Opens camera devices by index.
#[async_trait]
pub trait CameraDriver: Send + Sync {
    /// Open the camera at `index`.
    async fn open(&self, index: u32) -> AppResult<Arc<dyn CameraDevice>>;
}

/// An opened, externally triggered camera.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Human readable name used in logs and errors.
    fn name(&self) -> String;

    /// Program the exposure time, in seconds.
    async fn set_exposure(&self, seconds: f64) -> AppResult<()>;

    /// Begin acquiring; frames arrive once the trigger source fires.
    async fn start_acquisition(&self) -> AppResult<()>;

    /// Stop acquiring. Safe to call when not acquiring.
    async fn stop_acquisition(&self) -> AppResult<()>;

    /// Wait up to `timeout` for the next frame.
    async fn next_frame(&self, timeout: Duration) -> AppResult<Frame>;

    /// Release the device.
    async fn close(&self) -> AppResult<()>;
}

// =============================================================================
// Trigger tasks
// =============================================================================

/// Samples written to a task's output buffer before it is armed.
#[derive(Clone, Debug, PartialEq)]
pub enum PulseTrainSamples {
    /// Analog levels in volts, one per sample clock tick
    Analog(Vec<f64>),
    /// Digital port words, one per sample clock tick
    Digital(Vec<u32>),
}

impl PulseTrainSamples {
    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            PulseTrainSamples::Analog(samples) => samples.len(),
            PulseTrainSamples::Digital(samples) => samples.len(),
        }
    }

    /// Returns true if there are no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates hardware-timed output tasks from a declarative description.
#[async_trait]
pub trait TriggerTaskFactory: Send + Sync {
    /// How many independent pulse generators are available for the
    /// illumination channels.
    fn illumination_generators(&self) -> usize;

    /// Whether a second output can follow an existing generator with
    /// inverted polarity.
    fn supports_inverted_sharing(&self) -> bool;

    /// Program a task. The returned task is initialized but not armed.
    async fn create(&self, spec: &TriggerTaskSpec) -> AppResult<Box<dyn TriggerTask>>;
}

/// A programmed output task.
#[async_trait]
pub trait TriggerTask: Send + Sync {
    /// Name of the task (matches its spec).
    fn name(&self) -> &str;

    /// Returns true between a successful `create` and `clear`.
    fn is_initialized(&self) -> bool;

    /// Load the output buffer.
    async fn write_pulse_train(&mut self, samples: &PulseTrainSamples) -> AppResult<()>;

    /// Start listening for the task's trigger source.
    async fn arm(&mut self) -> AppResult<()>;

    /// Start a task that has no trigger source (the master).
    async fn start(&mut self) -> AppResult<()>;

    /// Stop output. Safe to call on a task that never started.
    async fn stop(&mut self) -> AppResult<()>;

    /// Release the task's resources.
    async fn clear(&mut self) -> AppResult<()>;
}

// =============================================================================
// Analog input
// =============================================================================

/// A buffered analog input started by a hardware trigger.
#[async_trait]
pub trait AnalogInputDevice: Send + Sync {
    /// Configure channel, sample clock and device buffer length.
    async fn configure(
        &self,
        channel: &str,
        sample_rate: f64,
        buffer_seconds: f64,
        trigger: TriggerSource,
    ) -> AppResult<()>;

    /// Start listening for the trigger.
    async fn arm(&self) -> AppResult<()>;

    /// Stop sampling. Safe to call when idle.
    async fn stop(&self) -> AppResult<()>;

    /// Read whatever is buffered, up to `max_samples`, waiting at most
    /// `timeout` for the acquisition to begin.
    async fn read_available(&self, max_samples: usize, timeout: Duration) -> AppResult<Vec<f64>>;
}

// =============================================================================
// Storage
// =============================================================================

/// Sequential frame sink shared by image stacks and behavior video.
pub trait FrameWriter: Send {
    /// Append one frame.
    fn write(&mut self, frame: &Frame) -> AppResult<()>;

    /// Flush and close. Further writes are an error.
    fn close(&mut self) -> AppResult<()>;
}

/// Where a run's files go.
///
/// `stem` is the output path without extension; backends pick their own
/// extension.
pub trait StorageBackend: Send + Sync {
    /// Open an image stack file.
    fn open_stack(&self, stem: &Path) -> AppResult<Box<dyn FrameWriter>>;

    /// Open a video file recorded at `frame_rate`.
    fn open_video(&self, stem: &Path, frame_rate: f64) -> AppResult<Box<dyn FrameWriter>>;

    /// Persist a complete sample trace.
    fn save_samples(&self, stem: &Path, sample_rate: f64, samples: &[f64]) -> AppResult<PathBuf>;

    /// Persist the run metadata record.
    fn save_metadata(&self, stem: &Path, metadata: &RunMetadata) -> AppResult<PathBuf>;
}
