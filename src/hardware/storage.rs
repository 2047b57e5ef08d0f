//! File-backed storage.
//!
//! Layout of one run with stem `<base>/<name>`:
//!
//! ```text
//! <name>_led1.raw      frames lit by illumination channel 1 (u16 LE, row major)
//! <name>_led2.raw      frames lit by illumination channel 2
//! <name>_behavior.raw  behavior video frames (u8)
//! <name>_electrode.bin bincode-encoded sample trace
//! <name>.json          run metadata
//! ```
//!
//! Each frame file starts with a fixed header (magic, width, height, bytes per
//! pixel) written with the first frame; every frame after that must have the
//! same geometry.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Frame, FrameWriter, PixelBuffer, StorageBackend};
use crate::metadata::RunMetadata;
use crate::sequencer::with_suffix;

const FRAME_MAGIC: &[u8; 4] = b"RDQF";

/// Electrode trace as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleTrace {
    /// Sample clock, Hz
    pub sample_rate: f64,
    /// Samples in acquisition order
    pub samples: Vec<f64>,
}

impl SampleTrace {
    /// Read a trace written by [`RawFileStorage::save_samples`].
    pub fn load(path: &Path) -> AppResult<Self> {
        let bytes = fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

/// Storage writing plain files next to each other.
#[derive(Debug, Clone, Default)]
pub struct RawFileStorage;

impl RawFileStorage {
    /// New file storage.
    pub fn new() -> Self {
        Self
    }

    fn create(path: &Path) -> AppResult<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(File::create(path)?)
    }
}

impl StorageBackend for RawFileStorage {
    fn open_stack(&self, stem: &Path) -> AppResult<Box<dyn FrameWriter>> {
        let path = with_suffix(stem, ".raw");
        info!("Writing image stack to '{}'", path.display());
        Ok(Box::new(RawFrameWriter::create(path)?))
    }

    fn open_video(&self, stem: &Path, frame_rate: f64) -> AppResult<Box<dyn FrameWriter>> {
        let path = with_suffix(stem, ".raw");
        info!(
            "Writing behavior video at {frame_rate} fps to '{}'",
            path.display()
        );
        Ok(Box::new(RawFrameWriter::create(path)?))
    }

    fn save_samples(&self, stem: &Path, sample_rate: f64, samples: &[f64]) -> AppResult<PathBuf> {
        let path = with_suffix(stem, ".bin");
        let trace = SampleTrace {
            sample_rate,
            samples: samples.to_vec(),
        };
        let mut writer = BufWriter::new(Self::create(&path)?);
        bincode::serialize_into(&mut writer, &trace)?;
        writer.flush()?;
        info!("Saved {} samples to '{}'", samples.len(), path.display());
        Ok(path)
    }

    fn save_metadata(&self, stem: &Path, metadata: &RunMetadata) -> AppResult<PathBuf> {
        let path = with_suffix(stem, ".json");
        let mut writer = BufWriter::new(Self::create(&path)?);
        serde_json::to_writer_pretty(&mut writer, metadata)?;
        writer.flush()?;
        debug!("Metadata written to '{}'", path.display());
        Ok(path)
    }
}

/// Appends raw frames to one file.
pub struct RawFrameWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    geometry: Option<(u32, u32, u8)>,
    frames: u64,
}

impl RawFrameWriter {
    /// Create (truncate) the file at `path`.
    pub fn create(path: PathBuf) -> AppResult<Self> {
        let file = RawFileStorage::create(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            geometry: None,
            frames: 0,
        })
    }

    /// Frames written so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl FrameWriter for RawFrameWriter {
    fn write(&mut self, frame: &Frame) -> AppResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(DaqError::device(format!(
                "'{}' is already closed",
                self.path.display()
            )));
        };
        let depth = match frame.pixels {
            PixelBuffer::U8(_) => 1,
            PixelBuffer::U16(_) => 2,
        };
        let geometry = (frame.width, frame.height, depth);
        match self.geometry {
            None => {
                writer.write_all(FRAME_MAGIC)?;
                writer.write_all(&frame.width.to_le_bytes())?;
                writer.write_all(&frame.height.to_le_bytes())?;
                writer.write_all(&[depth])?;
                self.geometry = Some(geometry);
            }
            Some(existing) if existing != geometry => {
                return Err(DaqError::device(format!(
                    "frame geometry changed from {existing:?} to {geometry:?} in '{}'",
                    self.path.display()
                )));
            }
            Some(_) => {}
        }
        writer.write_all(&frame.pixels.to_le_bytes())?;
        self.frames += 1;
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            debug!("Closed '{}' after {} frames", self.path.display(), self.frames);
        }
        Ok(())
    }
}

impl Drop for RawFrameWriter {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
    }
}
