//! Configuration system using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `RUNDAQ_` (nested keys split on `__`)
//!
//! Every field carries a default, so an empty file (or no file at all) yields
//! a usable lab configuration.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! RUNDAQ_APPLICATION__LOG_LEVEL=debug
//! RUNDAQ_RUN__MASTER_FREQUENCY=40
//! RUNDAQ_OUTPUT__RUN_NAME=mouse12
//! ```
//!
//! # Example
//!
//! ```no_run
//! use run_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/run_daq.toml")?;
//! println!("Run name: {}", settings.output.run_name);
//! # Ok::<(), run_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, DaqError};
use crate::timing::{RunParameters, SensorReadout};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Pending run parameters
    pub run: RunParameters,
    /// Physical channel names of every generated signal
    pub channels: ChannelConfig,
    /// Illumination alternation timing
    pub illumination: IlluminationConfig,
    /// Image-stack camera
    pub camera: CameraConfig,
    /// Behavior video camera
    pub behavior: BehaviorConfig,
    /// Electrode readout polling
    pub electrode: ElectrodeConfig,
    /// Beam-steering sync output
    pub aod: AodConfig,
    /// Output naming
    pub output: OutputConfig,
    /// Coordination context tuning
    pub controller: ControllerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "run_daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Physical channels (driver-specific strings, passed through untouched).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Master trigger output
    pub master: String,
    /// Illumination channel outputs
    pub illumination: [String; 2],
    /// Stimulation pulse counter
    pub stimulation: String,
    /// Behavior camera trigger output
    pub behavior_trigger: String,
    /// Beam-steering digital port
    pub aod: String,
    /// Electrode analog input
    pub electrode: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            master: "Dev1/ao0".to_string(),
            illumination: ["Dev1/ctr1".to_string(), "Dev1/ctr2".to_string()],
            stimulation: "Dev1/ctr3".to_string(),
            behavior_trigger: "Dev1/ao1".to_string(),
            aod: "Dev2/port0/line16:31".to_string(),
            electrode: "Dev1/ai0".to_string(),
        }
    }
}

/// Illumination alternation timing, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IlluminationConfig {
    /// Dark window at the end of each half-period while the light switches
    pub blank_time: f64,
    /// Offset of the first illumination edge from the master trigger
    pub delay: f64,
}

impl Default for IlluminationConfig {
    fn default() -> Self {
        Self {
            blank_time: 0.001,
            delay: 0.0,
        }
    }
}

/// Image-stack camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Camera index passed to the driver
    pub index: u32,
    /// Sensor rows read out per frame
    pub rows: u32,
    /// Row readout time in seconds
    pub line_interval: f64,
    /// Allowed relative mismatch between requested and achievable frame rate
    pub frame_rate_tolerance: f64,
    /// Inter-arrival deviation (fraction of a period) that logs a warning
    pub warn_deviation: f64,
    /// Inter-arrival deviation (fraction of a period) that fails the run
    pub fail_deviation: f64,
    /// Timeout of a single frame poll
    pub poll_timeout_ms: u64,
    /// Consecutive poll timeouts tolerated before the worker gives up
    pub max_consecutive_timeouts: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            rows: 512,
            line_interval: 9.74e-6,
            frame_rate_tolerance: 0.01,
            warn_deviation: 0.75,
            fail_deviation: 1.0,
            poll_timeout_ms: 1000,
            max_consecutive_timeouts: 10,
        }
    }
}

impl CameraConfig {
    /// Readout overhead used by the exposure formula.
    pub fn readout(&self) -> SensorReadout {
        SensorReadout {
            rows: self.rows,
            line_interval: self.line_interval,
        }
    }
}

/// Behavior video camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Whether the behavior camera takes part in runs
    pub enabled: bool,
    /// Camera index passed to the driver
    pub index: u32,
    /// Triggered frame rate
    pub frame_rate: f64,
    /// Maximum preview rate
    pub preview_fps: f64,
    /// Timeout of a single frame poll
    pub poll_timeout_ms: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            index: 0,
            frame_rate: 25.0,
            preview_fps: 25.0,
            poll_timeout_ms: 1000,
        }
    }
}

/// Electrode readout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectrodeConfig {
    /// Interval between buffer reads
    pub poll_interval_ms: u64,
    /// Device-side buffer length
    pub buffer_seconds: f64,
    /// Rate of the decimated live preview
    pub preview_rate: f64,
}

impl Default for ElectrodeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 150,
            buffer_seconds: 2.0,
            preview_rate: 1000.0,
        }
    }
}

/// Beam-steering sync output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AodConfig {
    /// Words replayed on the digital port, one per master period
    pub pattern: Vec<u32>,
}

/// Output naming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving every run's files
    pub base_path: PathBuf,
    /// Stem of every file of a run
    pub run_name: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_path: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            run_name: "myexperiment".to_string(),
        }
    }
}

/// Coordination context tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// How long `stop()` waits for each worker to drain
    pub worker_shutdown_timeout_ms: u64,
    /// Capacity of the command and event channels
    pub channel_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            worker_shutdown_timeout_ms: 5000,
            channel_capacity: 256,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file and `RUNDAQ_` environment variables.
    ///
    /// A missing file is not an error; defaults fill every gap. After loading,
    /// the configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUNDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Run parameters are physically meaningful
    /// - Illumination blank time fits in one master period
    /// - Frame-loss thresholds are ordered
    /// - Output run name is not empty
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.run.validate()?;

        if self.illumination.blank_time < 0.0 || self.illumination.delay < 0.0 {
            return Err(DaqError::configuration(
                "illumination blank_time and delay must not be negative",
            ));
        }
        if self.illumination.blank_time >= self.run.master_period() {
            return Err(DaqError::configuration(format!(
                "illumination blank_time {} s does not fit in a {} s master period",
                self.illumination.blank_time,
                self.run.master_period()
            )));
        }

        if !(self.camera.warn_deviation > 0.0
            && self.camera.warn_deviation <= self.camera.fail_deviation)
        {
            return Err(DaqError::configuration(format!(
                "camera warn_deviation {} must be positive and not above fail_deviation {}",
                self.camera.warn_deviation, self.camera.fail_deviation
            )));
        }
        if self.camera.poll_timeout_ms == 0 || self.behavior.poll_timeout_ms == 0 {
            return Err(DaqError::configuration("poll timeouts must be non-zero"));
        }
        if self.behavior.enabled && self.behavior.frame_rate <= 0.0 {
            return Err(DaqError::configuration(
                "behavior frame_rate must be positive",
            ));
        }
        if self.electrode.poll_interval_ms == 0 || self.electrode.buffer_seconds <= 0.0 {
            return Err(DaqError::configuration(
                "electrode poll_interval_ms and buffer_seconds must be positive",
            ));
        }
        if self.run.aod_enabled && self.aod.pattern.is_empty() {
            return Err(DaqError::configuration(
                "aod is enabled but aod.pattern is empty",
            ));
        }

        if self.output.run_name.trim().is_empty() {
            return Err(DaqError::configuration("output run_name cannot be empty"));
        }
        if self.controller.channel_capacity == 0 {
            return Err(DaqError::configuration(
                "controller channel_capacity must be non-zero",
            ));
        }

        Ok(())
    }
}
