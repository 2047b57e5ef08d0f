//! Run parameters and the timing arithmetic derived from them.
//!
//! Every dependent task of a run takes its phase, duty and pulse count from a
//! handful of top-level values captured in [`RunParameters`]. The formulas
//! live here so that the trigger graph, the workers and the run metadata all
//! agree on the same numbers.
//!
//! # Derived quantities
//!
//! ```text
//! stimulation frequency = 1 / (high + low)
//! stimulation duration  = pulse count / stimulation frequency
//! total duration        = baseline + (stimulation ? stimulation duration + post : 0)
//! illumination freq     = master / 2
//! ```
//!
//! Counts derived from `duration × frequency` are truncated, never rounded
//! (see [`truncated_count`]).

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Relative slack applied before truncating a `duration × frequency` product,
/// so that products which are integral in exact arithmetic are not lost to
/// binary floating point (`0.6 × 33.333… = 19.999…`).
const COUNT_EPSILON: f64 = 1e-9;

/// Automatic repetition of the run cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiRun {
    /// Whether a finished run restarts automatically.
    #[serde(default)]
    pub enabled: bool,
    /// Total number of runs in the batch.
    #[serde(default = "default_multi_run_count")]
    pub count: u32,
}

impl Default for MultiRun {
    fn default() -> Self {
        Self {
            enabled: false,
            count: default_multi_run_count(),
        }
    }
}

/// Top-level run parameters.
///
/// The controller keeps a pending copy that can be reconfigured while idle;
/// `start()` snapshots it and the snapshot stays immutable for the run.
/// Times are in seconds, frequencies and rates in Hz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParameters {
    /// Frequency of the master trigger (also the image camera frame rate).
    pub master_frequency: f64,
    /// Time recorded before stimulation begins.
    pub baseline_delay: f64,
    /// Whether the electrical stimulation pulse train is generated.
    pub stimulation_enabled: bool,
    /// High time of one stimulation pulse.
    pub stimulation_high_time: f64,
    /// Low time of one stimulation pulse.
    pub stimulation_low_time: f64,
    /// Number of stimulation pulses.
    pub stimulation_pulse_count: u64,
    /// Time recorded after the last stimulation pulse.
    pub post_stimulation_duration: f64,
    /// Analog input rate of the electrode readout.
    pub electrode_sample_rate: f64,
    /// Whether the electrode signal is logged.
    pub electrode_readout_enabled: bool,
    /// Enable flags of the two alternating illumination channels.
    pub illumination_enabled: [bool; 2],
    /// Whether the beam-steering sync output is generated.
    pub aod_enabled: bool,
    /// Continuous preview mode with no fixed duration.
    pub free_run: bool,
    /// Batch repetition.
    pub multi_run: MultiRun,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            master_frequency: 50.0,
            baseline_delay: 10.0,
            stimulation_enabled: true,
            stimulation_high_time: 0.025,
            stimulation_low_time: 0.025,
            stimulation_pulse_count: 20,
            post_stimulation_duration: 60.0,
            electrode_sample_rate: 10_000.0,
            electrode_readout_enabled: true,
            illumination_enabled: [true, true],
            aod_enabled: false,
            free_run: false,
            multi_run: MultiRun::default(),
        }
    }
}

fn default_multi_run_count() -> u32 {
    1
}

impl RunParameters {
    /// `1 / (high + low)`.
    pub fn stimulation_frequency(&self) -> f64 {
        1.0 / (self.stimulation_high_time + self.stimulation_low_time)
    }

    /// `pulse count / stimulation frequency`.
    pub fn stimulation_duration(&self) -> f64 {
        self.stimulation_pulse_count as f64 / self.stimulation_frequency()
    }

    /// Duration of a timed run.
    pub fn total_duration(&self) -> f64 {
        if self.stimulation_enabled {
            self.baseline_delay + self.stimulation_duration() + self.post_stimulation_duration
        } else {
            self.baseline_delay
        }
    }

    /// Each illumination channel is lit on every other master period.
    pub fn illumination_frequency(&self) -> f64 {
        self.master_frequency / 2.0
    }

    /// One master period, in seconds.
    pub fn master_period(&self) -> f64 {
        1.0 / self.master_frequency
    }

    /// Number of master periods in a timed run.
    pub fn master_pulse_count(&self) -> u64 {
        truncated_count(self.total_duration(), self.master_frequency)
    }

    /// Expected electrode samples in a timed run.
    pub fn electrode_sample_count(&self) -> u64 {
        truncated_count(self.total_duration(), self.electrode_sample_rate)
    }

    /// Stimulation pulses regenerated from `duration × frequency`, truncated.
    pub fn derived_stimulation_pulses(&self) -> u64 {
        truncated_count(self.stimulation_duration(), self.stimulation_frequency())
    }

    /// Number of illumination channels switched on.
    pub fn enabled_illumination_channels(&self) -> usize {
        self.illumination_enabled.iter().filter(|on| **on).count()
    }

    /// Sanity checks that do not depend on any device.
    pub fn validate(&self) -> AppResult<()> {
        positive("master_frequency", self.master_frequency)?;
        non_negative("baseline_delay", self.baseline_delay)?;
        if self.stimulation_enabled {
            positive("stimulation_high_time", self.stimulation_high_time)?;
            positive("stimulation_low_time", self.stimulation_low_time)?;
            non_negative("post_stimulation_duration", self.post_stimulation_duration)?;
            if self.stimulation_pulse_count == 0 {
                return Err(DaqError::configuration(
                    "stimulation_pulse_count must be at least 1 when stimulation is enabled",
                ));
            }
        }
        if self.electrode_readout_enabled {
            positive("electrode_sample_rate", self.electrode_sample_rate)?;
        }
        if self.multi_run.enabled && self.multi_run.count == 0 {
            return Err(DaqError::configuration(
                "multi_run.count must be at least 1 when multi-run is enabled",
            ));
        }
        if !self.free_run && self.total_duration() <= 0.0 {
            return Err(DaqError::configuration(
                "a timed run needs a total duration above zero",
            ));
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(DaqError::configuration(format!(
            "{name} must be positive (got {value})"
        )))
    }
}

fn non_negative(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(DaqError::configuration(format!(
            "{name} must not be negative (got {value})"
        )))
    }
}

/// Whole number of periods of `frequency` that fit in `duration`.
///
/// The product is truncated: 10.3 s at 25 Hz gives 257 frames, not 258.
pub fn truncated_count(duration: f64, frequency: f64) -> u64 {
    let product = duration * frequency;
    if !product.is_finite() || product <= 0.0 {
        return 0;
    }
    (product * (1.0 + COUNT_EPSILON)).floor() as u64
}

/// Fixed per-frame readout overhead of a rolling-shutter sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReadout {
    /// Number of sensor rows read out per frame.
    pub rows: u32,
    /// Time to read one row, in seconds.
    pub line_interval: f64,
}

impl SensorReadout {
    /// `rows × line interval`.
    pub fn overhead(&self) -> f64 {
        f64::from(self.rows) * self.line_interval
    }
}

/// Result of the exposure inverse formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExposurePlan {
    /// Exposure to program on the camera, in seconds.
    pub exposure_time: f64,
    /// Frame rate the camera reaches with that exposure.
    pub achievable_frequency: f64,
}

/// Inverse exposure formula.
///
/// `exposure = 1/f − overhead − blank`, quantized down to whole line
/// intervals. The frame rate reached with the quantized exposure must match
/// `frequency` within `tolerance` (relative), otherwise the run is refused
/// with a configuration error before any hardware is armed.
pub fn exposure_for_frequency(
    frequency: f64,
    readout: SensorReadout,
    blank_time: f64,
    tolerance: f64,
) -> AppResult<ExposurePlan> {
    positive("trigger frequency", frequency)?;
    non_negative("blank time", blank_time)?;

    let overhead = readout.overhead();
    let budget = 1.0 / frequency - overhead;
    let raw = budget - blank_time;
    if raw <= 0.0 {
        return Err(DaqError::configuration(format!(
            "{frequency} Hz leaves {:.3} ms after {:.3} ms readout; blank time of {:.3} ms does not fit (exposure would be {:.3} ms)",
            budget * 1e3,
            overhead * 1e3,
            blank_time * 1e3,
            raw * 1e3,
        )));
    }

    let exposure_time = if readout.line_interval > 0.0 {
        (raw / readout.line_interval * (1.0 + COUNT_EPSILON)).floor() * readout.line_interval
    } else {
        raw
    };
    if exposure_time <= 0.0 {
        return Err(DaqError::configuration(format!(
            "exposure at {frequency} Hz is shorter than one line interval"
        )));
    }

    let achievable_frequency = 1.0 / (exposure_time + overhead + blank_time);
    let mismatch = (achievable_frequency - frequency).abs() / frequency;
    if mismatch > tolerance {
        return Err(DaqError::configuration(format!(
            "camera reaches {achievable_frequency:.4} Hz instead of the requested {frequency} Hz"
        )));
    }

    Ok(ExposurePlan {
        exposure_time,
        achievable_frequency,
    })
}
