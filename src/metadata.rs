//! Run metadata written beside each run's data.
//!
//! One record is produced when a timed run finalizes (successfully or not)
//! and stored as `<stem>.json`. Keys are camelCase:
//!
//! ```json
//! {
//!   "masterTriggerFrequency": 50.0,
//!   "illuminationFrequency": 25.0,
//!   "exposureTime": 0.01388,
//!   "stimulation": { "enabled": true, "pulseFrequency": 20.0, "highTime": 0.025, "lowTime": 0.025, "pulseCount": 20 },
//!   "electrode": { "rate": 10000.0, "enabled": true },
//!   "timing": { "baseline": 10.0, "stimulation": 1.0, "post": 60.0, "total": 71.0 },
//!   ...
//! }
//! ```
//!
//! The record also carries the batch index, start time, per-worker counts, the
//! overall outcome and the software version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timing::{ExposurePlan, RunParameters};
use crate::workers::WorkerReport;

/// Everything needed to interpret a run's files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    /// Master trigger frequency, Hz
    pub master_trigger_frequency: f64,
    /// Per-channel illumination frequency, Hz
    pub illumination_frequency: f64,
    /// Programmed camera exposure, seconds
    pub exposure_time: f64,
    /// Stimulation train
    pub stimulation: StimulationMetadata,
    /// Electrode readout
    pub electrode: ElectrodeMetadata,
    /// Run phases
    pub timing: TimingMetadata,
    /// Index within a multi-run batch
    pub run_index: Option<u32>,
    /// When the master trigger was started
    pub started_at: DateTime<Utc>,
    /// Every worker finished with its full count
    pub success: bool,
    /// Per-worker outcome
    pub workers: Vec<WorkerReport>,
    /// Version of the acquisition software
    pub software_version: String,
}

/// Stimulation section.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StimulationMetadata {
    pub enabled: bool,
    pub pulse_frequency: f64,
    pub high_time: f64,
    pub low_time: f64,
    pub pulse_count: u64,
}

/// Electrode section.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectrodeMetadata {
    pub rate: f64,
    pub enabled: bool,
}

/// Durations of the run phases, seconds.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingMetadata {
    pub baseline: f64,
    pub stimulation: f64,
    pub post: f64,
    pub total: f64,
}

impl RunMetadata {
    /// Assemble the record of a finished run.
    pub fn for_run(
        params: &RunParameters,
        exposure: &ExposurePlan,
        run_index: Option<u32>,
        started_at: DateTime<Utc>,
        success: bool,
        workers: Vec<WorkerReport>,
    ) -> Self {
        let (stimulation, post) = if params.stimulation_enabled {
            (params.stimulation_duration(), params.post_stimulation_duration)
        } else {
            (0.0, 0.0)
        };
        Self {
            master_trigger_frequency: params.master_frequency,
            illumination_frequency: params.illumination_frequency(),
            exposure_time: exposure.exposure_time,
            stimulation: StimulationMetadata {
                enabled: params.stimulation_enabled,
                pulse_frequency: params.stimulation_frequency(),
                high_time: params.stimulation_high_time,
                low_time: params.stimulation_low_time,
                pulse_count: params.stimulation_pulse_count,
            },
            electrode: ElectrodeMetadata {
                rate: params.electrode_sample_rate,
                enabled: params.electrode_readout_enabled,
            },
            timing: TimingMetadata {
                baseline: params.baseline_delay,
                stimulation,
                post,
                total: params.total_duration(),
            },
            run_index,
            started_at,
            success,
            workers,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::WorkerKind;

    #[test]
    fn test_json_keys_are_camel_case() {
        let params = RunParameters::default();
        let exposure = ExposurePlan {
            exposure_time: 0.0138,
            achievable_frequency: 50.0,
        };
        let metadata = RunMetadata::for_run(
            &params,
            &exposure,
            Some(3),
            Utc::now(),
            true,
            vec![WorkerReport {
                worker: WorkerKind::ImageStack,
                expected: Some(3550),
                produced: 3550,
                ok: true,
            }],
        );

        let json: serde_json::Value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["masterTriggerFrequency"], 50.0);
        assert_eq!(json["illuminationFrequency"], 25.0);
        assert_eq!(json["exposureTime"], 0.0138);
        assert_eq!(json["stimulation"]["pulseFrequency"], 20.0);
        assert_eq!(json["stimulation"]["pulseCount"], 20);
        assert_eq!(json["electrode"]["rate"], 10000.0);
        assert_eq!(json["timing"]["baseline"], 10.0);
        assert_eq!(json["timing"]["total"], 71.0);
        assert_eq!(json["runIndex"], 3);
        assert_eq!(json["workers"][0]["worker"], "imageStack");

        let parsed: RunMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, metadata);
    }
}
