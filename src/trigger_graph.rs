//! Trigger graph: one master clock and the tasks slaved to it.
//!
//! A run is driven by a single free-running master task. Every other output
//! (illumination, stimulation, behavior camera trigger, beam-steering sync)
//! and the electrode analog input are configured to start on the master's
//! start edge, each with its own phase delay. Because dependents only begin
//! on the master edge, all of them must be armed before the master starts;
//! [`TriggerGraph::start`] enforces that order and [`TriggerGraph::stop`]
//! reverses it.
//!
//! [`TriggerGraph::plan`] is pure: it turns run parameters into task specs
//! without touching hardware, so an unachievable configuration is refused
//! before anything is armed.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, Settings};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    AnalogInputDevice, PulseTrainSamples, TriggerTask, TriggerTaskFactory,
};
use crate::timing::{truncated_count, RunParameters};

/// Name of the master task.
pub const MASTER: &str = "master";
/// Names of the two illumination tasks.
pub const ILLUMINATION: [&str; 2] = ["illumination1", "illumination2"];
/// Name of the stimulation task.
pub const STIMULATION: &str = "stimulation";
/// Name of the behavior camera trigger task.
pub const BEHAVIOR_TRIGGER: &str = "behavior_trigger";
/// Name of the beam-steering sync task.
pub const AOD: &str = "aod";

/// Output levels of the master and behavior trigger square waves, in volts.
const SQUARE_WAVE_LEVELS: [f64; 2] = [0.0, 5.0];

/// Ring buffer length, in samples, of continuous tasks in free-run mode.
const FREE_RUN_RING_SAMPLES: u64 = 2;

/// What starts a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriggerSource {
    /// Software start; only the master has no trigger source.
    None,
    /// Digital edge of the master task's start trigger.
    Master,
}

/// Hardware resource used by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskKind {
    /// Analog output replaying a waveform
    AnalogOutput,
    /// Counter-based pulse generator
    Counter,
    /// Digital port output replaying words
    DigitalOutput,
}

/// Pulse timing of a task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum TaskTiming {
    /// Square wave at `frequency` with `duty` high fraction.
    Frequency {
        /// Hz
        frequency: f64,
        /// High fraction of one period
        duty: f64,
    },
    /// Pulse train given by absolute high and low times.
    PulseTrain {
        /// Seconds
        high_time: f64,
        /// Seconds
        low_time: f64,
    },
    /// One sample per clock tick at `rate`.
    SampleClock {
        /// Hz
        rate: f64,
    },
}

/// How long a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleMode {
    /// Repeat until stopped (free-run only).
    Continuous {
        /// Ring buffer length in samples
        ring_buffer: u64,
    },
    /// Emit exactly `pulse_count` pulses (or samples) and stop.
    Finite {
        /// Number of pulses
        pulse_count: u64,
    },
}

/// Level of the output line while the task is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IdleLevel {
    /// Low
    Low,
    /// High
    High,
}

/// Declarative description of one hardware-timed task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerTaskSpec {
    /// Task name, one of the constants of this module.
    pub name: String,
    /// Physical channel.
    pub channel: String,
    /// Hardware resource.
    pub kind: TaskKind,
    /// What starts the task.
    pub trigger_source: TriggerSource,
    /// Delay between the trigger edge and the first pulse, in seconds.
    pub phase_delay: f64,
    /// Pulse timing.
    pub timing: TaskTiming,
    /// Finite or continuous.
    pub sample_mode: SampleMode,
    /// Idle level of the line.
    pub idle_level: IdleLevel,
    /// Output polarity is inverted.
    pub inverted: bool,
    /// Another task whose generator this task follows instead of owning one.
    pub shares_generator_of: Option<String>,
    /// Buffer loaded before arming, if the task replays samples.
    #[serde(skip)]
    pub samples: Option<PulseTrainSamples>,
}

impl TriggerTaskSpec {
    fn new(name: &str, channel: &str, kind: TaskKind, timing: TaskTiming, mode: SampleMode) -> Self {
        Self {
            name: name.to_string(),
            channel: channel.to_string(),
            kind,
            trigger_source: TriggerSource::Master,
            phase_delay: 0.0,
            timing,
            sample_mode: mode,
            idle_level: IdleLevel::Low,
            inverted: false,
            shares_generator_of: None,
            samples: None,
        }
    }

    /// Pulse count of a finite task, `None` when continuous.
    pub fn pulse_count(&self) -> Option<u64> {
        match self.sample_mode {
            SampleMode::Finite { pulse_count } => Some(pulse_count),
            SampleMode::Continuous { .. } => None,
        }
    }
}

/// Device-side settings the plan needs besides the run parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerLayout {
    /// Physical channels
    pub channels: ChannelConfig,
    /// Dark gap at the end of each illumination pulse
    pub blank_time: f64,
    /// Phase offset of the first illumination channel
    pub illumination_delay: f64,
    /// Behavior camera frame rate, when a behavior camera takes part
    pub behavior_frame_rate: Option<f64>,
    /// Beam-steering words replayed one per master period
    pub aod_pattern: Vec<u32>,
    /// Electrode device buffer length
    pub electrode_buffer_seconds: f64,
}

impl TriggerLayout {
    /// Layout from the loaded settings.
    pub fn from_settings(settings: &Settings, with_behavior: bool) -> Self {
        Self {
            channels: settings.channels.clone(),
            blank_time: settings.illumination.blank_time,
            illumination_delay: settings.illumination.delay,
            behavior_frame_rate: with_behavior.then_some(settings.behavior.frame_rate),
            aod_pattern: settings.aod.pattern.clone(),
            electrode_buffer_seconds: settings.electrode.buffer_seconds,
        }
    }
}

/// Capabilities of the task factory the plan has to respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorCapabilities {
    /// Independent generators available to illumination
    pub illumination_generators: usize,
    /// A second output may follow a generator inverted
    pub inverted_sharing: bool,
}

/// Electrode input configuration armed with the dependents.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ElectrodeArm {
    sample_rate: f64,
    buffer_seconds: f64,
}

/// The master task, its dependents and the electrode input of one run.
pub struct TriggerGraph {
    factory: Arc<dyn TriggerTaskFactory>,
    analog_input: Option<Arc<dyn AnalogInputDevice>>,
    specs: Vec<TriggerTaskSpec>,
    master: Option<Box<dyn TriggerTask>>,
    dependents: Vec<Box<dyn TriggerTask>>,
    electrode: Option<ElectrodeArm>,
    electrode_armed: bool,
    running: bool,
}

impl TriggerGraph {
    /// Graph over a task factory and an optional electrode input.
    pub fn new(
        factory: Arc<dyn TriggerTaskFactory>,
        analog_input: Option<Arc<dyn AnalogInputDevice>>,
    ) -> Self {
        Self {
            factory,
            analog_input,
            specs: Vec::new(),
            master: None,
            dependents: Vec::new(),
            electrode: None,
            electrode_armed: false,
            running: false,
        }
    }

    /// Capabilities of the underlying factory.
    pub fn capabilities(&self) -> GeneratorCapabilities {
        GeneratorCapabilities {
            illumination_generators: self.factory.illumination_generators(),
            inverted_sharing: self.factory.supports_inverted_sharing(),
        }
    }

    /// Specs of the currently programmed tasks, master first.
    pub fn specs(&self) -> &[TriggerTaskSpec] {
        &self.specs
    }

    /// Returns true between `start()` and `stop()`.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether the electrode input takes part in the next start.
    pub fn has_electrode_input(&self) -> bool {
        self.electrode.is_some()
    }

    /// Turn run parameters into task specs.
    ///
    /// The first spec is always the master and it is the only one without a
    /// trigger source. Timed runs only produce finite tasks; free run only
    /// produces continuous ones.
    pub fn plan(
        params: &RunParameters,
        layout: &TriggerLayout,
        caps: GeneratorCapabilities,
    ) -> AppResult<Vec<TriggerTaskSpec>> {
        let master_frequency = params.master_frequency;
        let total = params.total_duration();
        let period = params.master_period();
        let finite_or_ring = |pulse_count: u64| {
            if params.free_run {
                SampleMode::Continuous {
                    ring_buffer: FREE_RUN_RING_SAMPLES,
                }
            } else {
                SampleMode::Finite { pulse_count }
            }
        };

        let mut specs = Vec::new();

        // Master: square wave on an analog output, two samples per period.
        let mut master = TriggerTaskSpec::new(
            MASTER,
            &layout.channels.master,
            TaskKind::AnalogOutput,
            TaskTiming::Frequency {
                frequency: master_frequency,
                duty: 0.5,
            },
            finite_or_ring(params.master_pulse_count()),
        );
        master.trigger_source = TriggerSource::None;
        master.samples = Some(PulseTrainSamples::Analog(SQUARE_WAVE_LEVELS.to_vec()));
        specs.push(master);

        // Illumination: each channel lit on alternate master periods.
        if layout.blank_time < 0.0 || layout.blank_time >= period {
            return Err(DaqError::configuration(format!(
                "illumination blank time {:.3} ms must be below one master period ({:.3} ms)",
                layout.blank_time * 1e3,
                period * 1e3
            )));
        }
        let illumination_frequency = params.illumination_frequency();
        let high_time = period - layout.blank_time;
        let illumination_pulses = truncated_count(total, illumination_frequency);
        let share = params.enabled_illumination_channels() == 2 && caps.illumination_generators < 2;
        if share && !caps.inverted_sharing {
            return Err(DaqError::device(format!(
                "two illumination channels need two pulse generators, {} available and inverted sharing is not supported",
                caps.illumination_generators
            )));
        }
        for (channel, enabled) in params.illumination_enabled.iter().enumerate() {
            if !enabled {
                continue;
            }
            let mut spec = TriggerTaskSpec::new(
                ILLUMINATION[channel],
                &layout.channels.illumination[channel],
                TaskKind::Counter,
                TaskTiming::Frequency {
                    frequency: illumination_frequency,
                    duty: high_time * illumination_frequency,
                },
                finite_or_ring(illumination_pulses),
            );
            spec.phase_delay = layout.illumination_delay + channel as f64 * period;
            if share && channel == 1 {
                spec.phase_delay = layout.illumination_delay;
                spec.inverted = true;
                spec.idle_level = IdleLevel::High;
                spec.shares_generator_of = Some(ILLUMINATION[0].to_string());
            }
            specs.push(spec);
        }

        // Stimulation is timed only; free run never stimulates.
        if params.stimulation_enabled && !params.free_run {
            let mut spec = TriggerTaskSpec::new(
                STIMULATION,
                &layout.channels.stimulation,
                TaskKind::Counter,
                TaskTiming::PulseTrain {
                    high_time: params.stimulation_high_time,
                    low_time: params.stimulation_low_time,
                },
                SampleMode::Finite {
                    pulse_count: params.derived_stimulation_pulses(),
                },
            );
            spec.phase_delay = params.baseline_delay;
            specs.push(spec);
        }

        if let Some(rate) = layout.behavior_frame_rate {
            let mut spec = TriggerTaskSpec::new(
                BEHAVIOR_TRIGGER,
                &layout.channels.behavior_trigger,
                TaskKind::AnalogOutput,
                TaskTiming::Frequency {
                    frequency: rate,
                    duty: 0.5,
                },
                finite_or_ring(truncated_count(total, rate)),
            );
            spec.samples = Some(PulseTrainSamples::Analog(SQUARE_WAVE_LEVELS.to_vec()));
            specs.push(spec);
        }

        if params.aod_enabled {
            if layout.aod_pattern.is_empty() {
                return Err(DaqError::configuration(
                    "beam-steering sync is enabled but aod.pattern is empty",
                ));
            }
            let mut spec = TriggerTaskSpec::new(
                AOD,
                &layout.channels.aod,
                TaskKind::DigitalOutput,
                TaskTiming::SampleClock {
                    rate: master_frequency,
                },
                finite_or_ring(params.master_pulse_count()),
            );
            spec.samples = Some(PulseTrainSamples::Digital(layout.aod_pattern.clone()));
            specs.push(spec);
        }

        check_plan(&specs, params.free_run)?;
        Ok(specs)
    }

    /// Program every task of the run. Idempotent: anything programmed by a
    /// previous call is cleared first.
    pub async fn init(&mut self, params: &RunParameters, layout: &TriggerLayout) -> AppResult<()> {
        self.clear_all().await;

        let specs = Self::plan(params, layout, self.capabilities())?;
        info!(
            "Programming {} trigger tasks at {} Hz master ({})",
            specs.len(),
            params.master_frequency,
            if params.free_run { "free run" } else { "timed" }
        );

        for spec in &specs {
            let mut task = self.factory.create(spec).await?;
            if let Some(samples) = &spec.samples {
                task.write_pulse_train(samples).await?;
            }
            debug!(
                "Programmed {} on {} (phase {:.4} s, {:?})",
                spec.name, spec.channel, spec.phase_delay, spec.sample_mode
            );
            if spec.trigger_source == TriggerSource::None {
                self.master = Some(task);
            } else {
                self.dependents.push(task);
            }
        }
        self.specs = specs;

        self.electrode = None;
        if params.electrode_readout_enabled {
            if let Some(input) = &self.analog_input {
                input
                    .configure(
                        &layout.channels.electrode,
                        params.electrode_sample_rate,
                        layout.electrode_buffer_seconds,
                        TriggerSource::Master,
                    )
                    .await?;
                self.electrode = Some(ElectrodeArm {
                    sample_rate: params.electrode_sample_rate,
                    buffer_seconds: layout.electrode_buffer_seconds,
                });
            }
        }
        Ok(())
    }

    /// Arm every dependent (and the electrode input), then start the master.
    pub async fn start(&mut self) -> AppResult<()> {
        let Some(master) = self.master.as_mut() else {
            return Err(DaqError::device("trigger graph started before init"));
        };

        for task in &mut self.dependents {
            task.arm().await?;
        }
        if let (Some(arm), Some(input)) = (self.electrode, &self.analog_input) {
            input.arm().await?;
            self.electrode_armed = true;
            debug!(
                "Electrode input armed at {} Hz ({} s buffer)",
                arm.sample_rate, arm.buffer_seconds
            );
        }

        master.start().await?;
        self.running = true;
        info!("Master trigger started");
        Ok(())
    }

    /// Stop the master, then every dependent, then release everything.
    ///
    /// Safe to call when nothing was started. Every task is stopped even if an
    /// earlier one fails; the first failure is returned.
    pub async fn stop(&mut self) -> AppResult<()> {
        let mut first_error = None;

        if let Some(master) = self.master.as_mut() {
            if let Err(e) = master.stop().await {
                warn!("Failed to stop master: {e}");
                first_error.get_or_insert(e);
            }
        }
        for task in &mut self.dependents {
            if let Err(e) = task.stop().await {
                warn!("Failed to stop {}: {e}", task.name());
                first_error.get_or_insert(e);
            }
        }
        if self.electrode_armed {
            if let Some(input) = &self.analog_input {
                if let Err(e) = input.stop().await {
                    warn!("Failed to stop electrode input: {e}");
                    first_error.get_or_insert(e);
                }
            }
            self.electrode_armed = false;
        }

        if self.running {
            info!("Trigger graph stopped");
        }
        self.running = false;
        self.clear_all().await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop and release only the illumination tasks.
    pub async fn stop_illumination(&mut self) -> AppResult<()> {
        let mut first_error = None;
        let mut kept = Vec::with_capacity(self.dependents.len());
        for mut task in self.dependents.drain(..) {
            if !ILLUMINATION.contains(&task.name()) {
                kept.push(task);
                continue;
            }
            let stopped = task.stop().await;
            let cleared = task.clear().await;
            if let Err(e) = stopped.and(cleared) {
                warn!("Failed to release {}: {e}", task.name());
                first_error.get_or_insert(e);
            }
        }
        self.dependents = kept;
        self.specs
            .retain(|spec| !ILLUMINATION.contains(&spec.name.as_str()));

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn clear_all(&mut self) {
        let master = self.master.take();
        for mut task in master.into_iter().chain(self.dependents.drain(..)) {
            if task.is_initialized() {
                if let Err(e) = task.clear().await {
                    warn!("Failed to clear {}: {e}", task.name());
                }
            }
        }
        self.specs.clear();
    }
}

/// Structural checks every plan has to pass.
fn check_plan(specs: &[TriggerTaskSpec], free_run: bool) -> AppResult<()> {
    let masters = specs
        .iter()
        .filter(|spec| spec.trigger_source == TriggerSource::None)
        .count();
    if masters != 1 {
        return Err(DaqError::configuration(format!(
            "a trigger graph needs exactly one master task, found {masters}"
        )));
    }
    for spec in specs {
        let continuous = matches!(spec.sample_mode, SampleMode::Continuous { .. });
        if continuous != free_run {
            return Err(DaqError::configuration(format!(
                "task {} is {} in a {} run",
                spec.name,
                if continuous { "continuous" } else { "finite" },
                if free_run { "free" } else { "timed" }
            )));
        }
        if spec.phase_delay < 0.0 {
            return Err(DaqError::configuration(format!(
                "task {} has a negative phase delay",
                spec.name
            )));
        }
    }
    Ok(())
}
