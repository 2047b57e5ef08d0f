//! Mock Hardware Implementations
//!
//! Simulated devices for running the orchestrator without a lab rig.
//! All mock devices use async-safe operations (tokio::time::sleep, not
//! std::thread::sleep), so tests can run them under a paused clock.
//!
//! # Available Mocks
//!
//! - `MockTriggerFactory` - hardware-timed tasks; the master drives a shared
//!   [`TriggerLine`]
//! - `MockCameraDriver` - cameras producing frames while the line is high,
//!   with injectable stamp gaps and late frames
//! - `MockAnalogInput` - electrode input producing samples at its rate from
//!   the master start edge
//! - `MockStorage` - in-memory sinks that record what each run wrote
//!
//! Every device records its actions (`"master.start"`, `"electrode.arm"`,
//! ...) in a shared [`TaskTrace`] so ordering can be asserted.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    AnalogInputDevice, CameraDevice, CameraDriver, Frame, FrameWriter, PixelBuffer,
    PulseTrainSamples, StorageBackend, TriggerTask, TriggerTaskFactory,
};
use crate::metadata::RunMetadata;
use crate::sequencer::with_suffix;
use crate::timing::truncated_count;
use crate::trigger_graph::{TaskTiming, TriggerSource, TriggerTaskSpec};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// TaskTrace / TriggerLine - shared simulation state
// =============================================================================

/// Ordered log of every simulated device action.
#[derive(Debug, Clone, Default)]
pub struct TaskTrace {
    entries: Arc<Mutex<Vec<String>>>,
}

impl TaskTrace {
    /// Append an entry.
    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Index of the first occurrence of `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|e| e == entry)
    }

    /// Index of the last occurrence of `entry`.
    pub fn last_position(&self, entry: &str) -> Option<usize> {
        lock(&self.entries).iter().rposition(|e| e == entry)
    }

    /// Number of occurrences of `entry`.
    pub fn count(&self, entry: &str) -> usize {
        lock(&self.entries).iter().filter(|e| *e == entry).count()
    }
}

/// Start edge of the master task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineEdge {
    /// When the master started
    pub started_at: Instant,
    /// Master frequency
    pub master_frequency: f64,
}

/// The simulated master trigger line. `Some` while the master runs.
#[derive(Debug, Clone)]
pub struct TriggerLine {
    sender: Arc<watch::Sender<Option<LineEdge>>>,
}

impl Default for TriggerLine {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerLine {
    /// A line that has not fired.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Current edge, if the master runs.
    pub fn current(&self) -> Option<LineEdge> {
        *self.sender.borrow()
    }

    pub(crate) fn fire(&self, master_frequency: f64) {
        self.sender.send_replace(Some(LineEdge {
            started_at: Instant::now(),
            master_frequency,
        }));
    }

    pub(crate) fn release(&self) {
        self.sender.send_replace(None);
    }

    /// Wait until the master runs, or until `deadline`.
    pub async fn wait_for_edge(&self, deadline: Instant) -> Option<LineEdge> {
        let mut rx = self.sender.subscribe();
        let edge = match timeout_at(deadline, rx.wait_for(Option::is_some)).await {
            Ok(Ok(edge)) => *edge,
            _ => None,
        };
        edge
    }
}

// =============================================================================
// MockTriggerFactory - Simulated hardware-timed tasks
// =============================================================================

/// Step at which a simulated task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStep {
    /// Programming the task
    Create,
    /// Arming a dependent
    Arm,
    /// Starting the master
    Start,
    /// Stopping
    Stop,
}

/// Behavior of the simulated task factory.
#[derive(Debug, Clone, PartialEq)]
pub struct MockTriggerConfig {
    /// Independent pulse generators for illumination
    pub illumination_generators: usize,
    /// Whether inverted sharing of one generator is possible
    pub inverted_sharing: bool,
    /// Injected failure: task name and step
    pub fault: Option<(String, FaultStep)>,
}

impl Default for MockTriggerConfig {
    fn default() -> Self {
        Self {
            illumination_generators: 2,
            inverted_sharing: true,
            fault: None,
        }
    }
}

/// Creates [`MockTriggerTask`]s.
pub struct MockTriggerFactory {
    trace: TaskTrace,
    line: TriggerLine,
    config: MockTriggerConfig,
}

impl MockTriggerFactory {
    /// Factory recording into `trace`; its master drives `line`.
    pub fn new(trace: TaskTrace, line: TriggerLine, config: MockTriggerConfig) -> Self {
        Self {
            trace,
            line,
            config,
        }
    }

    fn fault_for(&self, name: &str) -> Option<FaultStep> {
        self.config
            .fault
            .as_ref()
            .filter(|(task, _)| task == name)
            .map(|(_, step)| *step)
    }
}

#[async_trait]
impl TriggerTaskFactory for MockTriggerFactory {
    fn illumination_generators(&self) -> usize {
        self.config.illumination_generators
    }

    fn supports_inverted_sharing(&self) -> bool {
        self.config.inverted_sharing
    }

    async fn create(&self, spec: &TriggerTaskSpec) -> AppResult<Box<dyn TriggerTask>> {
        let fault = self.fault_for(&spec.name);
        if fault == Some(FaultStep::Create) {
            return Err(DaqError::device(format!("{} could not be created", spec.name)));
        }
        self.trace.record(format!("{}.create", spec.name));

        let master_frequency = match spec.timing {
            TaskTiming::Frequency { frequency, .. } => frequency,
            TaskTiming::SampleClock { rate } => rate,
            TaskTiming::PulseTrain {
                high_time,
                low_time,
            } => 1.0 / (high_time + low_time),
        };
        Ok(Box::new(MockTriggerTask {
            name: spec.name.clone(),
            is_master: spec.trigger_source == TriggerSource::None,
            master_frequency,
            trace: self.trace.clone(),
            line: self.line.clone(),
            fault,
            initialized: true,
        }))
    }
}

/// A simulated task.
pub struct MockTriggerTask {
    name: String,
    is_master: bool,
    master_frequency: f64,
    trace: TaskTrace,
    line: TriggerLine,
    fault: Option<FaultStep>,
    initialized: bool,
}

impl MockTriggerTask {
    fn step(&mut self, step: FaultStep, action: &str) -> AppResult<()> {
        if self.fault == Some(step) {
            return Err(DaqError::device(format!("{} failed to {action}", self.name)));
        }
        self.trace.record(format!("{}.{action}", self.name));
        Ok(())
    }
}

#[async_trait]
impl TriggerTask for MockTriggerTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn write_pulse_train(&mut self, samples: &PulseTrainSamples) -> AppResult<()> {
        if samples.is_empty() {
            return Err(DaqError::device(format!("{} received an empty buffer", self.name)));
        }
        self.trace.record(format!("{}.write", self.name));
        Ok(())
    }

    async fn arm(&mut self) -> AppResult<()> {
        self.step(FaultStep::Arm, "arm")?;
        Ok(())
    }

    async fn start(&mut self) -> AppResult<()> {
        self.step(FaultStep::Start, "start")?;
        if self.is_master {
            self.line.fire(self.master_frequency);
        }
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        if self.is_master {
            self.line.release();
        }
        self.step(FaultStep::Stop, "stop")
    }

    async fn clear(&mut self) -> AppResult<()> {
        self.initialized = false;
        self.trace.record(format!("{}.clear", self.name));
        Ok(())
    }
}

// =============================================================================
// MockCameraDriver - Simulated triggered cameras
// =============================================================================

/// Behavior of a simulated camera.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCameraConfig {
    /// Name used in the trace and in errors
    pub name: String,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// 16-bit pixels when true, 8-bit otherwise
    pub sixteen_bit: bool,
    /// Own frame rate; `None` follows the master frequency
    pub frame_rate: Option<f64>,
    /// From this frame index on, stamps jump by one extra count
    pub skip_stamp_at: Option<u64>,
    /// Frame index whose timestamp is late by a fraction of a period
    pub late_frame: Option<(u64, f64)>,
    /// `open()` fails
    pub fail_open: bool,
}

impl MockCameraConfig {
    /// Scientific camera following the master trigger.
    pub fn image(name: &str) -> Self {
        Self {
            name: name.to_string(),
            width: 8,
            height: 8,
            sixteen_bit: true,
            frame_rate: None,
            skip_stamp_at: None,
            late_frame: None,
            fail_open: false,
        }
    }

    /// Behavior camera with its own trigger rate.
    pub fn behavior(name: &str, frame_rate: f64) -> Self {
        Self {
            sixteen_bit: false,
            frame_rate: Some(frame_rate),
            ..Self::image(name)
        }
    }
}

/// Opens [`MockCamera`]s.
pub struct MockCameraDriver {
    config: MockCameraConfig,
    trace: TaskTrace,
    line: TriggerLine,
}

impl MockCameraDriver {
    /// Driver opening cameras described by `config`.
    pub fn new(config: MockCameraConfig, trace: TaskTrace, line: TriggerLine) -> Self {
        Self {
            config,
            trace,
            line,
        }
    }
}

#[async_trait]
impl CameraDriver for MockCameraDriver {
    async fn open(&self, index: u32) -> AppResult<Arc<dyn CameraDevice>> {
        if self.config.fail_open {
            return Err(DaqError::device(format!(
                "{} (index {index}) did not open",
                self.config.name
            )));
        }
        self.trace.record(format!("{}.open", self.config.name));
        Ok(Arc::new(MockCamera {
            config: self.config.clone(),
            trace: self.trace.clone(),
            line: self.line.clone(),
            state: Mutex::new(CameraState::default()),
        }))
    }
}

#[derive(Debug, Default)]
struct CameraState {
    acquiring: bool,
    next_index: u64,
    exposure: f64,
}

/// A simulated camera. Frame `n` arrives `(n + 1)` periods after the master
/// start edge.
pub struct MockCamera {
    config: MockCameraConfig,
    trace: TaskTrace,
    line: TriggerLine,
    state: Mutex<CameraState>,
}

impl MockCamera {
    fn timed_out(&self, timeout: Duration) -> DaqError {
        DaqError::TransientTimeout {
            device: self.config.name.clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn period(&self, edge: &LineEdge) -> Duration {
        let rate = self.config.frame_rate.unwrap_or(edge.master_frequency);
        Duration::from_secs_f64(1.0 / rate)
    }

    fn frame(&self, index: u64, period: Duration) -> Frame {
        let pixel_count = (self.config.width * self.config.height) as usize;
        let pixels = if self.config.sixteen_bit {
            PixelBuffer::U16(vec![(index % u64::from(u16::MAX)) as u16; pixel_count])
        } else {
            PixelBuffer::U8(vec![(index % 256) as u8; pixel_count])
        };
        let skipped = match self.config.skip_stamp_at {
            Some(at) if index >= at => 1,
            _ => 0,
        };
        let mut device_timestamp = period.mul_f64((index + 1) as f64);
        if let Some((late, fraction)) = self.config.late_frame {
            if late == index {
                device_timestamp += period.mul_f64(fraction);
            }
        }
        Frame {
            width: self.config.width,
            height: self.config.height,
            pixels,
            sequence_stamp: index + skipped,
            device_timestamp,
        }
    }
}

#[async_trait]
impl CameraDevice for MockCamera {
    fn name(&self) -> String {
        self.config.name.clone()
    }

    async fn set_exposure(&self, seconds: f64) -> AppResult<()> {
        lock(&self.state).exposure = seconds;
        self.trace.record(format!("{}.set_exposure", self.config.name));
        Ok(())
    }

    async fn start_acquisition(&self) -> AppResult<()> {
        {
            let mut state = lock(&self.state);
            state.acquiring = true;
            state.next_index = 0;
        }
        self.trace
            .record(format!("{}.start_acquisition", self.config.name));
        Ok(())
    }

    async fn stop_acquisition(&self) -> AppResult<()> {
        lock(&self.state).acquiring = false;
        self.trace
            .record(format!("{}.stop_acquisition", self.config.name));
        Ok(())
    }

    async fn next_frame(&self, timeout: Duration) -> AppResult<Frame> {
        let deadline = Instant::now() + timeout;
        let acquiring = lock(&self.state).acquiring;
        if !acquiring {
            sleep_until(deadline).await;
            return Err(self.timed_out(timeout));
        }

        let Some(edge) = self.line.wait_for_edge(deadline).await else {
            return Err(self.timed_out(timeout));
        };
        let period = self.period(&edge);
        let index = lock(&self.state).next_index;
        let due = edge.started_at + period.mul_f64((index + 1) as f64);
        if due > deadline {
            sleep_until(deadline).await;
            return Err(self.timed_out(timeout));
        }
        sleep_until(due).await;

        // Frames cease once the master stops or restarts.
        if self.line.current() != Some(edge) {
            sleep_until(deadline).await;
            return Err(self.timed_out(timeout));
        }
        let mut state = lock(&self.state);
        if !state.acquiring || state.next_index != index {
            return Err(self.timed_out(timeout));
        }
        state.next_index += 1;
        Ok(self.frame(index, period))
    }

    async fn close(&self) -> AppResult<()> {
        lock(&self.state).acquiring = false;
        self.trace.record(format!("{}.close", self.config.name));
        Ok(())
    }
}

// =============================================================================
// MockAnalogInput - Simulated electrode input
// =============================================================================

#[derive(Debug, Default)]
struct InputState {
    sample_rate: f64,
    armed: bool,
    delivered: u64,
}

/// Simulated electrode input: a sine at 7 Hz sampled from the master edge.
pub struct MockAnalogInput {
    trace: TaskTrace,
    line: TriggerLine,
    fail_arm: bool,
    state: Mutex<InputState>,
}

impl MockAnalogInput {
    /// Input recording into `trace` and started by `line`.
    pub fn new(trace: TaskTrace, line: TriggerLine) -> Self {
        Self {
            trace,
            line,
            fail_arm: false,
            state: Mutex::new(InputState::default()),
        }
    }

    /// Input whose `arm()` fails.
    pub fn failing_arm(trace: TaskTrace, line: TriggerLine) -> Self {
        Self {
            fail_arm: true,
            ..Self::new(trace, line)
        }
    }

    fn timed_out(timeout: Duration) -> DaqError {
        DaqError::TransientTimeout {
            device: "electrode".to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[async_trait]
impl AnalogInputDevice for MockAnalogInput {
    async fn configure(
        &self,
        _channel: &str,
        sample_rate: f64,
        _buffer_seconds: f64,
        _trigger: TriggerSource,
    ) -> AppResult<()> {
        lock(&self.state).sample_rate = sample_rate;
        self.trace.record("electrode.configure");
        Ok(())
    }

    async fn arm(&self) -> AppResult<()> {
        if self.fail_arm {
            return Err(DaqError::device("electrode input failed to arm"));
        }
        {
            let mut state = lock(&self.state);
            state.armed = true;
            state.delivered = 0;
        }
        self.trace.record("electrode.arm");
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        lock(&self.state).armed = false;
        self.trace.record("electrode.stop");
        Ok(())
    }

    async fn read_available(&self, max_samples: usize, timeout: Duration) -> AppResult<Vec<f64>> {
        let deadline = Instant::now() + timeout;
        let armed = lock(&self.state).armed;
        if !armed {
            sleep_until(deadline).await;
            return Err(Self::timed_out(timeout));
        }
        let Some(edge) = self.line.wait_for_edge(deadline).await else {
            return Err(Self::timed_out(timeout));
        };

        let elapsed = Instant::now().saturating_duration_since(edge.started_at);
        let mut state = lock(&self.state);
        let acquired = truncated_count(elapsed.as_secs_f64(), state.sample_rate);
        let count = acquired
            .saturating_sub(state.delivered)
            .min(max_samples as u64);
        let first = state.delivered;
        state.delivered += count;
        let rate = state.sample_rate;
        Ok((first..first + count)
            .map(|i| (2.0 * std::f64::consts::PI * 7.0 * i as f64 / rate).sin())
            .collect())
    }
}

// =============================================================================
// MockStorage - In-memory sinks
// =============================================================================

#[derive(Debug, Default)]
struct StorageRecords {
    stacks: BTreeMap<PathBuf, Vec<u64>>,
    videos: BTreeMap<PathBuf, u64>,
    samples: BTreeMap<PathBuf, Vec<f64>>,
    metadata: Vec<(PathBuf, RunMetadata)>,
}

/// Storage that keeps everything in memory for inspection.
#[derive(Debug, Clone, Default)]
pub struct MockStorage {
    records: Arc<Mutex<StorageRecords>>,
    fail_open: bool,
}

impl MockStorage {
    /// Storage whose writers cannot be opened.
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    /// Sequence stamps written to the stack at `stem`.
    pub fn stack(&self, stem: &Path) -> Option<Vec<u64>> {
        lock(&self.records).stacks.get(stem).cloned()
    }

    /// Every stack stem opened so far.
    pub fn stack_stems(&self) -> Vec<PathBuf> {
        lock(&self.records).stacks.keys().cloned().collect()
    }

    /// Frames written to the video at `stem`.
    pub fn video_frames(&self, stem: &Path) -> Option<u64> {
        lock(&self.records).videos.get(stem).copied()
    }

    /// Samples saved at `stem`.
    pub fn samples(&self, stem: &Path) -> Option<Vec<f64>> {
        lock(&self.records).samples.get(stem).cloned()
    }

    /// Metadata records in the order they were saved.
    pub fn metadata(&self) -> Vec<(PathBuf, RunMetadata)> {
        lock(&self.records).metadata.clone()
    }

    fn check_open(&self, stem: &Path) -> AppResult<()> {
        if self.fail_open {
            return Err(DaqError::device(format!(
                "cannot open {} for writing",
                stem.display()
            )));
        }
        Ok(())
    }
}

enum SinkKind {
    Stack,
    Video,
}

struct MockFrameWriter {
    stem: PathBuf,
    kind: SinkKind,
    records: Arc<Mutex<StorageRecords>>,
    closed: bool,
}

impl FrameWriter for MockFrameWriter {
    fn write(&mut self, frame: &Frame) -> AppResult<()> {
        if self.closed {
            return Err(DaqError::device(format!(
                "{} is already closed",
                self.stem.display()
            )));
        }
        let mut records = lock(&self.records);
        match self.kind {
            SinkKind::Stack => records
                .stacks
                .entry(self.stem.clone())
                .or_default()
                .push(frame.sequence_stamp),
            SinkKind::Video => *records.videos.entry(self.stem.clone()).or_default() += 1,
        }
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.closed = true;
        Ok(())
    }
}

impl StorageBackend for MockStorage {
    fn open_stack(&self, stem: &Path) -> AppResult<Box<dyn FrameWriter>> {
        self.check_open(stem)?;
        lock(&self.records)
            .stacks
            .insert(stem.to_path_buf(), Vec::new());
        Ok(Box::new(MockFrameWriter {
            stem: stem.to_path_buf(),
            kind: SinkKind::Stack,
            records: Arc::clone(&self.records),
            closed: false,
        }))
    }

    fn open_video(&self, stem: &Path, _frame_rate: f64) -> AppResult<Box<dyn FrameWriter>> {
        self.check_open(stem)?;
        lock(&self.records).videos.insert(stem.to_path_buf(), 0);
        Ok(Box::new(MockFrameWriter {
            stem: stem.to_path_buf(),
            kind: SinkKind::Video,
            records: Arc::clone(&self.records),
            closed: false,
        }))
    }

    fn save_samples(&self, stem: &Path, _sample_rate: f64, samples: &[f64]) -> AppResult<PathBuf> {
        self.check_open(stem)?;
        lock(&self.records)
            .samples
            .insert(stem.to_path_buf(), samples.to_vec());
        Ok(stem.to_path_buf())
    }

    fn save_metadata(&self, stem: &Path, metadata: &RunMetadata) -> AppResult<PathBuf> {
        lock(&self.records)
            .metadata
            .push((stem.to_path_buf(), metadata.clone()));
        Ok(with_suffix(stem, ".json"))
    }
}

// =============================================================================
// MockRig - A complete simulated setup
// =============================================================================

/// Every simulated device of one rig, sharing one trace and trigger line.
#[derive(Clone)]
pub struct MockRig {
    /// Action log shared by all devices
    pub trace: TaskTrace,
    /// Master trigger line
    pub line: TriggerLine,
    /// In-memory storage
    pub storage: MockStorage,
    /// Image camera behavior
    pub image_camera: MockCameraConfig,
    /// Behavior camera behavior; `None` leaves the rig without one
    pub behavior_camera: Option<MockCameraConfig>,
    /// Trigger factory behavior
    pub triggers: MockTriggerConfig,
    /// Whether the rig has an electrode input
    pub electrode: bool,
    /// Electrode `arm()` fails
    pub fail_electrode_arm: bool,
}

impl Default for MockRig {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRig {
    /// A healthy rig with image camera, 25 fps behavior camera and electrode.
    pub fn new() -> Self {
        Self {
            trace: TaskTrace::default(),
            line: TriggerLine::new(),
            storage: MockStorage::default(),
            image_camera: MockCameraConfig::image("image_camera"),
            behavior_camera: Some(MockCameraConfig::behavior("behavior_camera", 25.0)),
            triggers: MockTriggerConfig::default(),
            electrode: true,
            fail_electrode_arm: false,
        }
    }

    /// Device handles for the controller, writing into the in-memory storage.
    pub fn hardware(&self) -> crate::controller::Hardware {
        self.hardware_with_storage(Arc::new(self.storage.clone()))
    }

    /// Device handles for the controller, writing into `storage`.
    pub fn hardware_with_storage(
        &self,
        storage: Arc<dyn StorageBackend>,
    ) -> crate::controller::Hardware {
        let behavior_camera = self.behavior_camera.clone().map(|config| {
            Arc::new(MockCameraDriver::new(
                config,
                self.trace.clone(),
                self.line.clone(),
            )) as Arc<dyn CameraDriver>
        });
        let analog_input = self.electrode.then(|| {
            let input = if self.fail_electrode_arm {
                MockAnalogInput::failing_arm(self.trace.clone(), self.line.clone())
            } else {
                MockAnalogInput::new(self.trace.clone(), self.line.clone())
            };
            Arc::new(input) as Arc<dyn AnalogInputDevice>
        });

        crate::controller::Hardware {
            image_camera: Arc::new(MockCameraDriver::new(
                self.image_camera.clone(),
                self.trace.clone(),
                self.line.clone(),
            )),
            behavior_camera,
            trigger_tasks: Arc::new(MockTriggerFactory::new(
                self.trace.clone(),
                self.line.clone(),
                self.triggers.clone(),
            )),
            analog_input,
            storage,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
