//! Run controller: the single coordination context of the orchestrator.
//!
//! All run state lives in one tokio task ([`RunControllerActor`]) that
//! processes [`RunCommand`]s from any number of [`RunController`] handles and
//! completion reports from the acquisition workers. Nothing else mutates
//! state, so a start, a stop and a worker report can never interleave
//! half-way.
//!
//! # States
//!
//! ```text
//! Uninitialized --initialize--> Initializing --ok--> Ready
//!                                      \--failure--> Uninitialized (+ error)
//! Ready --start / start_free_run--> Capturing --stop / quorum--> Ready
//! any --error--> Error --acknowledge_error--> previous state
//! ```
//!
//! # Run sequence
//!
//! 1. validate parameters and compute the exposure (no hardware touched)
//! 2. start camera acquisition, program the trigger graph
//! 3. spawn the workers, arm the dependents, fire the master
//! 4. first successful worker: illumination off
//! 5. every worker reported: tear down, write metadata, maybe start the
//!    next run of the batch

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::barrier::{BarrierOutcome, CompletionBarrier};
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    AnalogInputDevice, CameraDevice, CameraDriver, Frame, StorageBackend, TriggerTaskFactory,
};
use crate::messages::{RunCommand, RunEvent, RunStatus};
use crate::metadata::RunMetadata;
use crate::sequencer::{output_stem, with_suffix, RunSequencer};
use crate::timing::{exposure_for_frequency, truncated_count, ExposurePlan, RunParameters};
use crate::trigger_graph::{TriggerGraph, TriggerLayout};
use crate::workers::{
    BehaviorVideoWorker, ElectrodeLogWorker, ImageStackWorker, WorkerEvent, WorkerHandle,
    WorkerReport, WorkerState,
};

/// Capacity of the preview broadcast channels.
const PREVIEW_CAPACITY: usize = 16;

/// Lifecycle of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// No device is open
    Uninitialized,
    /// Devices are being opened
    Initializing,
    /// Devices open, no run active
    Ready,
    /// A run is active
    Capturing,
    /// An error was signalled; waiting for acknowledgement
    Error,
}

/// Device handles the controller drives.
pub struct Hardware {
    /// Scientific camera, triggered by the master
    pub image_camera: Arc<dyn CameraDriver>,
    /// Behavior camera; optional
    pub behavior_camera: Option<Arc<dyn CameraDriver>>,
    /// Hardware-timed output tasks
    pub trigger_tasks: Arc<dyn TriggerTaskFactory>,
    /// Electrode input; optional
    pub analog_input: Option<Arc<dyn AnalogInputDevice>>,
    /// Where run files go
    pub storage: Arc<dyn StorageBackend>,
}

/// Cloneable handle to the coordination task.
#[derive(Clone)]
pub struct RunController {
    command_tx: mpsc::Sender<RunCommand>,
    events: broadcast::Sender<RunEvent>,
    electrode_preview: broadcast::Sender<Arc<Vec<f64>>>,
    behavior_preview: broadcast::Sender<Arc<Frame>>,
}

impl RunController {
    /// Spawn the coordination task on the current runtime.
    pub fn spawn(settings: Settings, hardware: Hardware) -> (Self, JoinHandle<()>) {
        let capacity = settings.controller.channel_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (events, _) = broadcast::channel(capacity);
        let (electrode_preview, _) = broadcast::channel(PREVIEW_CAPACITY);
        let (behavior_preview, _) = broadcast::channel(PREVIEW_CAPACITY);

        let actor = RunControllerActor::new(
            settings,
            hardware,
            events.clone(),
            electrode_preview.clone(),
            behavior_preview.clone(),
        );
        let task = tokio::spawn(actor.run(command_rx));

        (
            Self {
                command_tx,
                events,
                electrode_preview,
                behavior_preview,
            },
            task,
        )
    }

    async fn request<T>(&self, (command, rx): (RunCommand, oneshot::Receiver<T>)) -> AppResult<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| DaqError::ControllerUnavailable)?;
        rx.await.map_err(|_| DaqError::ControllerUnavailable)
    }

    /// Open every device.
    pub async fn initialize(&self) -> AppResult<()> {
        self.request(RunCommand::initialize()).await?
    }

    /// Replace the pending run parameters. Refused while capturing.
    pub async fn configure(&self, params: RunParameters) -> AppResult<()> {
        self.request(RunCommand::configure(params)).await?
    }

    /// Start a timed run, or the first run of a multi-run batch.
    pub async fn start(&self) -> AppResult<()> {
        self.request(RunCommand::start()).await?
    }

    /// Start continuous preview.
    pub async fn start_free_run(&self) -> AppResult<()> {
        self.request(RunCommand::start_free_run()).await?
    }

    /// Stop the current run. Returns false if nothing was running.
    pub async fn stop(&self) -> AppResult<bool> {
        self.request(RunCommand::stop()).await
    }

    /// Same as [`stop`](Self::stop).
    pub async fn abort(&self) -> AppResult<bool> {
        self.stop().await
    }

    /// Stop the current run and end the batch.
    pub async fn multi_run_stop(&self) -> AppResult<bool> {
        self.request(RunCommand::multi_run_stop()).await
    }

    /// Leave the error state.
    pub async fn acknowledge_error(&self) -> AppResult<RunState> {
        self.request(RunCommand::acknowledge_error()).await
    }

    /// Current state and counters.
    pub async fn status(&self) -> AppResult<RunStatus> {
        self.request(RunCommand::get_status()).await
    }

    /// Current state.
    pub async fn state(&self) -> AppResult<RunState> {
        Ok(self.status().await?.state)
    }

    /// Stop any run and close every device.
    pub async fn uninitialize(&self) -> AppResult<()> {
        self.request(RunCommand::uninitialize()).await?
    }

    /// Uninitialize and end the coordination task.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(RunCommand::shutdown()).await
    }

    /// Follow state changes and run progress.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Decimated electrode samples.
    pub fn subscribe_electrode_preview(&self) -> broadcast::Receiver<Arc<Vec<f64>>> {
        self.electrode_preview.subscribe()
    }

    /// Throttled behavior frames.
    pub fn subscribe_behavior_preview(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.behavior_preview.subscribe()
    }
}

struct WorkerSlot {
    handle: WorkerHandle,
    state: WorkerState,
    produced: u64,
}

impl WorkerSlot {
    fn new(handle: WorkerHandle) -> Self {
        Self {
            handle,
            state: WorkerState::Running,
            produced: 0,
        }
    }

    fn report(&self) -> WorkerReport {
        WorkerReport {
            worker: self.handle.kind(),
            expected: self.handle.expected_total(),
            produced: self.produced,
            ok: self.state == WorkerState::Completed(true),
        }
    }
}

struct ActiveRun {
    id: u64,
    params: RunParameters,
    exposure: ExposurePlan,
    index: Option<u32>,
    stem: Option<PathBuf>,
    started_at: DateTime<Utc>,
    workers: Vec<WorkerSlot>,
    outcome: Option<bool>,
    failure: Option<String>,
}

/// Stems of the image stacks for the enabled illumination channels.
pub fn image_outputs(stem: &Path, illumination_enabled: [bool; 2]) -> Vec<PathBuf> {
    let lit: Vec<PathBuf> = illumination_enabled
        .iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .map(|(channel, _)| with_suffix(stem, &format!("_led{}", channel + 1)))
        .collect();
    if lit.is_empty() {
        vec![stem.to_path_buf()]
    } else {
        lit
    }
}

/// Owns all run state; driven by [`RunController`] handles.
pub struct RunControllerActor {
    settings: Settings,
    hardware: Hardware,
    state: RunState,
    previous_state: Option<RunState>,
    graph: TriggerGraph,
    barrier: CompletionBarrier,
    sequencer: RunSequencer,
    image_camera: Option<Arc<dyn CameraDevice>>,
    behavior_camera: Option<Arc<dyn CameraDevice>>,
    run: Option<ActiveRun>,
    next_run_id: u64,
    stopping: bool,
    batch_params: Option<RunParameters>,
    continue_batch: bool,
    events: broadcast::Sender<RunEvent>,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    electrode_preview: broadcast::Sender<Arc<Vec<f64>>>,
    behavior_preview: broadcast::Sender<Arc<Frame>>,
}

impl RunControllerActor {
    /// Creates a new RunControllerActor
    pub fn new(
        settings: Settings,
        hardware: Hardware,
        events: broadcast::Sender<RunEvent>,
        electrode_preview: broadcast::Sender<Arc<Vec<f64>>>,
        behavior_preview: broadcast::Sender<Arc<Frame>>,
    ) -> Self {
        let graph = TriggerGraph::new(
            Arc::clone(&hardware.trigger_tasks),
            hardware.analog_input.clone(),
        );
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            hardware,
            state: RunState::Uninitialized,
            previous_state: None,
            graph,
            barrier: CompletionBarrier::new(),
            sequencer: RunSequencer::new(),
            image_camera: None,
            behavior_camera: None,
            run: None,
            next_run_id: 0,
            stopping: false,
            batch_params: None,
            continue_batch: false,
            events,
            worker_tx,
            worker_rx,
            electrode_preview,
            behavior_preview,
        }
    }

    /// Runs the actor event loop until shutdown or until every handle is
    /// dropped.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<RunCommand>) {
        info!("RunController started");

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = self.worker_rx.recv() => self.handle_worker_event(event).await,
            }
            self.continue_batch().await;
        }

        self.release().await;
        info!("RunController shutting down");
    }

    async fn handle_command(&mut self, command: RunCommand) -> bool {
        match command {
            RunCommand::Initialize { response } => {
                let result = self.initialize().await;
                let _ = response.send(result);
            }

            RunCommand::Configure { params, response } => {
                let _ = response.send(self.configure(*params));
            }

            RunCommand::Start { response } => {
                let result = self.start().await;
                let _ = response.send(result);
            }

            RunCommand::StartFreeRun { response } => {
                let result = self.start_free_run().await;
                let _ = response.send(result);
            }

            RunCommand::Stop { response } => {
                let stopped = self.stop_run().await;
                let _ = response.send(stopped);
            }

            RunCommand::MultiRunStop { response } => {
                info!("Multi-run stop requested");
                self.sequencer.request_stop();
                let stopped = self.stop_run().await;
                let _ = response.send(stopped);
            }

            RunCommand::AcknowledgeError { response } => {
                let _ = response.send(self.acknowledge_error());
            }

            RunCommand::GetStatus { response } => {
                let _ = response.send(self.status());
            }

            RunCommand::Uninitialize { response } => {
                let result = self.uninitialize().await;
                let _ = response.send(result);
            }

            RunCommand::Shutdown { response } => {
                info!("Shutdown command received");
                self.release().await;
                let _ = response.send(());
                return false;
            }
        }
        true
    }

    // =========================================================================
    // State bookkeeping
    // =========================================================================

    fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&mut self, to: RunState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        debug!("{from:?} -> {to:?}");
        self.emit(RunEvent::StateChanged { from, to });
    }

    fn raise_error(&mut self, message: String) {
        error!("{message}");
        if self.state != RunState::Error {
            self.previous_state = Some(self.state);
            self.transition(RunState::Error);
        }
        self.continue_batch = false;
        self.emit(RunEvent::Error { message });
    }

    fn acknowledge_error(&mut self) -> RunState {
        if self.state == RunState::Error {
            let restored = match self.previous_state.take() {
                Some(RunState::Capturing) | Some(RunState::Initializing) => RunState::Ready,
                Some(state) => state,
                None => RunState::Uninitialized,
            };
            info!("Error acknowledged, back to {restored:?}");
            self.transition(restored);
        }
        self.state
    }

    fn status(&self) -> RunStatus {
        let run = self.run.as_ref();
        RunStatus {
            state: self.state,
            previous_state: if self.state == RunState::Error {
                self.previous_state
            } else {
                None
            },
            run_index: run.and_then(|r| r.index),
            free_run: run.is_some_and(|r| r.params.free_run),
            tally: self.barrier.tally(),
            workers: run
                .map(|r| r.workers.iter().map(WorkerSlot::report).collect())
                .unwrap_or_default(),
            params: self.settings.run.clone(),
        }
    }

    fn layout(&self) -> TriggerLayout {
        TriggerLayout::from_settings(&self.settings, self.behavior_camera.is_some())
    }

    // =========================================================================
    // Devices
    // =========================================================================

    async fn initialize(&mut self) -> AppResult<()> {
        if self.state != RunState::Uninitialized {
            return Err(DaqError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }
        self.transition(RunState::Initializing);

        match self.open_devices().await {
            Ok(()) => {
                info!("Devices initialized");
                self.transition(RunState::Ready);
                Ok(())
            }
            Err(e) => {
                self.close_devices().await;
                self.transition(RunState::Uninitialized);
                self.raise_error(format!("Initialization failed: {e}"));
                Err(e)
            }
        }
    }

    async fn open_devices(&mut self) -> AppResult<()> {
        let image = self
            .hardware
            .image_camera
            .open(self.settings.camera.index)
            .await?;
        info!("Opened {}", image.name());
        self.image_camera = Some(image);

        if self.settings.behavior.enabled {
            if let Some(driver) = &self.hardware.behavior_camera {
                let behavior = driver.open(self.settings.behavior.index).await?;
                info!("Opened {}", behavior.name());
                self.behavior_camera = Some(behavior);
            }
        }
        Ok(())
    }

    async fn close_devices(&mut self) {
        let cameras = [self.image_camera.take(), self.behavior_camera.take()];
        for camera in cameras.into_iter().flatten() {
            if let Err(e) = camera.close().await {
                warn!("Failed to close {}: {e}", camera.name());
            }
        }
    }

    async fn uninitialize(&mut self) -> AppResult<()> {
        self.sequencer.request_stop();
        self.stop_run().await;
        self.continue_batch = false;
        self.batch_params = None;
        self.sequencer.end_batch();
        self.close_devices().await;
        self.previous_state = None;
        self.transition(RunState::Uninitialized);
        Ok(())
    }

    async fn release(&mut self) {
        if self.state != RunState::Uninitialized {
            let _ = self.uninitialize().await;
        }
    }

    fn configure(&mut self, params: RunParameters) -> AppResult<()> {
        if self.state == RunState::Capturing {
            return Err(DaqError::InvalidState {
                operation: "configure",
                state: self.state,
            });
        }
        params.validate()?;
        self.settings.run = params;
        Ok(())
    }

    // =========================================================================
    // Runs
    // =========================================================================

    async fn start(&mut self) -> AppResult<()> {
        if self.state != RunState::Ready {
            return Err(DaqError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        let mut params = self.settings.run.clone();
        params.free_run = false;
        self.sequencer.begin_batch(params.multi_run);
        self.batch_params = Some(params.clone());
        self.start_run(params).await
    }

    async fn start_free_run(&mut self) -> AppResult<()> {
        if self.state != RunState::Ready {
            return Err(DaqError::InvalidState {
                operation: "start free run",
                state: self.state,
            });
        }
        let mut params = self.settings.run.clone();
        params.free_run = true;
        self.sequencer.end_batch();
        self.batch_params = None;
        self.start_run(params).await
    }

    /// Everything that can be checked without touching hardware.
    fn plan_run(&self, params: &RunParameters) -> AppResult<ExposurePlan> {
        params.validate()?;
        let exposure = exposure_for_frequency(
            params.master_frequency,
            self.settings.camera.readout(),
            self.settings.illumination.blank_time,
            self.settings.camera.frame_rate_tolerance,
        )?;
        TriggerGraph::plan(params, &self.layout(), self.graph.capabilities())?;
        Ok(exposure)
    }

    async fn start_run(&mut self, params: RunParameters) -> AppResult<()> {
        let exposure = match self.plan_run(&params) {
            Ok(exposure) => exposure,
            Err(e) => {
                self.raise_error(format!("Run refused: {e}"));
                return Err(e);
            }
        };
        let Some(image_camera) = self.image_camera.clone() else {
            let e = DaqError::device("image camera is not open");
            self.raise_error(e.to_string());
            return Err(e);
        };

        self.next_run_id += 1;
        let index = self.sequencer.naming_index();
        let stem = (!params.free_run).then(|| {
            output_stem(
                &self.settings.output.base_path,
                &self.settings.output.run_name,
                index,
            )
        });
        info!(
            "Starting {} run at {} Hz, exposure {:.3} ms{}",
            if params.free_run { "free" } else { "timed" },
            params.master_frequency,
            exposure.exposure_time * 1e3,
            stem.as_ref()
                .map(|s| format!(", writing to '{}'", s.display()))
                .unwrap_or_default()
        );

        self.barrier.disarm();
        self.run = Some(ActiveRun {
            id: self.next_run_id,
            params: params.clone(),
            exposure,
            index,
            stem,
            started_at: Utc::now(),
            workers: Vec::new(),
            outcome: None,
            failure: None,
        });
        self.transition(RunState::Capturing);

        match self.arm_run(&params, &exposure, image_camera).await {
            Ok(()) => {
                if let Some(run) = self.run.as_mut() {
                    run.started_at = Utc::now();
                }
                self.emit(RunEvent::Started {
                    run_index: index,
                    free_run: params.free_run,
                });
                Ok(())
            }
            Err(e) => {
                let message = format!("Failed to start run: {e}");
                self.barrier.disarm();
                if let Some(run) = self.run.as_mut() {
                    if let Some(earlier) = run.failure.replace(message.clone()) {
                        warn!("Superseded by the arming failure: {earlier}");
                    }
                }
                if !self.stop_run().await {
                    self.raise_error(message);
                }
                Err(e)
            }
        }
    }

    async fn arm_run(
        &mut self,
        params: &RunParameters,
        exposure: &ExposurePlan,
        image_camera: Arc<dyn CameraDevice>,
    ) -> AppResult<()> {
        image_camera.set_exposure(exposure.exposure_time).await?;
        image_camera.start_acquisition().await?;
        if let Some(camera) = &self.behavior_camera {
            camera.start_acquisition().await?;
        }

        let layout = self.layout();
        self.graph.init(params, &layout).await?;

        let workers = self.spawn_workers(params, image_camera);
        if !params.free_run {
            self.barrier.configure(workers.len());
        }
        if let Some(run) = self.run.as_mut() {
            run.workers = workers;
        }

        self.graph.start().await
    }

    fn spawn_workers(
        &self,
        params: &RunParameters,
        image_camera: Arc<dyn CameraDevice>,
    ) -> Vec<WorkerSlot> {
        let run_id = self.next_run_id;
        let timed = !params.free_run;
        let stem = self.run.as_ref().and_then(|r| r.stem.clone());
        let storage = &self.hardware.storage;
        let mut slots = Vec::with_capacity(3);

        let outputs = stem
            .as_deref()
            .map(|s| image_outputs(s, params.illumination_enabled))
            .unwrap_or_default();
        let image = ImageStackWorker::new(
            image_camera,
            Arc::clone(storage),
            &self.settings.camera,
            params.master_frequency,
        )
        .spawn(
            run_id,
            timed.then(|| params.master_pulse_count()),
            outputs,
            self.worker_tx.clone(),
        );
        slots.push(WorkerSlot::new(image));

        if self.graph.has_electrode_input() {
            if let Some(input) = &self.hardware.analog_input {
                let electrode = ElectrodeLogWorker::new(
                    Arc::clone(input),
                    Arc::clone(storage),
                    &self.settings.electrode,
                    params.electrode_sample_rate,
                    self.settings.camera.max_consecutive_timeouts,
                )
                .with_preview(self.electrode_preview.clone())
                .spawn(
                    run_id,
                    timed.then(|| params.electrode_sample_count()),
                    stem.as_deref().map(|s| with_suffix(s, "_electrode")),
                    self.worker_tx.clone(),
                );
                slots.push(WorkerSlot::new(electrode));
            }
        }

        if let Some(camera) = &self.behavior_camera {
            let rate = self.settings.behavior.frame_rate;
            let behavior = BehaviorVideoWorker::new(
                Arc::clone(camera),
                Arc::clone(storage),
                &self.settings.behavior,
                self.settings.camera.max_consecutive_timeouts,
            )
            .with_preview(self.behavior_preview.clone())
            .spawn(
                run_id,
                timed.then(|| truncated_count(params.total_duration(), rate)),
                stem.as_deref().map(|s| with_suffix(s, "_behavior")),
                self.worker_tx.clone(),
            );
            slots.push(WorkerSlot::new(behavior));
        }

        slots
    }

    /// Count a worker report against the current run.
    fn record_completion(&mut self, event: WorkerEvent) -> BarrierOutcome {
        let Some(run) = self.run.as_mut().filter(|run| run.id == event.run_id) else {
            debug!(
                "Ignoring late {:?} report from run {}",
                event.worker, event.run_id
            );
            return BarrierOutcome::Ignored;
        };
        let Some(slot) = run
            .workers
            .iter_mut()
            .find(|slot| slot.handle.kind() == event.worker)
        else {
            return BarrierOutcome::Ignored;
        };
        if slot.state != WorkerState::Running {
            warn!("Duplicate {:?} report ignored", event.worker);
            return BarrierOutcome::Ignored;
        }

        slot.produced = event.produced;
        slot.state = match &event.failure {
            Some(reason) => WorkerState::Failed(reason.clone()),
            None => WorkerState::Completed(event.ok),
        };
        if let Some(reason) = event.failure {
            run.failure
                .get_or_insert(format!("{:?} worker failed: {reason}", event.worker));
        }

        let outcome = self.barrier.increment(event.ok);
        if let BarrierOutcome::Finalized { success } = outcome {
            run.outcome = Some(success);
        }
        outcome
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        let failed_free_run = event.failure.is_some()
            && self
                .run
                .as_ref()
                .is_some_and(|run| run.id == event.run_id && run.params.free_run);

        match self.record_completion(event) {
            BarrierOutcome::EarlyShutdown => self.early_shutdown().await,
            BarrierOutcome::Finalized { success } => {
                info!("Every worker reported (success: {success})");
                self.stop_run().await;
            }
            BarrierOutcome::Pending | BarrierOutcome::Ignored => {}
        }

        if failed_free_run {
            self.stop_run().await;
        }
    }

    async fn early_shutdown(&mut self) {
        info!("First worker finished, switching illumination off");
        match self.graph.stop_illumination().await {
            Ok(()) => self.emit(RunEvent::IlluminationStopped),
            Err(e) => {
                warn!("Failed to switch illumination off: {e}");
                if let Some(run) = self.run.as_mut() {
                    run.failure
                        .get_or_insert(format!("Failed to switch illumination off: {e}"));
                }
            }
        }
    }

    /// Tear the current run down. Idempotent: returns false when nothing was
    /// running or a teardown is already in progress.
    async fn stop_run(&mut self) -> bool {
        if self.state != RunState::Capturing || self.stopping {
            return false;
        }
        self.stopping = true;
        info!("Stopping run");

        // Master first, then dependents, then the workers.
        let mut teardown_error = self.graph.stop().await.err();

        let shutdown_timeout =
            Duration::from_millis(self.settings.controller.worker_shutdown_timeout_ms);
        if let Some(run) = self.run.as_mut() {
            for slot in &run.workers {
                slot.handle.stop();
            }
            join_all(
                run.workers
                    .iter_mut()
                    .map(|slot| slot.handle.join(shutdown_timeout)),
            )
            .await;
        }

        // Reports sent while the workers drained still belong to this run.
        while let Ok(event) = self.worker_rx.try_recv() {
            self.record_completion(event);
        }
        self.barrier.disarm();

        for camera in [&self.image_camera, &self.behavior_camera]
            .into_iter()
            .flatten()
        {
            if let Err(e) = camera.stop_acquisition().await {
                warn!("Failed to stop {}: {e}", camera.name());
                teardown_error.get_or_insert(e);
            }
        }

        let failure = match self.run.take() {
            Some(run) => self.finish_run(run),
            None => None,
        };

        self.transition(RunState::Ready);
        self.emit(RunEvent::Stopped);
        self.stopping = false;
        info!("Run stopped");

        // One error signal per run; the first failure names it.
        let failure = match (failure, teardown_error) {
            (Some(message), Some(e)) => {
                warn!("Teardown also failed: {e}");
                Some(message)
            }
            (None, Some(e)) => Some(format!("Teardown failed: {e}")),
            (message, None) => message,
        };
        if let Some(message) = failure {
            self.raise_error(message);
        }
        true
    }

    /// Persist the outcome of a torn-down run. Returns the failure to signal.
    fn finish_run(&mut self, run: ActiveRun) -> Option<String> {
        let mut failure = run.failure;
        if run.params.free_run {
            return failure;
        }
        self.continue_batch = true;

        let Some(success) = run.outcome else {
            warn!("Run torn down before every worker reported; no metadata written");
            return failure;
        };
        let reports = run.workers.iter().map(WorkerSlot::report).collect();
        let metadata = RunMetadata::for_run(
            &run.params,
            &run.exposure,
            run.index,
            run.started_at,
            success,
            reports,
        );
        let metadata_path = match &run.stem {
            Some(stem) => match self.hardware.storage.save_metadata(stem, &metadata) {
                Ok(path) => Some(path),
                Err(e) => {
                    failure.get_or_insert(format!("Failed to write run metadata: {e}"));
                    None
                }
            },
            None => None,
        };

        if success {
            info!("Run finalized");
        } else {
            warn!("Run finalized with incomplete data");
        }
        self.emit(RunEvent::RunFinalized {
            run_index: run.index,
            success,
            metadata_path,
        });
        failure
    }

    async fn continue_batch(&mut self) {
        if !self.continue_batch || self.state != RunState::Ready {
            return;
        }
        self.continue_batch = false;
        if !self.sequencer.is_multi_run() {
            return;
        }

        match self.sequencer.advance() {
            Some(index) => {
                let Some(params) = self.batch_params.clone() else {
                    return;
                };
                info!(
                    "Starting run {}/{} of the batch",
                    index + 1,
                    self.sequencer.count()
                );
                if let Err(e) = self.start_run(params).await {
                    debug!("Batch halted: {e}");
                }
            }
            None => {
                let runs = self.sequencer.index() + 1;
                info!("Batch finished after {runs} run(s)");
                self.batch_params = None;
                self.emit(RunEvent::BatchFinished { runs });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_outputs_follow_enabled_channels() {
        let stem = Path::new("/data/mouse_00001");
        assert_eq!(
            image_outputs(stem, [true, true]),
            vec![
                PathBuf::from("/data/mouse_00001_led1"),
                PathBuf::from("/data/mouse_00001_led2")
            ]
        );
        assert_eq!(
            image_outputs(stem, [false, true]),
            vec![PathBuf::from("/data/mouse_00001_led2")]
        );
        assert_eq!(image_outputs(stem, [false, false]), vec![stem.to_path_buf()]);
    }
}
