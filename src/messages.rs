//! Message types for actor-based communication
//!
//! Commands travel from [`RunController`](crate::controller::RunController)
//! handles to the single coordination task over an mpsc channel, each with a
//! oneshot for its reply. State changes flow the other way as [`RunEvent`]s on
//! a broadcast channel, so any number of observers (CLI, tests, a GUI) can
//! follow a run without touching controller state.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::oneshot;

use crate::barrier::CompletionTally;
use crate::controller::RunState;
use crate::error::AppResult;
use crate::timing::RunParameters;
use crate::workers::WorkerReport;

/// Commands that can be sent to the RunControllerActor
#[derive(Debug)]
pub enum RunCommand {
    /// Open cameras and other devices
    Initialize {
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Replace the pending run parameters
    Configure {
        params: Box<RunParameters>,
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Start a timed run (or a multi-run batch)
    Start {
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Start continuous preview with no fixed duration
    StartFreeRun {
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Stop the current run; replies whether a teardown happened
    Stop { response: oneshot::Sender<bool> },

    /// Stop the current run and prevent the batch from continuing
    MultiRunStop { response: oneshot::Sender<bool> },

    /// Leave the error state; replies with the restored state
    AcknowledgeError {
        response: oneshot::Sender<RunState>,
    },

    /// Current state and counters
    GetStatus {
        response: oneshot::Sender<RunStatus>,
    },

    /// Stop any run and release every device
    Uninitialize {
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Uninitialize and end the coordination task
    Shutdown { response: oneshot::Sender<()> },
}

impl RunCommand {
    /// Helper to create an Initialize command
    pub fn initialize() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Initialize { response: tx }, rx)
    }

    /// Helper to create a Configure command
    pub fn configure(params: RunParameters) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Configure {
                params: Box::new(params),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Start command
    pub fn start() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Start { response: tx }, rx)
    }

    /// Helper to create a StartFreeRun command
    pub fn start_free_run() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartFreeRun { response: tx }, rx)
    }

    /// Helper to create a Stop command
    pub fn stop() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { response: tx }, rx)
    }

    /// Helper to create a MultiRunStop command
    pub fn multi_run_stop() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::MultiRunStop { response: tx }, rx)
    }

    /// Helper to create an AcknowledgeError command
    pub fn acknowledge_error() -> (Self, oneshot::Receiver<RunState>) {
        let (tx, rx) = oneshot::channel();
        (Self::AcknowledgeError { response: tx }, rx)
    }

    /// Helper to create a GetStatus command
    pub fn get_status() -> (Self, oneshot::Receiver<RunStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Helper to create an Uninitialize command
    pub fn uninitialize() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Uninitialize { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Notifications broadcast by the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunEvent {
    /// The controller moved between states
    StateChanged {
        /// Previous state
        from: RunState,
        /// New state
        to: RunState,
    },
    /// The master trigger fired; acquisition is running
    Started {
        /// Batch index, in multi-run mode
        run_index: Option<u32>,
        /// Continuous preview
        free_run: bool,
    },
    /// The first worker finished; illumination was switched off
    IlluminationStopped,
    /// A run was torn down and the controller is back to `Ready`
    Stopped,
    /// Every worker of a timed run reported
    RunFinalized {
        /// Batch index, in multi-run mode
        run_index: Option<u32>,
        /// Every worker reached its expected total
        success: bool,
        /// Where the metadata record went
        metadata_path: Option<PathBuf>,
    },
    /// The last run of a multi-run batch finished
    BatchFinished {
        /// Runs that were started
        runs: u32,
    },
    /// The controller entered the error state
    Error {
        /// What went wrong
        message: String,
    },
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    /// Current state
    pub state: RunState,
    /// State to return to after `acknowledge_error()`
    pub previous_state: Option<RunState>,
    /// Batch index of the current run, in multi-run mode
    pub run_index: Option<u32>,
    /// The current run is a free run
    pub free_run: bool,
    /// Barrier counters of the current run
    pub tally: CompletionTally,
    /// Per-worker state of the current run
    pub workers: Vec<WorkerReport>,
    /// Pending run parameters
    pub params: RunParameters,
}
