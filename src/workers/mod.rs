//! Acquisition workers.
//!
//! Each worker is a tokio task that polls one device for one run and hands
//! the data to storage. Workers share nothing with the controller except two
//! channels:
//!
//! - a `watch<bool>` stop signal owned by the [`WorkerHandle`]
//! - an unbounded completion channel on which the worker reports exactly once
//!
//! [`spawn_worker`] guarantees the single report: the worker body returns a
//! [`WorkerOutcome`] and the wrapper turns it into one [`WorkerEvent`], no
//! matter whether the body finished, failed or was stopped.

pub mod behavior;
pub mod electrode;
pub mod image_stack;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::{AppResult, DaqError};

pub use behavior::BehaviorVideoWorker;
pub use electrode::ElectrodeLogWorker;
pub use image_stack::{FrameCheck, FrameLossDetector, ImageStackWorker};

/// Which device a worker drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerKind {
    /// Alternating-illumination image stack
    ImageStack,
    /// Electrode analog trace
    ElectrodeLog,
    /// Behavior camera video
    BehaviorVideo,
}

/// Lifecycle of a worker as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Not yet spawned
    Idle,
    /// Polling its device
    Running,
    /// Reported; `true` if it reached its expected total
    Completed(bool),
    /// Reported with an error
    Failed(String),
}

/// One completion report.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    /// Run the worker belonged to
    pub run_id: u64,
    /// Which worker
    pub worker: WorkerKind,
    /// Items produced (frames or samples)
    pub produced: u64,
    /// Reached its expected total without error
    pub ok: bool,
    /// Error that ended the worker, if any
    pub failure: Option<String>,
}

/// Per-worker line of the run metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReport {
    /// Which worker
    pub worker: WorkerKind,
    /// Expected total; `None` in free run
    pub expected: Option<u64>,
    /// Items produced
    pub produced: u64,
    /// Completed with the full count
    pub ok: bool,
}

/// What a worker body returns.
#[derive(Debug)]
pub struct WorkerOutcome {
    /// Items produced
    pub produced: u64,
    /// Error that ended the loop
    pub result: AppResult<()>,
}

/// Stop signal as seen from inside a worker.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Returns true once stop was requested.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when stop is requested. Never resolves if the handle is
    /// dropped without stopping.
    pub async fn stopped(&mut self) {
        let closed = self.rx.wait_for(|stop| *stop).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Controller-side handle of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    kind: WorkerKind,
    expected_total: Option<u64>,
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Which worker.
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Expected total; `None` in free run.
    pub fn expected_total(&self) -> Option<u64> {
        self.expected_total
    }

    /// Ask the worker to finish early. Idempotent.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Wait for the worker task to exit, aborting it after `timeout`.
    pub async fn join(&mut self, timeout: Duration) {
        let Some(mut join) = self.join.take() else {
            return;
        };
        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{:?} worker task failed: {e}", self.kind),
            Err(_) => {
                warn!(
                    "{:?} worker did not exit within {} ms, aborting",
                    self.kind,
                    timeout.as_millis()
                );
                join.abort();
            }
        }
    }
}

/// Spawn a worker body and wire up its stop signal and completion report.
pub fn spawn_worker<F, Fut>(
    kind: WorkerKind,
    run_id: u64,
    expected_total: Option<u64>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    body: F,
) -> WorkerHandle
where
    F: FnOnce(StopSignal) -> Fut,
    Fut: Future<Output = WorkerOutcome> + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let work = body(StopSignal { rx: stop_rx });

    let span = info_span!("worker", worker = ?kind, run_id);
    let join = tokio::spawn(async move {
        let outcome = work.await;
        let reached = expected_total.map_or(true, |n| outcome.produced >= n);
        let failure = outcome.result.err().map(|e| e.to_string());
        let ok = failure.is_none() && reached;
        match (&failure, expected_total) {
            (Some(reason), _) => error!("{kind:?} worker failed: {reason}"),
            (None, Some(n)) if !reached => {
                warn!("{kind:?} worker stopped after {}/{n}", outcome.produced)
            }
            _ => info!("{kind:?} worker finished with {}", outcome.produced),
        }
        let _ = events.send(WorkerEvent {
            run_id,
            worker: kind,
            produced: outcome.produced,
            ok,
            failure,
        });
    }
    .instrument(span));

    WorkerHandle {
        kind,
        expected_total,
        stop_tx,
        join: Some(join),
    }
}

/// Counts consecutive poll timeouts and escalates past a limit.
#[derive(Debug, Clone)]
pub(crate) struct TimeoutBudget {
    device: &'static str,
    limit: u32,
    consecutive: u32,
}

impl TimeoutBudget {
    pub(crate) fn new(device: &'static str, limit: u32) -> Self {
        Self {
            device,
            limit,
            consecutive: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Record a timeout; an error once more than `limit` happen in a row.
    pub(crate) fn record(&mut self, timeout: &DaqError) -> AppResult<()> {
        self.consecutive += 1;
        warn!("{timeout} ({} in a row)", self.consecutive);
        if self.consecutive > self.limit {
            return Err(DaqError::TimingViolation(format!(
                "{} produced no data for {} consecutive polls",
                self.device, self.consecutive
            )));
        }
        Ok(())
    }
}
