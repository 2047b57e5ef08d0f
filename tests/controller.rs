//! End-to-end runs of the controller against the simulated rig.

use run_daq::config::Settings;
use run_daq::controller::{RunController, RunState};
use run_daq::error::DaqError;
use run_daq::hardware::mock::{FaultStep, MockRig};
use run_daq::messages::RunEvent;
use run_daq::timing::{MultiRun, RunParameters};
use run_daq::workers::WorkerKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};

/// 0.5 s baseline, 10 pulses at 20 Hz, 0.5 s post: 1.5 s in total.
fn short_run() -> RunParameters {
    RunParameters {
        master_frequency: 50.0,
        baseline_delay: 0.5,
        stimulation_enabled: true,
        stimulation_high_time: 0.025,
        stimulation_low_time: 0.025,
        stimulation_pulse_count: 10,
        post_stimulation_duration: 0.5,
        electrode_sample_rate: 1000.0,
        ..RunParameters::default()
    }
}

fn settings(run: RunParameters) -> Settings {
    let mut settings = Settings::default();
    settings.output.base_path = PathBuf::from("/data");
    settings.output.run_name = "mouse".to_string();
    settings.run = run;
    settings
}

async fn ready(rig: &MockRig, run: RunParameters) -> (RunController, broadcast::Receiver<RunEvent>) {
    let (controller, _task) = RunController::spawn(settings(run), rig.hardware());
    let events = controller.subscribe();
    controller.initialize().await.unwrap();
    (controller, events)
}

async fn next_matching(
    events: &mut broadcast::Receiver<RunEvent>,
    matches: impl Fn(&RunEvent) -> bool,
) -> RunEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn drain(events: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn test_timed_run_finalizes_with_every_output() {
    let rig = MockRig::new();
    let (controller, mut events) = ready(&rig, short_run()).await;
    assert_eq!(controller.state().await.unwrap(), RunState::Ready);

    controller.start().await.unwrap();
    let finalized = next_matching(&mut events, |e| matches!(e, RunEvent::RunFinalized { .. })).await;
    assert_eq!(
        finalized,
        RunEvent::RunFinalized {
            run_index: None,
            success: true,
            metadata_path: Some(PathBuf::from("/data/mouse.json")),
        }
    );
    next_matching(&mut events, |e| *e == RunEvent::Stopped).await;
    assert_eq!(controller.state().await.unwrap(), RunState::Ready);

    // 75 master periods alternate between the two illumination stacks
    let led1 = rig.storage.stack(Path::new("/data/mouse_led1")).unwrap();
    let led2 = rig.storage.stack(Path::new("/data/mouse_led2")).unwrap();
    assert_eq!((led1.len(), led2.len()), (38, 37));
    assert_eq!(&led1[..3], &[0, 2, 4]);
    assert_eq!(&led2[..3], &[1, 3, 5]);
    assert_eq!(
        rig.storage.video_frames(Path::new("/data/mouse_behavior")),
        Some(37)
    );
    assert_eq!(
        rig.storage
            .samples(Path::new("/data/mouse_electrode"))
            .unwrap()
            .len(),
        1500
    );

    let records = rig.storage.metadata();
    assert_eq!(records.len(), 1);
    let (stem, metadata) = &records[0];
    assert_eq!(stem, Path::new("/data/mouse"));
    assert!(metadata.success);
    assert_eq!(metadata.master_trigger_frequency, 50.0);
    assert_eq!(metadata.illumination_frequency, 25.0);
    assert_eq!(metadata.stimulation.pulse_frequency, 20.0);
    assert_eq!(metadata.stimulation.pulse_count, 10);
    assert!((metadata.timing.total - 1.5).abs() < 1e-9);
    assert!(metadata.exposure_time > 0.0 && metadata.exposure_time < 0.02);
    assert_eq!(metadata.workers.len(), 3);
    assert!(metadata.workers.iter().all(|w| w.ok));
}

#[tokio::test(start_paused = true)]
async fn test_every_dependent_is_armed_before_the_master() {
    let rig = MockRig::new();
    let (controller, mut events) = ready(&rig, short_run()).await;

    controller.start().await.unwrap();
    next_matching(&mut events, |e| matches!(e, RunEvent::Started { .. })).await;

    let trace = &rig.trace;
    let master = trace.position("master.start").unwrap();
    for armed in [
        "image_camera.set_exposure",
        "image_camera.start_acquisition",
        "behavior_camera.start_acquisition",
        "illumination1.arm",
        "illumination2.arm",
        "stimulation.arm",
        "behavior_trigger.arm",
        "electrode.configure",
        "electrode.arm",
    ] {
        let at = trace
            .position(armed)
            .unwrap_or_else(|| panic!("{armed} missing from {:?}", trace.entries()));
        assert!(at < master, "{armed} after master.start: {:?}", trace.entries());
    }
    assert_eq!(trace.count("master.start"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_first_finished_worker_switches_illumination_off() {
    let rig = MockRig::new();
    let (controller, mut events) = ready(&rig, short_run()).await;

    controller.start().await.unwrap();
    next_matching(&mut events, |e| *e == RunEvent::IlluminationStopped).await;

    // The behavior stack finishes first (37 frames at 25 fps); the master
    // keeps running for the other workers.
    let trace = &rig.trace;
    assert!(trace.position("illumination1.stop").is_some());
    assert!(trace.position("illumination2.clear").is_some());
    assert!(trace.position("master.stop").is_none());

    next_matching(&mut events, |e| matches!(e, RunEvent::RunFinalized { .. })).await;
    assert!(trace.position("master.stop").is_some());
    assert_eq!(trace.count("illumination1.stop"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let rig = MockRig::new();
    let (controller, mut events) = ready(&rig, short_run()).await;

    controller.start().await.unwrap();
    next_matching(&mut events, |e| matches!(e, RunEvent::Started { .. })).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(controller.stop().await.unwrap());
    assert!(!controller.stop().await.unwrap());

    let seen = drain(&mut events);
    assert_eq!(seen.iter().filter(|e| **e == RunEvent::Stopped).count(), 1);
    assert!(seen.contains(&RunEvent::RunFinalized {
        run_index: None,
        success: false,
        metadata_path: Some(PathBuf::from("/data/mouse.json")),
    }));
    assert_eq!(controller.state().await.unwrap(), RunState::Ready);

    // Master first, then dependents, then the electrode input, then cameras
    let trace = &rig.trace;
    assert_eq!(trace.count("master.stop"), 1);
    let master = trace.position("master.stop").unwrap();
    let stimulation = trace.position("stimulation.stop").unwrap();
    let electrode = trace.position("electrode.stop").unwrap();
    let camera = trace.position("image_camera.stop_acquisition").unwrap();
    assert!(master < stimulation && stimulation < electrode && electrode < camera);
    assert!(trace.position("master.clear").is_some());

    let (_, metadata) = &rig.storage.metadata()[0];
    let image = metadata
        .workers
        .iter()
        .find(|w| w.worker == WorkerKind::ImageStack)
        .unwrap();
    assert_eq!(image.expected, Some(75));
    assert!(image.produced < 75);
}

#[tokio::test(start_paused = true)]
async fn test_baseline_only_run_at_50_hz() {
    let rig = MockRig::new();
    let params = RunParameters {
        master_frequency: 50.0,
        baseline_delay: 10.0,
        stimulation_enabled: false,
        ..RunParameters::default()
    };
    let (controller, mut events) = ready(&rig, params).await;

    controller.start().await.unwrap();
    next_matching(&mut events, |e| matches!(e, RunEvent::RunFinalized { .. })).await;

    let (_, metadata) = &rig.storage.metadata()[0];
    assert!(metadata.success);
    assert_eq!(metadata.timing.total, 10.0);
    assert_eq!(metadata.illumination_frequency, 25.0);
    assert!(!metadata.stimulation.enabled);
    let expected: Vec<_> = metadata.workers.iter().map(|w| (w.worker, w.expected)).collect();
    assert!(expected.contains(&(WorkerKind::ImageStack, Some(500))));
    assert!(expected.contains(&(WorkerKind::BehaviorVideo, Some(250))));
    assert!(expected.contains(&(WorkerKind::ElectrodeLog, Some(100_000))));
    assert_eq!(rig.trace.position("stimulation.create"), None);
}

#[tokio::test(start_paused = true)]
async fn test_multi_run_names_each_run() {
    let rig = MockRig::new();
    let params = RunParameters {
        multi_run: MultiRun {
            enabled: true,
            count: 3,
        },
        ..short_run()
    };
    let (controller, mut events) = ready(&rig, params).await;

    controller.start().await.unwrap();
    let finished = next_matching(&mut events, |e| matches!(e, RunEvent::BatchFinished { .. })).await;
    assert_eq!(finished, RunEvent::BatchFinished { runs: 3 });

    let records = rig.storage.metadata();
    let stems: Vec<&Path> = records.iter().map(|(stem, _)| stem.as_path()).collect();
    assert_eq!(
        stems,
        vec![
            Path::new("/data/mouse_00000"),
            Path::new("/data/mouse_00001"),
            Path::new("/data/mouse_00002"),
        ]
    );
    let indices: Vec<_> = records.iter().map(|(_, m)| m.run_index).collect();
    assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
    assert!(records.iter().all(|(_, m)| m.success));
    assert!(rig
        .storage
        .stack(Path::new("/data/mouse_00002_led2"))
        .is_some());
    assert_eq!(rig.trace.count("master.start"), 3);
    assert_eq!(controller.state().await.unwrap(), RunState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_multi_run_stop_prevents_the_next_run() {
    let rig = MockRig::new();
    let params = RunParameters {
        multi_run: MultiRun {
            enabled: true,
            count: 3,
        },
        ..short_run()
    };
    let (controller, mut events) = ready(&rig, params).await;

    controller.start().await.unwrap();
    next_matching(&mut events, |e| {
        *e == RunEvent::Started {
            run_index: Some(1),
            free_run: false,
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(controller.multi_run_stop().await.unwrap());

    let finished = next_matching(&mut events, |e| matches!(e, RunEvent::BatchFinished { .. })).await;
    assert_eq!(finished, RunEvent::BatchFinished { runs: 2 });

    // Nothing else happens after the batch ends.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let records = rig.storage.metadata();
    assert_eq!(records.len(), 2);
    assert!(!records[1].1.success);
    assert!(rig
        .storage
        .stack_stems()
        .iter()
        .all(|stem| !stem.to_string_lossy().contains("_00002")));
    assert_eq!(rig.trace.count("master.start"), 2);
    assert_eq!(controller.state().await.unwrap(), RunState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_unachievable_timing_is_refused_before_touching_hardware() {
    let rig = MockRig::new();
    let (controller, mut events) = ready(&rig, short_run()).await;

    // A 1 ms period leaves no room for the 1 ms blank time.
    controller
        .configure(RunParameters {
            master_frequency: 1000.0,
            ..short_run()
        })
        .await
        .unwrap();
    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, DaqError::Configuration(_)), "{err}");

    let entries = rig.trace.entries();
    assert!(
        entries.iter().all(|entry| entry.ends_with(".open")),
        "hardware touched: {entries:?}"
    );
    next_matching(&mut events, |e| matches!(e, RunEvent::Error { .. })).await;

    let status = controller.status().await.unwrap();
    assert_eq!(status.state, RunState::Error);
    assert_eq!(status.previous_state, Some(RunState::Ready));
    assert!(matches!(
        controller.start().await,
        Err(DaqError::InvalidState { .. })
    ));

    assert_eq!(controller.acknowledge_error().await.unwrap(), RunState::Ready);
    assert_eq!(controller.state().await.unwrap(), RunState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_lost_frame_fails_the_run() {
    let mut rig = MockRig::new();
    rig.image_camera.skip_stamp_at = Some(10);
    let (controller, mut events) = ready(&rig, short_run()).await;

    controller.start().await.unwrap();
    let finalized = next_matching(&mut events, |e| matches!(e, RunEvent::RunFinalized { .. })).await;
    assert!(matches!(finalized, RunEvent::RunFinalized { success: false, .. }));

    let error = next_matching(&mut events, |e| matches!(e, RunEvent::Error { .. })).await;
    let RunEvent::Error { message } = error else {
        unreachable!()
    };
    assert!(message.contains("lost frame"), "{message}");
    assert_eq!(controller.state().await.unwrap(), RunState::Error);

    // Data already written is kept.
    let led1 = rig.storage.stack(Path::new("/data/mouse_led1")).unwrap();
    assert_eq!(led1.len(), 5);
    assert_eq!(controller.acknowledge_error().await.unwrap(), RunState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_late_frame_does_not_fail_the_run() {
    let mut rig = MockRig::new();
    rig.image_camera.late_frame = Some((20, 0.8));
    let (controller, mut events) = ready(&rig, short_run()).await;

    controller.start().await.unwrap();
    let finalized = next_matching(&mut events, |e| matches!(e, RunEvent::RunFinalized { .. })).await;
    assert!(matches!(finalized, RunEvent::RunFinalized { success: true, .. }));
    next_matching(&mut events, |e| *e == RunEvent::Stopped).await;
    assert_eq!(controller.state().await.unwrap(), RunState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_arming_failure_tears_everything_down() {
    let mut rig = MockRig::new();
    rig.fail_electrode_arm = true;
    let (controller, _events) = ready(&rig, short_run()).await;

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, DaqError::Device(_)), "{err}");

    let trace = &rig.trace;
    assert_eq!(trace.position("master.start"), None);
    assert!(trace.position("illumination1.clear").is_some());
    assert!(trace.position("master.clear").is_some());
    assert!(trace.position("image_camera.stop_acquisition").is_some());
    assert!(rig.storage.metadata().is_empty());
    assert_eq!(controller.state().await.unwrap(), RunState::Error);
}

fn error_messages(events: &[RunEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Error { message } => Some(message.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_with_teardown_fault_signals_once() {
    let mut rig = MockRig::new();
    rig.image_camera.skip_stamp_at = Some(3);
    rig.triggers.fault = Some(("stimulation".to_string(), FaultStep::Stop));
    let (controller, mut events) = ready(&rig, short_run()).await;

    controller.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(controller.state().await.unwrap(), RunState::Error);

    let seen = drain(&mut events);
    assert!(seen.contains(&RunEvent::Stopped));
    let errors = error_messages(&seen);
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("lost frame"), "{}", errors[0]);
}

#[tokio::test(start_paused = true)]
async fn test_arming_failure_signals_once() {
    let mut rig = MockRig::new();
    rig.fail_electrode_arm = true;
    rig.triggers.fault = Some(("stimulation".to_string(), FaultStep::Stop));
    let (controller, mut events) = ready(&rig, short_run()).await;

    controller.start().await.unwrap_err();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let seen = drain(&mut events);
    let errors = error_messages(&seen);
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].starts_with("Failed to start run"), "{}", errors[0]);
    assert_eq!(controller.state().await.unwrap(), RunState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_missing_first_frame_fails_the_run() {
    let mut rig = MockRig::new();
    rig.image_camera.skip_stamp_at = Some(0);
    let (controller, mut events) = ready(&rig, short_run()).await;

    controller.start().await.unwrap();
    let error = next_matching(&mut events, |e| matches!(e, RunEvent::Error { .. })).await;
    let RunEvent::Error { message } = error else {
        unreachable!()
    };
    assert!(message.contains("lost frame before #0"), "{message}");
    assert!(rig.storage.stack(Path::new("/data/mouse_led1")).unwrap_or_default().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_free_run_previews_without_writing() {
    let rig = MockRig::new();
    let (controller, mut events) = ready(&rig, short_run()).await;
    let mut electrode_preview = controller.subscribe_electrode_preview();
    let mut behavior_preview = controller.subscribe_behavior_preview();

    controller.start_free_run().await.unwrap();
    next_matching(&mut events, |e| {
        *e == RunEvent::Started {
            run_index: None,
            free_run: true,
        }
    })
    .await;
    // Far beyond the 1.5 s a timed run would last
    tokio::time::sleep(Duration::from_secs(5)).await;

    let status = controller.status().await.unwrap();
    assert_eq!(status.state, RunState::Capturing);
    assert!(status.free_run);
    assert!(matches!(
        controller.configure(short_run()).await,
        Err(DaqError::InvalidState { .. })
    ));
    // Lagging behind counts as having received something.
    assert!(!matches!(electrode_preview.try_recv(), Err(TryRecvError::Empty)));
    assert!(!matches!(behavior_preview.try_recv(), Err(TryRecvError::Empty)));

    assert!(controller.stop().await.unwrap());
    let seen = drain(&mut events);
    assert!(!seen
        .iter()
        .any(|e| matches!(e, RunEvent::RunFinalized { .. })));
    assert!(rig.storage.metadata().is_empty());
    assert!(rig.storage.stack_stems().is_empty());
    assert_eq!(controller.state().await.unwrap(), RunState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_operations_require_the_right_state() {
    let rig = MockRig::new();
    let (controller, _task) = RunController::spawn(settings(short_run()), rig.hardware());

    assert!(matches!(
        controller.start().await,
        Err(DaqError::InvalidState {
            operation: "start",
            state: RunState::Uninitialized
        })
    ));
    controller.initialize().await.unwrap();
    assert!(matches!(
        controller.initialize().await,
        Err(DaqError::InvalidState { .. })
    ));
    assert!(!controller.stop().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_failed_open_returns_to_uninitialized() {
    let mut rig = MockRig::new();
    rig.image_camera.fail_open = true;
    let (controller, _task) = RunController::spawn(settings(short_run()), rig.hardware());
    let mut events = controller.subscribe();

    assert!(controller.initialize().await.is_err());
    let seen = drain(&mut events);
    assert!(seen.contains(&RunEvent::StateChanged {
        from: RunState::Initializing,
        to: RunState::Uninitialized,
    }));
    assert_eq!(controller.state().await.unwrap(), RunState::Error);
    assert_eq!(
        controller.acknowledge_error().await.unwrap(),
        RunState::Uninitialized
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_the_run_and_ends_the_task() {
    let rig = MockRig::new();
    let (controller, task) = RunController::spawn(settings(short_run()), rig.hardware());
    let mut events = controller.subscribe();
    controller.initialize().await.unwrap();
    controller.start().await.unwrap();
    next_matching(&mut events, |e| matches!(e, RunEvent::Started { .. })).await;

    controller.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(rig.trace.position("master.stop").is_some());
    assert!(rig.trace.position("image_camera.close").is_some());
    assert!(rig.trace.position("behavior_camera.close").is_some());
    assert!(matches!(
        controller.state().await,
        Err(DaqError::ControllerUnavailable)
    ));
}
