//! End-to-end pipeline runs against scripted camera/detector doubles.

use std::sync::mpsc::Receiver;
use std::time::Duration;

use skytrack::{Command, DepthRate, PipelineBuilder, SessionOutcome};
use telemetry::{FrameProgress, LifecycleEvent, LifecycleState, WarningKind};
use testsupport::{ScriptedCamera, StubDetector};

fn builder(root: &std::path::Path) -> PipelineBuilder {
    PipelineBuilder::new()
        .with_output_root(root)
        .with_progress_capacity(4096)
        .with_pause_poll(Duration::from_millis(10))
}

/// Blocks until the lifecycle stream reports `state`, collecting everything
/// seen on the way.
fn wait_for_state(rx: &Receiver<LifecycleEvent>, state: LifecycleState) -> Vec<LifecycleEvent> {
    let mut seen = Vec::new();
    loop {
        let event = rx
            .recv_timeout(Duration::from_secs(10))
            .unwrap_or_else(|_| panic!("timed out waiting for state {state:?}"));
        let hit = matches!(&event, LifecycleEvent::State { state: s, .. } if *s == state);
        seen.push(event);
        if hit {
            return seen;
        }
    }
}

fn progress_indices(events: &[FrameProgress]) -> Vec<u64> {
    events.iter().map(|p| p.index).collect()
}

#[test]
fn s1_recorded_session_processes_every_frame() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(100);
    let probe = camera.probe();

    let mut handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryFrame)
        .spawn(move || Ok(camera), || Ok(StubDetector::two_targets()));
    let events = handle.take_events();

    handle.send(Command::Start);
    let report = handle.join();

    assert_eq!(report.outcome, SessionOutcome::Ended);
    assert_eq!(report.frames_processed, 100);
    assert_eq!(report.frames_skipped, 0);
    assert_eq!(report.dropped_progress_events, 0);

    let progress: Vec<FrameProgress> = events.progress.try_iter().collect();
    assert_eq!(progress.len(), 100);
    assert_eq!(progress_indices(&progress), (0..100).collect::<Vec<_>>());

    // Terminal lifecycle state is Stopped even though the source ran out.
    let lifecycle: Vec<LifecycleEvent> = events.lifecycle.try_iter().collect();
    let last_state = lifecycle
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::State { state, .. } => Some(*state),
            _ => None,
        })
        .last();
    assert_eq!(last_state, Some(LifecycleState::Stopped));

    // Every frame was a depth frame; the two warm-up grabs retrieve nothing.
    assert_eq!(probe.depth_retrieves(), 100);
}

#[test]
fn s2_depth_decimation_samples_every_sixth_frame() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(600).with_fps(60.0);
    let probe = camera.probe();

    let handle = builder(root.path())
        .with_depth_rate(DepthRate::Hz(10.0))
        .spawn(move || Ok(camera), || Ok(StubDetector::two_targets()));
    handle.send(Command::Start);
    let report = handle.join();

    assert_eq!(report.outcome, SessionOutcome::Ended);
    assert_eq!(report.frames_processed, 600);
    // interval = round(60 / 10) = 6 -> indices 0, 6, ..., 594.
    assert_eq!(probe.depth_retrieves(), 100);

    // Detection counts are independent of the depth schedule.
    let root2 = tempfile::tempdir().unwrap();
    let camera2 = ScriptedCamera::recorded(600).with_fps(60.0);
    let handle2 = builder(root2.path())
        .with_depth_rate(DepthRate::EveryFrame)
        .spawn(move || Ok(camera2), || Ok(StubDetector::two_targets()));
    handle2.send(Command::Start);
    let report2 = handle2.join();
    assert_eq!(report.detections_total, report2.detections_total);
    assert_eq!(report.frames_with_detections, report2.frames_with_detections);
}

#[test]
fn s3_pause_skip_resume_lands_exactly_n_frames_ahead() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(50).with_grab_delay(Duration::from_millis(5));

    let mut handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryFrame)
        .spawn(move || Ok(camera), || Ok(StubDetector::two_targets()));
    let events = handle.take_events();
    handle.send(Command::Start);

    let mut seen: Vec<u64> = Vec::new();
    loop {
        let p = events
            .progress
            .recv_timeout(Duration::from_secs(10))
            .expect("progress before pause");
        seen.push(p.index);
        if p.index >= 10 {
            break;
        }
    }
    handle.send(Command::Pause);
    wait_for_state(&events.lifecycle, LifecycleState::Paused);
    // Frames that were in flight when the pause was enqueued still emit.
    seen.extend(events.progress.try_iter().map(|p| p.index));
    let last = *seen.last().unwrap();
    assert!(last < 29, "pause landed too late for the scenario ({last})");

    handle.send(Command::Skip { frames: 20 });
    handle.send(Command::Resume);

    let report = handle.join();
    let after: Vec<u64> = events.progress.try_iter().map(|p| p.index).collect();

    assert_eq!(after.first(), Some(&(last + 20)));
    assert!(after.windows(2).all(|w| w[0] < w[1]), "indices not increasing");
    assert!(
        seen.iter().chain(after.iter()).all(|&i| i <= last || i >= last + 20),
        "an index inside the skipped range was emitted"
    );
    assert_eq!(*after.last().unwrap(), 49);
    // (last + 1) frames before the skip, (50 - (last + 20)) after.
    assert_eq!(report.frames_processed, 31);
    assert_eq!(report.outcome, SessionOutcome::Ended);
}

#[test]
fn s6_skip_on_live_source_is_rejected_without_state_change() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::live().with_grab_delay(Duration::from_millis(2));

    let mut handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryN(6))
        .spawn(move || Ok(camera), || Ok(StubDetector::never_detects()));
    let events = handle.take_events();

    handle.send(Command::Start);
    wait_for_state(&events.lifecycle, LifecycleState::Running);
    handle.send(Command::Pause);
    wait_for_state(&events.lifecycle, LifecycleState::Paused);

    handle.send(Command::Skip { frames: 5 });
    let rejection = events
        .lifecycle
        .recv_timeout(Duration::from_secs(10))
        .expect("rejection event");
    match rejection {
        LifecycleEvent::CommandRejected { command, reason } => {
            assert_eq!(command, "Skip");
            assert!(reason.contains("SkipOnLive"), "reason was {reason}");
        }
        other => panic!("expected CommandRejected, got {other:?}"),
    }

    handle.send(Command::Stop);
    let report = handle.join();
    assert_eq!(report.outcome, SessionOutcome::Stopped);

    // No Running transition happened between the rejection and the stop.
    let states: Vec<LifecycleState> = events
        .lifecycle
        .try_iter()
        .filter_map(|e| match e {
            LifecycleEvent::State { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![LifecycleState::Stopped]);
}

#[test]
fn skip_past_end_clamps_to_last_frame_with_warning() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(30).with_grab_delay(Duration::from_millis(5));

    let mut handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryFrame)
        .spawn(move || Ok(camera), || Ok(StubDetector::never_detects()));
    let events = handle.take_events();
    handle.send(Command::Start);

    let mut last = 0;
    loop {
        let p = events
            .progress
            .recv_timeout(Duration::from_secs(10))
            .expect("progress");
        last = p.index;
        if p.index >= 5 {
            break;
        }
    }
    handle.send(Command::Pause);
    wait_for_state(&events.lifecycle, LifecycleState::Paused);
    last = events.progress.try_iter().map(|p| p.index).last().unwrap_or(last);
    assert!(last < 28);

    handle.send(Command::Skip { frames: 1000 });
    handle.send(Command::Resume);
    let report = handle.join();

    let clamped = events.lifecycle.try_iter().any(|e| {
        matches!(e, LifecycleEvent::Warning { kind: WarningKind::SkipClamped, .. })
    });
    assert!(clamped, "expected a SkipClamped warning");

    let after: Vec<u64> = events.progress.try_iter().map(|p| p.index).collect();
    assert_eq!(after, vec![29]);
    assert_eq!(report.outcome, SessionOutcome::Ended);
}

#[test]
fn pause_resume_without_other_commands_preserves_the_index_sequence() {
    let run = |pause: bool| -> Vec<u64> {
        let root = tempfile::tempdir().unwrap();
        let camera = ScriptedCamera::recorded(40).with_grab_delay(Duration::from_millis(3));
        let mut handle = builder(root.path())
            .with_depth_rate(DepthRate::EveryFrame)
            .spawn(move || Ok(camera), || Ok(StubDetector::two_targets()));
        let events = handle.take_events();
        handle.send(Command::Start);

        let mut indices = Vec::new();
        if pause {
            loop {
                let p = events
                    .progress
                    .recv_timeout(Duration::from_secs(10))
                    .expect("progress");
                indices.push(p.index);
                if p.index >= 10 {
                    break;
                }
            }
            handle.send(Command::Pause);
            wait_for_state(&events.lifecycle, LifecycleState::Paused);
            handle.send(Command::Resume);
        }
        handle.join();
        indices.extend(events.progress.try_iter().map(|p| p.index));
        indices
    };

    assert_eq!(run(false), run(true));
}

#[test]
fn reconfigure_depth_mid_run_is_idempotent_and_takes_effect_next_frame() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(50)
        .with_fps(60.0)
        .with_grab_delay(Duration::from_millis(3));
    let probe = camera.probe();

    let mut handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryFrame)
        .spawn(move || Ok(camera), || Ok(StubDetector::never_detects()));
    let events = handle.take_events();
    handle.send(Command::Start);

    let mut last = 0;
    loop {
        let p = events
            .progress
            .recv_timeout(Duration::from_secs(10))
            .expect("progress");
        last = p.index;
        if p.index >= 8 {
            break;
        }
    }
    handle.send(Command::Pause);
    wait_for_state(&events.lifecycle, LifecycleState::Paused);
    last = events.progress.try_iter().map(|p| p.index).last().unwrap_or(last);

    // Applying the same reconfiguration twice has the effect of applying it
    // once.
    handle.send(Command::ReconfigureDepth(DepthRate::Hz(10.0)));
    handle.send(Command::ReconfigureDepth(DepthRate::Hz(10.0)));
    handle.send(Command::Resume);
    handle.join();

    // Every frame up to the pause retrieved depth; afterwards only indices
    // divisible by six did.
    let expected_after = ((last + 1)..50).filter(|i| i % 6 == 0).count() as u64;
    assert_eq!(probe.depth_retrieves(), last + 1 + expected_after);
}

#[test]
fn stage_shares_reported_after_warmup_sum_to_one_hundred() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(30).with_grab_delay(Duration::from_millis(1));

    let mut handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryFrame)
        .spawn(move || Ok(camera), || Ok(StubDetector::two_targets()));
    let events = handle.take_events();
    handle.send(Command::Start);
    handle.join();

    let progress: Vec<FrameProgress> = events.progress.try_iter().collect();
    let early = &progress[0].stage_shares;
    assert!(early.warming);

    let late = &progress.last().unwrap().stage_shares;
    assert!(!late.warming);
    let sum = late.grab_pct + late.infer_pct + late.depth_pct + late.housekeeping_pct;
    assert!((sum - 100.0).abs() < 0.1, "shares sum to {sum}");
    assert!(progress.iter().all(|p| p.wall_ms >= 0.0));
}
