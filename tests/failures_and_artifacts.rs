//! Failure handling, artifact emission and the stats.json contract.

use std::time::Duration;

use skytrack::writer::parse_label_line;
use skytrack::{
    Command, DepthRate, DetectorError, FatalError, PipelineBuilder, RunSettings, SessionOutcome,
    WriterConfig,
};
use telemetry::{LifecycleEvent, LifecycleState, WarningKind};
use testsupport::{DepthScript, ScriptedCamera, StubDetector};

fn builder(root: &std::path::Path) -> PipelineBuilder {
    PipelineBuilder::new()
        .with_output_root(root)
        .with_progress_capacity(4096)
        .with_pause_poll(Duration::from_millis(10))
        .with_settings(RunSettings {
            source: "scripted".to_string(),
            depth_preset: "balanced".to_string(),
            depth_schedule: "every_frame".to_string(),
            confidence_threshold: 0.25,
        })
}

fn read_stats(path: &std::path::Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn s4_all_nan_depth_yields_sentinels_but_frames_count_as_detected() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(20).with_depth(DepthScript::AllNaN);

    let mut handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryFrame)
        .with_writer(WriterConfig {
            save_annotated: false,
            save_labels: true,
            jpeg_quality: 85,
            font_path: std::path::PathBuf::new(),
        })
        .spawn(move || Ok(camera), || Ok(StubDetector::two_targets()));
    let events = handle.take_events();
    handle.send(Command::Start);
    let report = handle.join();

    assert_eq!(report.outcome, SessionOutcome::Ended);
    assert_eq!(report.frames_with_detections, 20);
    assert_eq!(report.frames_empty, 0);
    assert!(events.progress.try_iter().all(|p| p.depth_mean_m.is_none()));
    assert_eq!(report.writer.io_errors, 0);
    assert_eq!(report.writer.jpeg_written, 0);
    assert_eq!(
        report.writer.txt_written + report.writer.drops,
        20,
        "every frame either wrote a label or was dropped by backpressure"
    );
}

#[test]
fn s5_engine_load_failure_fails_fast_with_no_output_residue() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(10);

    let mut handle = builder(root.path())
        .spawn(move || Ok(camera), || {
            Err::<StubDetector, _>(DetectorError::EngineLoad("missing engine".to_string()))
        });
    let events = handle.take_events();
    handle.send(Command::Start);
    let report = handle.join();

    assert_eq!(
        report.outcome,
        SessionOutcome::Failed(FatalError::EngineLoadFailure)
    );
    assert!(report.stats_path.is_none());
    assert_eq!(report.frames_processed, 0);

    let failed = events.lifecycle.try_iter().any(|e| matches!(
        e,
        LifecycleEvent::State { state: LifecycleState::Failed, reason: Some(ref r) } if r == "EngineLoadFailure"
    ));
    assert!(failed, "expected a Failed lifecycle event with reason");

    // No session directory was created.
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[test]
fn camera_open_failure_maps_to_fatal_taxonomy() {
    let root = tempfile::tempdir().unwrap();
    let handle = builder(root.path()).spawn(
        || {
            Err::<ScriptedCamera, _>(skytrack::CameraError::InvalidSession(
                "corrupt file".to_string(),
            ))
        },
        || Ok(StubDetector::never_detects()),
    );
    let report = handle.join();
    assert_eq!(
        report.outcome,
        SessionOutcome::Failed(FatalError::InvalidSession)
    );
}

#[test]
fn transient_grab_and_infer_errors_skip_frames_and_are_counted() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(20).with_transient_at(vec![3, 7]);
    // 18 successful grabs; the 6th infer call (index 6 after the hole at 3)
    // fails transiently.
    let detector = StubDetector::two_targets().with_fail_on_calls(vec![5]);

    let mut handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryFrame)
        .spawn(move || Ok(camera), move || Ok(detector));
    let events = handle.take_events();
    handle.send(Command::Start);
    let report = handle.join();

    assert_eq!(report.outcome, SessionOutcome::Ended);
    assert_eq!(report.frames_processed, 17);
    assert_eq!(report.frames_skipped, 3);

    let indices: Vec<u64> = events.progress.try_iter().map(|p| p.index).collect();
    assert!(indices.windows(2).all(|w| w[0] < w[1]));
    for hole in [3u64, 6, 7] {
        assert!(!indices.contains(&hole), "index {hole} should be a hole");
    }

    let stats = read_stats(&report.stats_path.unwrap());
    assert_eq!(stats["errors"]["grab_transient"], 2);
    assert_eq!(stats["errors"]["infer_transient"], 1);
    assert_eq!(stats["counts"]["frames_skipped"], 3);
}

#[test]
fn depth_retrieval_failure_degrades_to_sentinel_until_next_depth_frame() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(12)
        .with_depth(DepthScript::Uniform(8.0))
        .with_depth_fail_at(vec![0]);

    let mut handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryN(6))
        .spawn(move || Ok(camera), || Ok(StubDetector::two_targets()));
    let events = handle.take_events();
    handle.send(Command::Start);
    let report = handle.join();

    let progress: Vec<_> = events.progress.try_iter().collect();
    assert_eq!(progress.len(), 12);
    for p in &progress {
        if p.index < 6 {
            assert!(p.depth_mean_m.is_none(), "frame {} had depth", p.index);
        } else {
            let mean = p.depth_mean_m.expect("depth after the first good sample");
            assert!((mean - 8.0).abs() < 1e-4);
        }
    }

    let warned = events.lifecycle.try_iter().any(|e| {
        matches!(e, LifecycleEvent::Warning { kind: WarningKind::DepthRetrieveFailed, .. })
    });
    assert!(warned);

    let stats = read_stats(&report.stats_path.unwrap());
    assert_eq!(stats["errors"]["depth_retrieve"], 1);
}

#[test]
fn stale_depth_reuse_warns_once_per_episode() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(80);

    let mut handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryN(100))
        .with_staleness_frames(30)
        .spawn(move || Ok(camera), || Ok(StubDetector::two_targets()));
    let events = handle.take_events();
    handle.send(Command::Start);
    handle.join();

    let stale_warnings = events
        .lifecycle
        .try_iter()
        .filter(|e| matches!(e, LifecycleEvent::Warning { kind: WarningKind::DepthMapStale, .. }))
        .count();
    assert_eq!(stale_warnings, 1);
}

#[test]
fn artifacts_and_stats_land_in_the_session_directory() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(10).with_grab_delay(Duration::from_millis(4));

    let handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryFrame)
        .with_writer(WriterConfig {
            save_annotated: true,
            save_labels: true,
            jpeg_quality: 85,
            font_path: std::path::PathBuf::from("/nonexistent.ttf"),
        })
        .spawn(move || Ok(camera), || Ok(StubDetector::two_targets()));
    handle.send(Command::Start);
    let report = handle.join();

    let stats_path = report.stats_path.clone().unwrap();
    let session_dir = stats_path.parent().unwrap();
    assert!(session_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("session_"));

    let frames_dir = session_dir.join("frames");
    let jpgs = std::fs::read_dir(&frames_dir)
        .unwrap()
        .filter(|e| {
            e.as_ref().unwrap().path().extension().map(|x| x == "jpg").unwrap_or(false)
        })
        .count() as u64;
    let txts: Vec<std::path::PathBuf> = std::fs::read_dir(&frames_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map(|x| x == "txt").unwrap_or(false))
        .collect();

    assert_eq!(jpgs, report.writer.jpeg_written);
    assert_eq!(txts.len() as u64, report.writer.txt_written);
    assert!(report.writer.jpeg_written >= 1);

    // Written labels decode back to the stubbed detections.
    let content = std::fs::read_to_string(&txts[0]).unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    let (class_id, cx, cy, w, h) = parse_label_line(lines[0]).unwrap();
    assert_eq!(class_id, 0);
    for v in [cx, cy, w, h] {
        assert!((0.0..=1.0).contains(&v));
    }

    let stats = read_stats(&stats_path);
    assert_eq!(stats["writer"]["jpeg_written"].as_u64().unwrap(), report.writer.jpeg_written);
    assert_eq!(stats["session"]["outcome"], "ended");
}

#[test]
fn stats_json_is_written_iff_the_session_reached_running() {
    // Reached Running, zero frames processed: stats.json still appears.
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::live().with_grab_delay(Duration::from_millis(2));
    let mut handle = builder(root.path())
        .spawn(move || Ok(camera), || Ok(StubDetector::never_detects()));
    let events = handle.take_events();
    handle.send(Command::Start);
    // Stop as soon as Running is observed.
    loop {
        match events.lifecycle.recv_timeout(Duration::from_secs(10)).unwrap() {
            LifecycleEvent::State { state: LifecycleState::Running, .. } => break,
            _ => continue,
        }
    }
    handle.send(Command::Stop);
    let report = handle.join();
    assert_eq!(report.outcome, SessionOutcome::Stopped);
    let stats_path = report.stats_path.expect("stats for a Running session");
    assert!(stats_path.exists());
    let stats = read_stats(&stats_path);
    assert_eq!(stats["session"]["outcome"], "stopped");

    // Stopped from Ready: never Running, no stats.json, no residue.
    let root2 = tempfile::tempdir().unwrap();
    let camera2 = ScriptedCamera::recorded(10);
    let handle2 = builder(root2.path())
        .spawn(move || Ok(camera2), || Ok(StubDetector::never_detects()));
    handle2.send(Command::Stop);
    let report2 = handle2.join();
    assert_eq!(report2.outcome, SessionOutcome::Stopped);
    assert!(report2.stats_path.is_none());
    assert_eq!(std::fs::read_dir(root2.path()).unwrap().count(), 0);
}

#[test]
fn fatal_mid_run_still_flushes_stats_with_failed_outcome() {
    let root = tempfile::tempdir().unwrap();
    let camera = ScriptedCamera::recorded(20).with_fatal_at(10);

    let handle = builder(root.path())
        .with_depth_rate(DepthRate::EveryFrame)
        .spawn(move || Ok(camera), || Ok(StubDetector::two_targets()));
    handle.send(Command::Start);
    let report = handle.join();

    assert!(matches!(report.outcome, SessionOutcome::Failed(FatalError::CameraFault(_))));
    assert_eq!(report.frames_processed, 10);

    let stats = read_stats(&report.stats_path.expect("stats after fatal mid-run"));
    assert_eq!(stats["session"]["outcome"], "failed");
    assert!(stats["session"]["reason"].as_str().unwrap().contains("CameraFault"));
    assert_eq!(stats["counts"]["frames_processed"], 10);

    // Share percentages in the summary sum to 100 within tolerance.
    let shares: f64 = ["grab", "infer", "depth", "housekeeping"]
        .iter()
        .map(|s| stats["timing_ms"][s]["share_pct"].as_f64().unwrap())
        .sum();
    assert!((shares - 100.0).abs() < 0.1);

    // Wall time bounds the sum of per-stage means.
    let stage_sum: f64 = ["grab", "infer", "depth", "housekeeping"]
        .iter()
        .map(|s| stats["timing_ms"][s]["mean"].as_f64().unwrap())
        .sum();
    let wall_mean = stats["timing_ms"]["wall_mean"].as_f64().unwrap();
    assert!(stage_sum <= wall_mean + 0.5, "stages {stage_sum} wall {wall_mean}");
}

#[test]
fn stop_enqueued_before_a_fatal_grab_resolves_to_stopped() {
    let root = tempfile::tempdir().unwrap();
    // Frame 1 is fatal and grabs are slow; the stop is enqueued while frame 1
    // is still being grabbed, so the shutdown intent precedes the fault.
    let camera = ScriptedCamera::recorded(5)
        .with_fatal_at(1)
        .with_grab_delay(Duration::from_millis(50));

    let mut handle = builder(root.path())
        .with_warmup_grabs(0)
        .spawn(move || Ok(camera), || Ok(StubDetector::never_detects()));
    let events = handle.take_events();
    handle.send(Command::Start);

    let first = events
        .progress
        .recv_timeout(Duration::from_secs(10))
        .expect("first frame");
    assert_eq!(first.index, 0);
    handle.send(Command::Stop);

    let report = handle.join();
    assert_eq!(report.outcome, SessionOutcome::Stopped);
}
