use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::packets::{FatalError, FrameResult};
use crate::writer::WriterTotals;

/// Terminal disposition of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Stopped by command.
    Stopped,
    /// Recorded source ran out of frames.
    Ended,
    Failed(FatalError),
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Stopped => "stopped",
            SessionOutcome::Ended => "ended",
            SessionOutcome::Failed(_) => "failed",
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            SessionOutcome::Failed(e) => Some(e.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ErrorCounters {
    pub grab_transient: u64,
    pub infer_transient: u64,
    pub depth_retrieve: u64,
    pub writer_io: u64,
    pub commands_rejected: u64,
}

/// Discrete histogram of frame-to-frame wall intervals.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IntervalHistogram {
    pub le_5: u64,
    pub le_10: u64,
    pub le_16: u64,
    pub le_33: u64,
    pub le_66: u64,
    pub le_100: u64,
    pub gt_100: u64,
}

impl IntervalHistogram {
    pub fn record(&mut self, ms: f64) {
        if ms <= 5.0 {
            self.le_5 += 1;
        } else if ms <= 10.0 {
            self.le_10 += 1;
        } else if ms <= 16.0 {
            self.le_16 += 1;
        } else if ms <= 33.0 {
            self.le_33 += 1;
        } else if ms <= 66.0 {
            self.le_66 += 1;
        } else if ms <= 100.0 {
            self.le_100 += 1;
        } else {
            self.gt_100 += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.le_5 + self.le_10 + self.le_16 + self.le_33 + self.le_66 + self.le_100 + self.gt_100
    }
}

/// Settings echo written into stats.json so a run is reproducible from its
/// artifact directory alone.
#[derive(Debug, Clone, Serialize)]
pub struct RunSettings {
    pub source: String,
    pub depth_preset: String,
    pub depth_schedule: String,
    pub confidence_threshold: f32,
}

/// Cumulative whole-run counters, kept by the orchestrator and flushed to
/// `stats.json` at teardown.
#[derive(Debug)]
pub struct SessionStats {
    started_utc: DateTime<Utc>,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub frames_with_detections: u64,
    pub frames_empty: u64,
    pub detections_total: u64,
    pub errors: ErrorCounters,
    stage_sums_ns: [u64; 4],
    wall_samples_ms: Vec<f64>,
    det_wall_sum_ms: f64,
    empty_wall_sum_ms: f64,
    intervals: IntervalHistogram,
    last_frame_at: Option<Instant>,
    run_started: Option<Instant>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started_utc: Utc::now(),
            frames_processed: 0,
            frames_skipped: 0,
            frames_with_detections: 0,
            frames_empty: 0,
            detections_total: 0,
            errors: ErrorCounters::default(),
            stage_sums_ns: [0; 4],
            wall_samples_ms: Vec::new(),
            det_wall_sum_ms: 0.0,
            empty_wall_sum_ms: 0.0,
            intervals: IntervalHistogram::default(),
            last_frame_at: None,
            run_started: None,
        }
    }

    /// Marks the first transition into Running; global FPS is measured from
    /// here.
    pub fn mark_running(&mut self) {
        if self.run_started.is_none() {
            self.run_started = Some(Instant::now());
        }
    }

    pub fn reached_running(&self) -> bool {
        self.run_started.is_some()
    }

    pub fn record_frame(&mut self, result: &FrameResult) {
        self.frames_processed += 1;
        self.detections_total += result.detections.len() as u64;
        let wall_ms = result.wall_ns as f64 / 1_000_000.0;
        self.wall_samples_ms.push(wall_ms);
        if result.had_detections() {
            self.frames_with_detections += 1;
            self.det_wall_sum_ms += wall_ms;
        } else {
            self.frames_empty += 1;
            self.empty_wall_sum_ms += wall_ms;
        }
        self.stage_sums_ns[0] += result.timings.grab_ns;
        self.stage_sums_ns[1] += result.timings.infer_ns;
        self.stage_sums_ns[2] += result.timings.depth_ns;
        self.stage_sums_ns[3] += result.timings.housekeeping_ns;

        let now = Instant::now();
        if let Some(prev) = self.last_frame_at {
            self.intervals.record(now.duration_since(prev).as_secs_f64() * 1000.0);
        }
        self.last_frame_at = Some(now);
    }

    pub fn record_skip(&mut self) {
        self.frames_skipped += 1;
    }

    pub fn global_fps(&self) -> f64 {
        match self.run_started {
            Some(t0) => {
                let secs = t0.elapsed().as_secs_f64();
                if secs > 0.0 {
                    self.frames_processed as f64 / secs
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    fn stage_mean_ms(&self, i: usize) -> Option<f64> {
        if self.frames_processed == 0 {
            return None;
        }
        Some(self.stage_sums_ns[i] as f64 / self.frames_processed as f64 / 1_000_000.0)
    }

    fn wall_percentile(&self, p: f64) -> Option<f64> {
        if self.wall_samples_ms.is_empty() {
            return None;
        }
        let mut sorted = self.wall_samples_ms.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct SessionBlock {
    started_utc: String,
    ended_utc: String,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Serialize)]
struct CountsBlock {
    frames_processed: u64,
    frames_skipped: u64,
    frames_with_detections: u64,
    frames_empty: u64,
    detections_total: u64,
    avg_detections_per_frame: Option<f64>,
}

#[derive(Serialize)]
struct StageBlock {
    mean: Option<f64>,
    share_pct: Option<f64>,
}

#[derive(Serialize)]
struct TimingBlock {
    grab: StageBlock,
    infer: StageBlock,
    depth: StageBlock,
    housekeeping: StageBlock,
    wall_mean: Option<f64>,
    wall_p50: Option<f64>,
    wall_p95: Option<f64>,
    fps_global: Option<f64>,
}

#[derive(Serialize)]
struct SplitBlock {
    detection_mean: Option<f64>,
    empty_mean: Option<f64>,
    delta_ms: Option<f64>,
    delta_pct: Option<f64>,
    significant: bool,
}

#[derive(Serialize)]
struct WriterBlock {
    jpeg_written: u64,
    txt_written: u64,
    drops: u64,
}

#[derive(Serialize)]
struct StatsReport<'a> {
    session: SessionBlock,
    counts: CountsBlock,
    timing_ms: TimingBlock,
    detection_vs_empty_ms: SplitBlock,
    writer: WriterBlock,
    errors: ErrorCounters,
    intervals_ms: IntervalHistogram,
    config: &'a RunSettings,
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// End-of-session summary. Every numeric field is finite; NaN/Inf become
/// null. Stage shares sum to 100 over the frames that were processed.
pub fn write_stats_json(
    path: &Path,
    stats: &SessionStats,
    outcome: &SessionOutcome,
    writer: WriterTotals,
    settings: &RunSettings,
) -> anyhow::Result<()> {
    let stage_means: Vec<Option<f64>> = (0..4).map(|i| stats.stage_mean_ms(i)).collect();
    let mean_sum: f64 = stage_means.iter().flatten().sum();
    let share = |i: usize| -> Option<f64> {
        let mean = stage_means[i]?;
        if mean_sum > 0.0 {
            finite(mean / mean_sum * 100.0)
        } else {
            Some(0.0)
        }
    };
    let stage = |i: usize| StageBlock {
        mean: stage_means[i].and_then(finite),
        share_pct: share(i),
    };

    let det_mean = (stats.frames_with_detections > 0)
        .then(|| stats.det_wall_sum_ms / stats.frames_with_detections as f64);
    let empty_mean =
        (stats.frames_empty > 0).then(|| stats.empty_wall_sum_ms / stats.frames_empty as f64);
    let delta_ms = match (det_mean, empty_mean) {
        (Some(d), Some(e)) => finite(d - e),
        _ => None,
    };
    let delta_pct = match (det_mean, empty_mean) {
        (Some(d), Some(e)) if e > 0.0 => finite((d - e) / e * 100.0),
        _ => None,
    };

    let wall_mean = (!stats.wall_samples_ms.is_empty())
        .then(|| stats.wall_samples_ms.iter().sum::<f64>() / stats.wall_samples_ms.len() as f64);

    let report = StatsReport {
        session: SessionBlock {
            started_utc: stats.started_utc.to_rfc3339_opts(SecondsFormat::Millis, true),
            ended_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            outcome: outcome.as_str(),
            reason: outcome.reason(),
        },
        counts: CountsBlock {
            frames_processed: stats.frames_processed,
            frames_skipped: stats.frames_skipped,
            frames_with_detections: stats.frames_with_detections,
            frames_empty: stats.frames_empty,
            detections_total: stats.detections_total,
            avg_detections_per_frame: (stats.frames_processed > 0)
                .then(|| stats.detections_total as f64 / stats.frames_processed as f64),
        },
        timing_ms: TimingBlock {
            grab: stage(0),
            infer: stage(1),
            depth: stage(2),
            housekeeping: stage(3),
            wall_mean: wall_mean.and_then(finite),
            wall_p50: stats.wall_percentile(50.0).and_then(finite),
            wall_p95: stats.wall_percentile(95.0).and_then(finite),
            fps_global: finite(stats.global_fps()),
        },
        detection_vs_empty_ms: SplitBlock {
            detection_mean: det_mean.and_then(finite),
            empty_mean: empty_mean.and_then(finite),
            delta_ms,
            delta_pct,
            significant: stats.frames_with_detections >= telemetry::SPLIT_MIN_SAMPLES as u64
                && stats.frames_empty >= telemetry::SPLIT_MIN_SAMPLES as u64,
        },
        writer: WriterBlock {
            jpeg_written: writer.jpeg_written,
            txt_written: writer.txt_written,
            drops: writer.drops,
        },
        errors: stats.errors,
        intervals_ms: stats.intervals,
        config: settings,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{BBox, DepthStats, Detection, CLASS_IN_RANGE};
    use telemetry::StageRecord;

    fn frame(index: u64, detections: usize, wall_ms: f64) -> FrameResult {
        let det = Detection {
            class_id: CLASS_IN_RANGE,
            bbox: BBox { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 },
            confidence: 0.9,
        };
        FrameResult {
            index,
            detections: vec![det; detections],
            depth: vec![DepthStats::NO_DEPTH; detections],
            timings: StageRecord {
                grab_ns: 1_000_000,
                infer_ns: 2_000_000,
                depth_ns: 500_000,
                housekeeping_ns: 500_000,
            },
            wall_ns: (wall_ms * 1e6) as u64,
        }
    }

    #[test]
    fn counts_partition_frames() {
        let mut stats = SessionStats::new();
        stats.mark_running();
        stats.record_frame(&frame(0, 2, 5.0));
        stats.record_frame(&frame(1, 0, 4.0));
        stats.record_frame(&frame(2, 1, 5.0));
        stats.record_skip();
        assert_eq!(stats.frames_processed, 3);
        assert_eq!(stats.frames_with_detections, 2);
        assert_eq!(stats.frames_empty, 1);
        assert_eq!(stats.detections_total, 3);
        assert_eq!(stats.frames_skipped, 1);
    }

    #[test]
    fn stats_json_schema_and_share_sum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let mut stats = SessionStats::new();
        stats.mark_running();
        for i in 0..10 {
            stats.record_frame(&frame(i, (i % 2) as usize, 4.0));
        }
        let settings = RunSettings {
            source: "test.svo2".into(),
            depth_preset: "balanced".into(),
            depth_schedule: "every_frame".into(),
            confidence_threshold: 0.25,
        };
        write_stats_json(
            &path,
            &stats,
            &SessionOutcome::Ended,
            WriterTotals::default(),
            &settings,
        )
        .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["session"]["outcome"], "ended");
        assert!(json["session"]["reason"].is_null());
        assert_eq!(json["counts"]["frames_processed"], 10);
        let shares: f64 = ["grab", "infer", "depth", "housekeeping"]
            .iter()
            .map(|s| json["timing_ms"][s]["share_pct"].as_f64().unwrap())
            .sum();
        assert!((shares - 100.0).abs() < 0.1, "shares sum to {shares}");
        assert!(json["timing_ms"]["wall_p50"].as_f64().is_some());
        assert_eq!(json["detection_vs_empty_ms"]["significant"], false);
        assert_eq!(json["config"]["depth_schedule"], "every_frame");
    }

    #[test]
    fn empty_run_serializes_nulls_not_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let stats = SessionStats::new();
        let settings = RunSettings {
            source: "live".into(),
            depth_preset: "fast".into(),
            depth_schedule: "10Hz".into(),
            confidence_threshold: 0.25,
        };
        write_stats_json(
            &path,
            &stats,
            &SessionOutcome::Stopped,
            WriterTotals::default(),
            &settings,
        )
        .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("NaN"));
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(json["timing_ms"]["wall_mean"].is_null());
        assert!(json["counts"]["avg_detections_per_frame"].is_null());
    }

    #[test]
    fn failed_outcome_carries_reason() {
        let outcome = SessionOutcome::Failed(FatalError::EngineLoadFailure);
        assert_eq!(outcome.as_str(), "failed");
        assert_eq!(outcome.reason().as_deref(), Some("EngineLoadFailure"));
    }

    #[test]
    fn interval_histogram_buckets() {
        let mut h = IntervalHistogram::default();
        for ms in [1.0, 7.0, 15.0, 30.0, 50.0, 90.0, 500.0] {
            h.record(ms);
        }
        assert_eq!(h.le_5, 1);
        assert_eq!(h.le_10, 1);
        assert_eq!(h.le_16, 1);
        assert_eq!(h.le_33, 1);
        assert_eq!(h.le_66, 1);
        assert_eq!(h.le_100, 1);
        assert_eq!(h.gt_100, 1);
        assert_eq!(h.total(), 7);
    }
}
