// windows.rs - Fixed-capacity rolling latency windows
use std::collections::VecDeque;

/// Capacity of every stage window.
pub const STAGE_WINDOW: usize = 60;
/// A stage share is reported as warming-up until its window holds this many samples.
pub const SHARE_MIN_SAMPLES: usize = 5;
/// The detection-vs-empty comparison is significant once both partitions hold this many samples.
pub const SPLIT_MIN_SAMPLES: usize = 30;

/// Fixed-capacity FIFO of recent latency samples in milliseconds.
/// Push is amortized O(1); aggregates are O(len).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    buf: VecDeque<f64>,
    cap: usize,
}

impl RollingWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, sample_ms: f64) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(sample_ms);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.buf.is_empty() {
            return None;
        }
        Some(self.buf.iter().sum::<f64>() / self.buf.len() as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.buf.iter().copied().fold(None, |acc, v| match acc {
            None => Some(v),
            Some(m) => Some(if v < m { v } else { m }),
        })
    }

    pub fn max(&self) -> Option<f64> {
        self.buf.iter().copied().fold(None, |acc, v| match acc {
            None => Some(v),
            Some(m) => Some(if v > m { v } else { m }),
        })
    }

    /// Nearest-rank percentile; `p` in [0, 100].
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.buf.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.buf.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.buf.iter().copied()
    }
}

/// One frame's worth of stage latencies, nanoseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageRecord {
    pub grab_ns: u64,
    pub infer_ns: u64,
    pub depth_ns: u64,
    pub housekeeping_ns: u64,
}

impl StageRecord {
    pub fn total_ns(&self) -> u64 {
        self.grab_ns + self.infer_ns + self.depth_ns + self.housekeeping_ns
    }
}

/// Per-stage mean and share of the rolling stage-mean total.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageStat {
    pub mean_ms: f64,
    pub share_pct: f64,
    pub warming: bool,
}

/// Consistent read of the timing core.
#[derive(Debug, Clone, Default)]
pub struct TimingSnapshot {
    pub grab: StageStat,
    pub infer: StageStat,
    pub depth: StageStat,
    pub housekeeping: StageStat,
    pub detection_mean_ms: Option<f64>,
    pub empty_mean_ms: Option<f64>,
    pub split_significant: bool,
    pub wall_mean_ms: Option<f64>,
    pub wall_p50_ms: Option<f64>,
    pub wall_p95_ms: Option<f64>,
    pub wall_min_ms: Option<f64>,
    pub wall_max_ms: Option<f64>,
}

impl TimingSnapshot {
    pub fn stages(&self) -> [&StageStat; 4] {
        [&self.grab, &self.infer, &self.depth, &self.housekeeping]
    }
}

/// Six fixed-capacity windows: one per pipeline stage, plus per-frame wall
/// times partitioned by whether the frame yielded any detections.
#[derive(Debug)]
pub struct TimingCore {
    grab: RollingWindow,
    infer: RollingWindow,
    depth: RollingWindow,
    housekeeping: RollingWindow,
    detection_total: RollingWindow,
    empty_total: RollingWindow,
}

impl TimingCore {
    pub fn new() -> Self {
        Self {
            grab: RollingWindow::new(STAGE_WINDOW),
            infer: RollingWindow::new(STAGE_WINDOW),
            depth: RollingWindow::new(STAGE_WINDOW),
            housekeeping: RollingWindow::new(STAGE_WINDOW),
            detection_total: RollingWindow::new(STAGE_WINDOW),
            empty_total: RollingWindow::new(STAGE_WINDOW),
        }
    }

    /// Replaces the whole window set in one step so readers never see a
    /// partially cleared state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn push(&mut self, record: StageRecord, wall_ns: u64, had_detections: bool) {
        const NS_PER_MS: f64 = 1_000_000.0;
        self.grab.push(record.grab_ns as f64 / NS_PER_MS);
        self.infer.push(record.infer_ns as f64 / NS_PER_MS);
        self.depth.push(record.depth_ns as f64 / NS_PER_MS);
        self.housekeeping.push(record.housekeeping_ns as f64 / NS_PER_MS);
        let wall_ms = wall_ns as f64 / NS_PER_MS;
        if had_detections {
            self.detection_total.push(wall_ms);
        } else {
            self.empty_total.push(wall_ms);
        }
    }

    pub fn snapshot(&self) -> TimingSnapshot {
        let windows = [&self.grab, &self.infer, &self.depth, &self.housekeeping];
        let mut stats = [StageStat::default(); 4];

        // Shares are computed over the warm stages only; warming stages report 0.
        let mut denom = 0.0;
        for (i, w) in windows.iter().enumerate() {
            let warming = w.len() < SHARE_MIN_SAMPLES;
            let mean = w.mean().unwrap_or(0.0);
            stats[i] = StageStat {
                mean_ms: mean,
                share_pct: 0.0,
                warming,
            };
            if !warming {
                denom += mean;
            }
        }
        if denom > 0.0 {
            for s in stats.iter_mut() {
                if !s.warming {
                    s.share_pct = s.mean_ms / denom * 100.0;
                }
            }
        }

        let wall = self.wall_window();
        TimingSnapshot {
            grab: stats[0],
            infer: stats[1],
            depth: stats[2],
            housekeeping: stats[3],
            detection_mean_ms: self.detection_total.mean(),
            empty_mean_ms: self.empty_total.mean(),
            split_significant: self.detection_total.len() >= SPLIT_MIN_SAMPLES
                && self.empty_total.len() >= SPLIT_MIN_SAMPLES,
            wall_mean_ms: wall.mean(),
            wall_p50_ms: wall.percentile(50.0),
            wall_p95_ms: wall.percentile(95.0),
            wall_min_ms: wall.min(),
            wall_max_ms: wall.max(),
        }
    }

    // Wall statistics merge both partitions.
    fn wall_window(&self) -> RollingWindow {
        let mut merged = RollingWindow::new(STAGE_WINDOW * 2);
        for v in self.detection_total.iter().chain(self.empty_total.iter()) {
            merged.push(v);
        }
        merged
    }
}

impl Default for TimingCore {
    fn default() -> Self {
        Self::new()
    }
}
