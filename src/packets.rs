use telemetry::StageRecord;

/// Axis-aligned bounding box in left-image pixel coordinates, x1 < x2, y1 < y2.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Intersects the box with a (width, height) frame. Returns integer pixel
    /// bounds, or None when the clipped region has zero area.
    pub fn clip(&self, frame_w: u32, frame_h: u32) -> Option<ClippedRect> {
        let x1 = self.x1.max(0.0).floor() as i64;
        let y1 = self.y1.max(0.0).floor() as i64;
        let x2 = (self.x2.min(frame_w as f32)).ceil() as i64;
        let y2 = (self.y2.min(frame_h as f32)).ceil() as i64;
        if x2 <= x1 || y2 <= y1 || x1 >= frame_w as i64 || y1 >= frame_h as i64 {
            return None;
        }
        Some(ClippedRect {
            x: x1 as u32,
            y: y1 as u32,
            w: (x2.min(frame_w as i64) - x1) as u32,
            h: (y2.min(frame_h as i64) - y1) as u32,
        })
    }
}

/// Integer pixel rectangle fully inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClippedRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// In-range target class; detections of any other class are passed through
/// but never paired with depth statistics.
pub const CLASS_IN_RANGE: i32 = 0;
/// Out-of-range target class.
pub const CLASS_OUT_OF_RANGE: i32 = 1;

/// One post-NMS detection in the input pixel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: i32,
    pub bbox: BBox,
    pub confidence: f32,
}

impl Detection {
    pub fn is_in_range_class(&self) -> bool {
        self.class_id == CLASS_IN_RANGE
    }
}

/// Per-detection depth aggregate over the valid samples inside the clipped
/// bbox. The no-depth sentinel is a first-class outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthStats {
    pub valid_count: usize,
    pub mean_m: f32,
    pub min_m: f32,
    pub max_m: f32,
    pub stdev_m: f32,
}

impl DepthStats {
    pub const NO_DEPTH: DepthStats = DepthStats {
        valid_count: 0,
        mean_m: -1.0,
        min_m: -1.0,
        max_m: -1.0,
        stdev_m: 0.0,
    };

    pub fn has_depth(&self) -> bool {
        self.valid_count >= 1
    }
}

/// Result of one processed frame; depth stats are index-aligned with
/// detections.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub index: u64,
    pub detections: Vec<Detection>,
    pub depth: Vec<DepthStats>,
    pub timings: StageRecord,
    pub wall_ns: u64,
}

impl FrameResult {
    pub fn had_detections(&self) -> bool {
        !self.detections.is_empty()
    }

    /// Mean of the per-detection depth means over in-range detections with
    /// valid depth.
    pub fn depth_summary_m(&self) -> Option<f32> {
        let mut sum = 0.0f32;
        let mut n = 0usize;
        for (det, stats) in self.detections.iter().zip(self.depth.iter()) {
            if det.is_in_range_class() && stats.has_depth() {
                sum += stats.mean_m;
                n += 1;
            }
        }
        if n > 0 {
            Some(sum / n as f32)
        } else {
            None
        }
    }
}

/// Outcome of a single camera grab, inspected by the orchestrator loop.
#[derive(Debug, Clone, PartialEq)]
pub enum GrabOutcome {
    Frame,
    EndOfSession,
    Transient(String),
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("invalid session file: {0}")]
    InvalidSession(String),
    #[error("configuration rejected: {0}")]
    ConfigurationRejected(String),
    #[error("seek unsupported on live sources")]
    SeekUnsupported,
    #[error("seek target {target} out of range (frames_total {total})")]
    OutOfRange { target: u64, total: u64 },
    #[error("retrieve failed: {0}")]
    Retrieve(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("engine load failure: {0}")]
    EngineLoad(String),
    #[error("inference failure: {0}")]
    Infer(String),
}

/// Fatal session-ending conditions, surfaced through the lifecycle stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    #[error("CameraUnavailable")]
    CameraUnavailable,
    #[error("InvalidSession")]
    InvalidSession,
    #[error("EngineLoadFailure")]
    EngineLoadFailure,
    #[error("UnsupportedOperation")]
    UnsupportedOperation,
    #[error("CameraFault: {0}")]
    CameraFault(String),
}

impl From<&CameraError> for FatalError {
    fn from(e: &CameraError) -> Self {
        match e {
            CameraError::Unavailable(_) => FatalError::CameraUnavailable,
            CameraError::InvalidSession(_) => FatalError::InvalidSession,
            CameraError::ConfigurationRejected(_) => FatalError::UnsupportedOperation,
            other => FatalError::CameraFault(other.to_string()),
        }
    }
}
