use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use skytrack::{
    BBox, CameraError, DepthMap, Detection, Detector, DetectorError, GrabOutcome, Roi,
    StereoCamera,
};

pub fn detection(class_id: i32, x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Detection {
    Detection {
        class_id,
        bbox: BBox { x1, y1, x2, y2 },
        confidence,
    }
}

/// What the scripted camera writes into its depth maps.
#[derive(Debug, Clone, Copy)]
pub enum DepthScript {
    Uniform(f32),
    AllNaN,
}

/// Shared observation counters that survive the camera being moved into the
/// orchestrator thread.
#[derive(Clone, Default)]
pub struct CameraProbe {
    grabs: Arc<AtomicU64>,
    depth_retrieves: Arc<AtomicU64>,
    seeks: Arc<AtomicU64>,
}

impl CameraProbe {
    pub fn grabs(&self) -> u64 {
        self.grabs.load(Ordering::Relaxed)
    }

    pub fn depth_retrieves(&self) -> u64 {
        self.depth_retrieves.load(Ordering::Relaxed)
    }

    pub fn seeks(&self) -> u64 {
        self.seeks.load(Ordering::Relaxed)
    }
}

/// Deterministic in-memory stereo source honoring the full adapter contract:
/// cursor advance on transient grabs, at-most-once depth retrieval per frame,
/// and seek-then-grab delivering the seek target exactly.
pub struct ScriptedCamera {
    frames_total: Option<u64>,
    width: u32,
    height: u32,
    fps: f64,
    next: u64,
    current: i64,
    grabbed: bool,
    depth_retrieved: bool,
    depth: DepthScript,
    grab_delay: Duration,
    transient_at: Vec<u64>,
    fatal_at: Option<u64>,
    depth_fail_at: Vec<u64>,
    probe: CameraProbe,
}

impl ScriptedCamera {
    pub fn recorded(frames: u64) -> Self {
        Self::new(Some(frames))
    }

    pub fn live() -> Self {
        Self::new(None)
    }

    fn new(frames_total: Option<u64>) -> Self {
        Self {
            frames_total,
            width: 64,
            height: 48,
            fps: 60.0,
            next: 0,
            current: -1,
            grabbed: false,
            depth_retrieved: false,
            depth: DepthScript::Uniform(8.0),
            grab_delay: Duration::ZERO,
            transient_at: Vec::new(),
            fatal_at: None,
            depth_fail_at: Vec::new(),
            probe: CameraProbe::default(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_depth(mut self, depth: DepthScript) -> Self {
        self.depth = depth;
        self
    }

    /// Slows each grab down; the camera governs pipeline cadence.
    pub fn with_grab_delay(mut self, delay: Duration) -> Self {
        self.grab_delay = delay;
        self
    }

    /// These frame indices report a transient grab error.
    pub fn with_transient_at(mut self, indices: Vec<u64>) -> Self {
        self.transient_at = indices;
        self
    }

    /// Grabbing this frame index reports a fatal device fault.
    pub fn with_fatal_at(mut self, index: u64) -> Self {
        self.fatal_at = Some(index);
        self
    }

    /// Depth retrieval fails on these frame indices.
    pub fn with_depth_fail_at(mut self, indices: Vec<u64>) -> Self {
        self.depth_fail_at = indices;
        self
    }

    pub fn probe(&self) -> CameraProbe {
        self.probe.clone()
    }

    fn make_image(&self, index: u64) -> RgbImage {
        let shade = (index % 251) as u8;
        RgbImage::from_pixel(self.width, self.height, image::Rgb([shade, 64, 128]))
    }

    fn make_depth(&self) -> DepthMap {
        let value = match self.depth {
            DepthScript::Uniform(v) => v,
            DepthScript::AllNaN => f32::NAN,
        };
        DepthMap::new(
            vec![value; (self.width * self.height) as usize],
            self.width,
            self.height,
        )
    }
}

impl StereoCamera for ScriptedCamera {
    fn grab(&mut self) -> GrabOutcome {
        if !self.grab_delay.is_zero() {
            std::thread::sleep(self.grab_delay);
        }
        self.probe.grabs.fetch_add(1, Ordering::Relaxed);

        if let Some(fatal) = self.fatal_at {
            if self.next == fatal {
                return GrabOutcome::Fatal("scripted device fault".to_string());
            }
        }
        if let Some(total) = self.frames_total {
            if self.next >= total {
                return GrabOutcome::EndOfSession;
            }
        }

        let index = self.next;
        self.next += 1;

        if self.transient_at.contains(&index) {
            // Cursor advances past the corrupted frame.
            self.grabbed = false;
            return GrabOutcome::Transient(format!("scripted transient at {index}"));
        }

        self.current = index as i64;
        self.grabbed = true;
        self.depth_retrieved = false;
        GrabOutcome::Frame
    }

    fn retrieve_left(&mut self) -> Result<RgbImage, CameraError> {
        if !self.grabbed {
            return Err(CameraError::Retrieve("no grabbed frame".to_string()));
        }
        Ok(self.make_image(self.current as u64))
    }

    fn retrieve_depth(&mut self, roi: Option<Roi>) -> Result<DepthMap, CameraError> {
        if !self.grabbed {
            return Err(CameraError::Retrieve("no grabbed frame".to_string()));
        }
        if self.depth_retrieved {
            return Err(CameraError::Retrieve(
                "depth already retrieved for this frame".to_string(),
            ));
        }
        if self.depth_fail_at.contains(&(self.current as u64)) {
            return Err(CameraError::Retrieve("scripted depth failure".to_string()));
        }
        self.depth_retrieved = true;
        self.probe.depth_retrieves.fetch_add(1, Ordering::Relaxed);
        let map = self.make_depth();
        Ok(match roi {
            Some(roi) => map.crop(roi),
            None => map,
        })
    }

    fn seek(&mut self, target: u64) -> Result<(), CameraError> {
        let Some(total) = self.frames_total else {
            return Err(CameraError::SeekUnsupported);
        };
        if target >= total {
            return Err(CameraError::OutOfRange { target, total });
        }
        self.probe.seeks.fetch_add(1, Ordering::Relaxed);
        self.next = target;
        Ok(())
    }

    fn current_index(&self) -> i64 {
        self.current
    }

    fn frames_total(&self) -> Option<u64> {
        self.frames_total
    }

    fn native_fps(&self) -> f64 {
        self.fps
    }

    fn is_live(&self) -> bool {
        self.frames_total.is_none()
    }
}

/// Detector double that reports a fixed detection set every frame, with
/// optional scripted per-call failures.
pub struct StubDetector {
    template: Vec<Detection>,
    fail_on_calls: Vec<u64>,
    calls: u64,
}

impl StubDetector {
    pub fn never_detects() -> Self {
        Self::with_detections(Vec::new())
    }

    pub fn with_detections(template: Vec<Detection>) -> Self {
        Self {
            template,
            fail_on_calls: Vec::new(),
            calls: 0,
        }
    }

    /// One in-range and one out-of-range target inside a 64x48 frame.
    pub fn two_targets() -> Self {
        Self::with_detections(vec![
            detection(0, 8.0, 8.0, 24.0, 24.0, 0.91),
            detection(1, 32.0, 16.0, 56.0, 40.0, 0.64),
        ])
    }

    /// These infer-call ordinals (0-based) fail transiently.
    pub fn with_fail_on_calls(mut self, calls: Vec<u64>) -> Self {
        self.fail_on_calls = calls;
        self
    }
}

impl Detector for StubDetector {
    fn infer(&mut self, _left: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on_calls.contains(&call) {
            return Err(DetectorError::Infer(format!(
                "scripted inference failure on call {call}"
            )));
        }
        Ok(self.template.clone())
    }
}
