use std::path::PathBuf;

use config::DepthPreset;
use image::RgbImage;

use crate::depth::DepthMap;
use crate::packets::{CameraError, GrabOutcome};

/// Stereo source selector: a live device or a recorded session file.
/// Recorded files are opaque; only the camera adapter interprets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    Live { device_id: Option<u32> },
    Recorded { path: PathBuf },
}

impl SourceDescriptor {
    pub fn describe(&self) -> String {
        match self {
            SourceDescriptor::Live { device_id: Some(id) } => format!("live:{id}"),
            SourceDescriptor::Live { device_id: None } => "live".to_string(),
            SourceDescriptor::Recorded { path } => path.display().to_string(),
        }
    }
}

/// Open-time camera parameters. The depth preset is mapped to backend modes
/// inside the adapter; backend enum values never leak out.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub resolution_hint: (u32, u32),
    pub target_fps: u32,
    pub depth_preset: DepthPreset,
    pub depth_min_m: f32,
    pub depth_max_m: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            resolution_hint: (1280, 720),
            target_fps: 60,
            depth_preset: DepthPreset::Balanced,
            depth_min_m: 1.0,
            depth_max_m: 40.0,
        }
    }
}

impl From<&config::CameraCfg> for CameraConfig {
    fn from(cfg: &config::CameraCfg) -> Self {
        let resolution_hint = match cfg.resolution.as_str() {
            "hd1080" => (1920, 1080),
            "hd2k" => (2208, 1242),
            "vga" => (672, 376),
            _ => (1280, 720),
        };
        Self {
            resolution_hint,
            target_fps: cfg.fps,
            depth_preset: cfg.depth_preset,
            depth_min_m: cfg.depth_min_m,
            depth_max_m: cfg.depth_max_m,
        }
    }
}

/// Rectangular sub-region for restricted depth retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Narrow blocking interface over a stereo source.
///
/// Contract: `retrieve_left` and `retrieve_depth` share one rectified
/// coordinate space; pixel (x, y) of the left image corresponds to
/// `depth[y, x]`. `retrieve_depth` may be called at most once per grabbed
/// frame. After a successful `seek(target)`, the next `grab` delivers the
/// frame with logical index `target` exactly.
///
/// The handle is not thread-safe; it is exclusively owned by the
/// orchestrator thread for the session lifetime.
pub trait StereoCamera: Send {
    /// Advances the cursor by one frame, blocking until the frame is ready.
    fn grab(&mut self) -> GrabOutcome;

    /// Left rectified image of the most recent successful grab.
    fn retrieve_left(&mut self) -> Result<RgbImage, CameraError>;

    /// Depth map of the most recent successful grab, optionally restricted to
    /// a sub-region.
    fn retrieve_depth(&mut self, roi: Option<Roi>) -> Result<DepthMap, CameraError>;

    /// Recorded sources only; fails with `SeekUnsupported` on live devices.
    fn seek(&mut self, target: u64) -> Result<(), CameraError>;

    /// Index of the frame most recently returned by `grab`; -1 before the
    /// first grab.
    fn current_index(&self) -> i64;

    /// Known only for recorded sources.
    fn frames_total(&self) -> Option<u64>;

    fn native_fps(&self) -> f64;

    fn is_live(&self) -> bool;
}
