//! ZED camera adapter over the C shim. Built only with the `zed-sdk`
//! feature; the shim links against the vendor SDK.

use std::ffi::CString;
use std::path::Path;

use config::DepthPreset;
use image::RgbImage;
use libc::{c_char, c_float, c_int};

use crate::camera::{CameraConfig, Roi, SourceDescriptor, StereoCamera};
use crate::depth::DepthMap;
use crate::packets::{CameraError, GrabOutcome};

// Open/grab status codes shared with the shim.
const STATUS_OK: c_int = 0;
const STATUS_END_OF_SESSION: c_int = 1;
const STATUS_TRANSIENT: c_int = 2;
const STATUS_FATAL: c_int = 3;

const OPEN_UNAVAILABLE: c_int = 1;
const OPEN_INVALID_SESSION: c_int = 2;
const OPEN_CONFIG_REJECTED: c_int = 3;

extern "C" {
    fn zed_open_svo(path: *const c_char, depth_mode: c_int, min_m: c_float, max_m: c_float)
        -> c_int;
    fn zed_open_live(
        device_id: c_int,
        width: c_int,
        height: c_int,
        fps: c_int,
        depth_mode: c_int,
        min_m: c_float,
        max_m: c_float,
    ) -> c_int;
    fn zed_grab() -> c_int;
    fn zed_image_size(out_w: *mut c_int, out_h: *mut c_int) -> bool;
    /// Writes tightly packed RGB8 for the left rectified view.
    fn zed_retrieve_left(buf: *mut u8, len: usize) -> bool;
    /// Writes row-major f32 meters, aligned with the left view.
    fn zed_retrieve_depth(buf: *mut c_float, len: usize) -> bool;
    /// Positions the playback cursor so the next grab decodes `position`.
    fn zed_seek(position: c_int) -> bool;
    fn zed_frames_total() -> c_int;
    fn zed_fps() -> c_float;
    fn zed_close();
}

fn preset_code(preset: DepthPreset) -> c_int {
    match preset {
        DepthPreset::Fast => 0,
        DepthPreset::Balanced => 1,
        DepthPreset::Best => 2,
    }
}

/// Exclusive handle over the process-wide ZED session. Not thread-safe; owned
/// by the orchestrator thread.
pub struct ZedCamera {
    width: u32,
    height: u32,
    live: bool,
    fps: f64,
    current: i64,
    pending_index: Option<u64>,
    depth_retrieved: bool,
}

impl ZedCamera {
    pub fn open(source: &SourceDescriptor, cfg: &CameraConfig) -> Result<Self, CameraError> {
        let mode = preset_code(cfg.depth_preset);
        let status = match source {
            SourceDescriptor::Recorded { path } => {
                let c_path = path_to_cstring(path)?;
                unsafe { zed_open_svo(c_path.as_ptr(), mode, cfg.depth_min_m, cfg.depth_max_m) }
            }
            SourceDescriptor::Live { device_id } => unsafe {
                zed_open_live(
                    device_id.unwrap_or(0) as c_int,
                    cfg.resolution_hint.0 as c_int,
                    cfg.resolution_hint.1 as c_int,
                    cfg.target_fps as c_int,
                    mode,
                    cfg.depth_min_m,
                    cfg.depth_max_m,
                )
            },
        };

        match status {
            STATUS_OK => {}
            OPEN_UNAVAILABLE => {
                return Err(CameraError::Unavailable(source.describe()));
            }
            OPEN_INVALID_SESSION => {
                return Err(CameraError::InvalidSession(source.describe()));
            }
            OPEN_CONFIG_REJECTED => {
                return Err(CameraError::ConfigurationRejected(source.describe()));
            }
            other => {
                return Err(CameraError::Unavailable(format!(
                    "shim returned status {other}"
                )));
            }
        }

        let mut w: c_int = 0;
        let mut h: c_int = 0;
        if !unsafe { zed_image_size(&mut w, &mut h) } || w <= 0 || h <= 0 {
            unsafe { zed_close() };
            return Err(CameraError::Unavailable("no image geometry".to_string()));
        }

        let fps = unsafe { zed_fps() } as f64;
        Ok(Self {
            width: w as u32,
            height: h as u32,
            live: matches!(source, SourceDescriptor::Live { .. }),
            fps: if fps > 0.0 { fps } else { cfg.target_fps as f64 },
            current: -1,
            pending_index: None,
            depth_retrieved: false,
        })
    }
}

impl StereoCamera for ZedCamera {
    fn grab(&mut self) -> GrabOutcome {
        match unsafe { zed_grab() } {
            STATUS_OK => {
                self.current = match self.pending_index.take() {
                    Some(target) => target as i64,
                    None => self.current + 1,
                };
                self.depth_retrieved = false;
                GrabOutcome::Frame
            }
            STATUS_END_OF_SESSION => GrabOutcome::EndOfSession,
            STATUS_TRANSIENT => {
                // The decoder still advances past the corrupted frame.
                self.current += 1;
                self.pending_index = None;
                GrabOutcome::Transient("corrupted frame".to_string())
            }
            STATUS_FATAL => GrabOutcome::Fatal("device fault".to_string()),
            other => GrabOutcome::Fatal(format!("unknown grab status {other}")),
        }
    }

    fn retrieve_left(&mut self) -> Result<RgbImage, CameraError> {
        let len = (self.width * self.height * 3) as usize;
        let mut buf = vec![0u8; len];
        if !unsafe { zed_retrieve_left(buf.as_mut_ptr(), len) } {
            return Err(CameraError::Retrieve("left image".to_string()));
        }
        RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| CameraError::Retrieve("left image geometry".to_string()))
    }

    fn retrieve_depth(&mut self, roi: Option<Roi>) -> Result<DepthMap, CameraError> {
        if self.depth_retrieved {
            return Err(CameraError::Retrieve(
                "depth already retrieved for this frame".to_string(),
            ));
        }
        let len = (self.width * self.height) as usize;
        let mut buf = vec![0f32; len];
        if !unsafe { zed_retrieve_depth(buf.as_mut_ptr(), len) } {
            return Err(CameraError::Retrieve("depth map".to_string()));
        }
        self.depth_retrieved = true;
        let map = DepthMap::new(buf, self.width, self.height);
        Ok(match roi {
            Some(roi) => map.crop(roi),
            None => map,
        })
    }

    fn seek(&mut self, target: u64) -> Result<(), CameraError> {
        if self.live {
            return Err(CameraError::SeekUnsupported);
        }
        let total = self.frames_total().unwrap_or(0);
        if target >= total {
            return Err(CameraError::OutOfRange { target, total });
        }
        if !unsafe { zed_seek(target as c_int) } {
            return Err(CameraError::Retrieve(format!("seek to {target}")));
        }
        self.pending_index = Some(target);
        Ok(())
    }

    fn current_index(&self) -> i64 {
        self.current
    }

    fn frames_total(&self) -> Option<u64> {
        if self.live {
            return None;
        }
        let total = unsafe { zed_frames_total() };
        Some(total.max(0) as u64)
    }

    fn native_fps(&self) -> f64 {
        self.fps
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

impl Drop for ZedCamera {
    fn drop(&mut self) {
        unsafe { zed_close() };
    }
}

fn path_to_cstring(path: &Path) -> Result<CString, CameraError> {
    CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| CameraError::InvalidSession(path.display().to_string()))
}
