use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub camera: CameraCfg,
    #[serde(default)]
    pub detector: DetectorCfg,
    #[serde(default)]
    pub depth: DepthCfg,
    #[serde(default)]
    pub writer: WriterCfg,
    #[serde(default)]
    pub telemetry: TelemetryCfg,
}

impl AppConfig {
    pub fn from_file(p: &str) -> Result<Self> {
        let content = std::fs::read_to_string(p)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Depth backend quality preset; mapped to backend-specific modes inside the
/// camera adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DepthPreset {
    Fast,
    #[default]
    Balanced,
    Best,
}

impl DepthPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepthPreset::Fast => "fast",
            DepthPreset::Balanced => "balanced",
            DepthPreset::Best => "best",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraCfg {
    /// Recorded session file; None opens a live device.
    pub svo_path: Option<String>,
    #[serde(default)]
    pub device_id: u32,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub depth_preset: DepthPreset,
    #[serde(default = "default_depth_min")]
    pub depth_min_m: f32,
    #[serde(default = "default_depth_max")]
    pub depth_max_m: f32,
    /// Some depth backends need a couple of throwaway grabs before the first
    /// usable map.
    #[serde(default = "default_warmup_grabs")]
    pub warmup_grabs: u32,
}

impl Default for CameraCfg {
    fn default() -> Self {
        Self {
            svo_path: None,
            device_id: 0,
            resolution: default_resolution(),
            fps: default_fps(),
            depth_preset: DepthPreset::default(),
            depth_min_m: default_depth_min(),
            depth_max_m: default_depth_max(),
            warmup_grabs: default_warmup_grabs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorCfg {
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_conf")]
    pub confidence_threshold: f32,
    #[serde(default = "default_nms")]
    pub nms_threshold: f32,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_max_dets")]
    pub max_detections: usize,
}

impl Default for DetectorCfg {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            confidence_threshold: default_conf(),
            nms_threshold: default_nms(),
            input_size: default_input_size(),
            max_detections: default_max_dets(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepthCfg {
    /// Target depth rate in Hz; None computes depth on every frame unless
    /// `every_frames` is set.
    pub hz: Option<f32>,
    /// Direct frame interval, overriding `hz`.
    pub every_frames: Option<u32>,
    /// Reused maps older than this many frames raise a staleness warning.
    #[serde(default = "default_staleness")]
    pub staleness_frames: u64,
}

impl Default for DepthCfg {
    fn default() -> Self {
        Self {
            hz: None,
            every_frames: None,
            staleness_frames: default_staleness(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterCfg {
    #[serde(default)]
    pub save_annotated: bool,
    #[serde(default)]
    pub save_labels: bool,
    #[serde(default = "default_output_root")]
    pub output_root: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_font_path")]
    pub font_path: String,
}

impl Default for WriterCfg {
    fn default() -> Self {
        Self {
            save_annotated: false,
            save_labels: false,
            output_root: default_output_root(),
            jpeg_quality: default_jpeg_quality(),
            font_path: default_font_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryCfg {
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
}

impl Default for TelemetryCfg {
    fn default() -> Self {
        Self {
            progress_capacity: default_progress_capacity(),
        }
    }
}

fn default_resolution() -> String {
    "hd720".to_string()
}

fn default_fps() -> u32 {
    60
}

fn default_depth_min() -> f32 {
    1.0
}

fn default_depth_max() -> f32 {
    40.0
}

fn default_warmup_grabs() -> u32 {
    2
}

fn default_engine() -> String {
    "models/target.engine".to_string()
}

fn default_conf() -> f32 {
    0.25
}

fn default_nms() -> f32 {
    0.45
}

fn default_input_size() -> u32 {
    512
}

fn default_max_dets() -> usize {
    100
}

fn default_staleness() -> u64 {
    30
}

fn default_output_root() -> String {
    "runs".to_string()
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_font_path() -> String {
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string()
}

fn default_progress_capacity() -> usize {
    512
}
