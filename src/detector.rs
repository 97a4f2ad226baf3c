use std::path::Path;

use image::{imageops::FilterType, DynamicImage, RgbImage};
use ort::{
    execution_providers::TensorRTExecutionProvider,
    memory::{AllocationDevice, Allocator, AllocatorType, MemoryInfo, MemoryType},
    session::Session,
    value::Tensor,
};

use crate::packets::{Detection, DetectorError};
use crate::post::{postprocess_yolo, YoloPostConfig};

/// Load-time detector parameters. Confidence filtering happens here and only
/// here; the orchestrator never filters detections further.
#[derive(Debug, Clone, Copy)]
pub struct DetectorOptions {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub input_size: u32,
    pub num_classes: usize,
    pub max_detections: usize,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            nms_threshold: 0.45,
            input_size: 512,
            num_classes: 2,
            max_detections: 100,
        }
    }
}

/// Maps a left rectified image to post-NMS detections in the same pixel
/// coordinate frame. Implementations must not retain references to the input
/// buffer after returning.
pub trait Detector: Send {
    fn infer(&mut self, left: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Detector that never reports anything; used by the grab-bench mode.
pub struct NullDetector;

impl Detector for NullDetector {
    fn infer(&mut self, _left: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        Ok(Vec::new())
    }
}

/// YOLO detector on an ort session with the TensorRT execution provider.
/// The prebuilt engine artifact is consumed through the provider's on-disk
/// engine cache next to the model file.
pub struct OrtDetector {
    session: Session,
    gpu_allocator: Option<Allocator>,
    cpu_allocator: Allocator,
    opts: DetectorOptions,
    input_len: usize,
}

/// Initializes the process-wide ort environment with the TensorRT provider.
/// Safe to call more than once; later calls reuse the first configuration.
pub fn init_environment(engine_cache_dir: &Path) -> Result<(), DetectorError> {
    let committed = ort::init()
        .with_name("skytrack")
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_device_id(0)
                .with_fp16(true)
                .with_engine_cache(true)
                .with_engine_cache_path(engine_cache_dir.to_string_lossy())
                .build(),
        ])
        .commit()
        .map_err(load_err)?;

    if !committed {
        telemetry::log::emit("ort_env_reused", 0.0);
    }

    Ok(())
}

impl OrtDetector {
    pub fn load(model_path: &Path, opts: DetectorOptions) -> Result<Self, DetectorError> {
        let cache_dir = model_path.parent().unwrap_or_else(|| Path::new("."));
        init_environment(cache_dir)?;

        let session = Session::builder()
            .map_err(load_err)?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(load_err)?
            .commit_from_file(model_path)
            .map_err(load_err)?;

        let cpu_allocator = Allocator::new(
            &session,
            MemoryInfo::new(AllocationDevice::CPU, 0, AllocatorType::Device, MemoryType::Default)
                .map_err(load_err)?,
        )
        .map_err(load_err)?;

        let gpu_allocator = Allocator::new(
            &session,
            MemoryInfo::new(AllocationDevice::CUDA, 0, AllocatorType::Device, MemoryType::Default)
                .map_err(load_err)?,
        )
        .ok();

        let side = opts.input_size as usize;
        Ok(Self {
            session,
            gpu_allocator,
            cpu_allocator,
            opts,
            input_len: 3 * side * side,
        })
    }

    fn run_session(&mut self, input_data: &[f32]) -> Result<Vec<f32>, DetectorError> {
        let side = self.opts.input_size as usize;
        let shape = [1usize, 3, side, side];

        let allocator = self.gpu_allocator.as_ref().unwrap_or(&self.cpu_allocator);
        let mut input_tensor = Tensor::<f32>::new(allocator, shape).map_err(infer_err)?;

        if input_tensor.memory_info().is_cpu_accessible() {
            let (_, tensor_data) = input_tensor.try_extract_tensor_mut::<f32>().map_err(infer_err)?;
            tensor_data.copy_from_slice(input_data);
        } else {
            let mut staging = Tensor::<f32>::new(&Allocator::default(), shape).map_err(infer_err)?;
            let (_, staging_data) = staging.try_extract_tensor_mut::<f32>().map_err(infer_err)?;
            staging_data.copy_from_slice(input_data);
            staging.copy_into(&mut input_tensor).map_err(infer_err)?;
        }

        let mut io_binding = self.session.create_binding().map_err(infer_err)?;
        io_binding.bind_input("images", &input_tensor).map_err(infer_err)?;
        let cpu_mem_info = self.cpu_allocator.memory_info();
        io_binding
            .bind_output_to_device("output", &cpu_mem_info)
            .map_err(infer_err)?;

        let outputs = self.session.run_binding(&io_binding).map_err(infer_err)?;

        if let Some(value) = outputs.get("output") {
            let (_, data) = value.try_extract_tensor::<f32>().map_err(infer_err)?;
            Ok(data.to_vec())
        } else if let Some(value_ref) = outputs.values().next() {
            let owned = value_ref
                .try_upgrade()
                .map_err(|_| DetectorError::Infer("unable to access output tensor".into()))?;
            let (_, data) = owned.try_extract_tensor::<f32>().map_err(infer_err)?;
            Ok(data.to_vec())
        } else {
            Err(DetectorError::Infer("no outputs returned from session".into()))
        }
    }
}

impl Detector for OrtDetector {
    fn infer(&mut self, left: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let pre = letterbox(left, self.opts.input_size);
        debug_assert_eq!(pre.normalized.len(), self.input_len);

        let predictions = self.run_session(&pre.normalized)?;

        let cfg = YoloPostConfig {
            num_classes: self.opts.num_classes,
            confidence_threshold: self.opts.confidence_threshold,
            nms_threshold: self.opts.nms_threshold,
            max_detections: self.opts.max_detections,
            letterbox_scale: pre.scale,
            letterbox_pad: pre.pad,
            original_size: (left.width(), left.height()),
        };
        Ok(postprocess_yolo(&predictions, &cfg))
    }
}

fn load_err(e: ort::Error) -> DetectorError {
    DetectorError::EngineLoad(e.to_string())
}

fn infer_err(e: ort::Error) -> DetectorError {
    DetectorError::Infer(e.to_string())
}

struct LetterboxedInput {
    normalized: Vec<f32>,
    scale: f32,
    pad: (f32, f32),
}

/// Aspect-preserving resize onto a gray square canvas, CHW normalized to
/// [0, 1].
fn letterbox(image: &RgbImage, input_size: u32) -> LetterboxedInput {
    let (orig_w, orig_h) = (image.width() as f32, image.height() as f32);
    let scale = (input_size as f32 / orig_w).min(input_size as f32 / orig_h);
    let new_w = ((orig_w * scale).round() as u32).max(1);
    let new_h = ((orig_h * scale).round() as u32).max(1);

    let resized = DynamicImage::ImageRgb8(image.clone())
        .resize_exact(new_w, new_h, FilterType::Triangle)
        .to_rgb8();

    let pad_x = (input_size - new_w) / 2;
    let pad_y = (input_size - new_h) / 2;

    let mut canvas = RgbImage::from_pixel(input_size, input_size, image::Rgb([114, 114, 114]));
    for y in 0..new_h {
        for x in 0..new_w {
            canvas.put_pixel(x + pad_x, y + pad_y, *resized.get_pixel(x, y));
        }
    }

    let plane = (input_size * input_size) as usize;
    let mut normalized = vec![0.0f32; plane * 3];
    for y in 0..input_size {
        for x in 0..input_size {
            let pixel = canvas.get_pixel(x, y);
            let idx = (y * input_size + x) as usize;
            normalized[idx] = pixel[0] as f32 / 255.0;
            normalized[idx + plane] = pixel[1] as f32 / 255.0;
            normalized[idx + 2 * plane] = pixel[2] as f32 / 255.0;
        }
    }

    LetterboxedInput {
        normalized,
        scale,
        pad: (pad_x as f32, pad_y as f32),
    }
}
