use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use rusttype::{point, Font, Scale};
use telemetry::{EventBus, WarningKind};

use crate::packets::{BBox, DepthStats, Detection, CLASS_IN_RANGE, CLASS_OUT_OF_RANGE};

const IN_RANGE_COLOR: [u8; 3] = [0, 255, 0];
const OUT_OF_RANGE_COLOR: [u8; 3] = [255, 0, 0];
const OTHER_CLASS_COLOR: [u8; 3] = [128, 128, 128];
const LABEL_TEXT_COLOR: [u8; 3] = [255, 255, 255];
const LABEL_FONT_PX: f32 = 16.0;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub save_annotated: bool,
    pub save_labels: bool,
    pub jpeg_quality: u8,
    pub font_path: PathBuf,
}

impl WriterConfig {
    pub fn enabled(&self) -> bool {
        self.save_annotated || self.save_labels
    }
}

impl From<&config::WriterCfg> for WriterConfig {
    fn from(cfg: &config::WriterCfg) -> Self {
        Self {
            save_annotated: cfg.save_annotated,
            save_labels: cfg.save_labels,
            jpeg_quality: cfg.jpeg_quality,
            font_path: PathBuf::from(&cfg.font_path),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterTotals {
    pub jpeg_written: u64,
    pub txt_written: u64,
    pub drops: u64,
    pub io_errors: u64,
}

#[derive(Default)]
struct Counters {
    jpeg: AtomicU64,
    txt: AtomicU64,
    drops: AtomicU64,
    io_errors: AtomicU64,
}

struct Job {
    index: u64,
    image: RgbImage,
    detections: Vec<Detection>,
    depth: Vec<DepthStats>,
}

/// Best-effort artifact writer with a single-slot buffer. Dispatch never
/// blocks the pipeline: when the previous write is still in flight the new
/// artifact is dropped and counted.
pub struct ArtifactWriter {
    tx: Option<SyncSender<Job>>,
    worker: Option<thread::JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl ArtifactWriter {
    pub fn spawn(frames_dir: PathBuf, cfg: WriterConfig, bus: EventBus) -> Self {
        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::sync_channel::<Job>(1);

        let worker_counters = Arc::clone(&counters);
        let worker = thread::spawn(move || {
            let font = if cfg.save_annotated {
                match fs::read(&cfg.font_path) {
                    Ok(bytes) => {
                        let font = Font::try_from_vec(bytes);
                        if font.is_none() {
                            bus.warn(
                                WarningKind::FontUnavailable,
                                format!("unusable font file {}", cfg.font_path.display()),
                            );
                        }
                        font
                    }
                    Err(e) => {
                        bus.warn(
                            WarningKind::FontUnavailable,
                            format!("{}: {e}", cfg.font_path.display()),
                        );
                        None
                    }
                }
            } else {
                None
            };

            let mut dir_ready = false;
            while let Ok(job) = rx.recv() {
                if !dir_ready {
                    if let Err(e) = fs::create_dir_all(&frames_dir) {
                        worker_counters.io_errors.fetch_add(1, Ordering::Relaxed);
                        bus.warn(WarningKind::WriterIo, format!("create {}: {e}", frames_dir.display()));
                        continue;
                    }
                    dir_ready = true;
                }

                if cfg.save_annotated {
                    let path = frames_dir.join(format!("frame_{:06}.jpg", job.index));
                    let annotated =
                        annotate(&job.image, &job.detections, &job.depth, font.as_ref());
                    match write_jpeg(&path, &annotated, cfg.jpeg_quality) {
                        Ok(()) => {
                            worker_counters.jpeg.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            worker_counters.io_errors.fetch_add(1, Ordering::Relaxed);
                            bus.warn(WarningKind::WriterIo, format!("{}: {e}", path.display()));
                        }
                    }
                }

                if cfg.save_labels {
                    let path = frames_dir.join(format!("frame_{:06}.txt", job.index));
                    let (w, h) = (job.image.width(), job.image.height());
                    match write_label_file(&path, &job.detections, w, h) {
                        Ok(()) => {
                            worker_counters.txt.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            worker_counters.io_errors.fetch_add(1, Ordering::Relaxed);
                            bus.warn(WarningKind::WriterIo, format!("{}: {e}", path.display()));
                        }
                    }
                }
            }
        });

        Self {
            tx: Some(tx),
            worker: Some(worker),
            counters,
        }
    }

    /// Fire-and-forget: clones the frame into the slot, or drops it when the
    /// worker is behind.
    pub fn dispatch(
        &self,
        index: u64,
        image: &RgbImage,
        detections: &[Detection],
        depth: &[DepthStats],
    ) {
        let Some(tx) = &self.tx else { return };
        let job = Job {
            index,
            image: image.clone(),
            detections: detections.to_vec(),
            depth: depth.to_vec(),
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.counters.drops.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.io_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn totals(&self) -> WriterTotals {
        WriterTotals {
            jpeg_written: self.counters.jpeg.load(Ordering::Relaxed),
            txt_written: self.counters.txt.load(Ordering::Relaxed),
            drops: self.counters.drops.load(Ordering::Relaxed),
            io_errors: self.counters.io_errors.load(Ordering::Relaxed),
        }
    }

    /// Drains the in-flight job and joins the worker.
    pub fn finish(mut self) -> WriterTotals {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.totals()
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn write_jpeg(path: &std::path::Path, image: &RgbImage, quality: u8) -> anyhow::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality).encode_image(image)?;
    writer.flush()?;
    Ok(())
}

/// YOLO label text: one `class cx cy w h` line per detection, center and size
/// normalized by image dimensions, six decimals, trailing newline. An empty
/// frame still produces an (empty) file so the frame index stays complete.
pub fn write_label_file(
    path: &std::path::Path,
    detections: &[Detection],
    width: u32,
    height: u32,
) -> anyhow::Result<()> {
    let mut out = String::new();
    for det in detections {
        out.push_str(&format_label_line(det.class_id, &det.bbox, width, height));
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

pub fn format_label_line(class_id: i32, bbox: &BBox, width: u32, height: u32) -> String {
    let (cx, cy) = bbox.center();
    let w = width as f32;
    let h = height as f32;
    format!(
        "{} {:.6} {:.6} {:.6} {:.6}",
        class_id,
        cx / w,
        cy / h,
        bbox.width() / w,
        bbox.height() / h
    )
}

/// Parses one label line back into (class_id, cx, cy, w, h), all normalized.
pub fn parse_label_line(line: &str) -> Option<(i32, f32, f32, f32, f32)> {
    let mut parts = line.split_whitespace();
    let class_id = parts.next()?.parse().ok()?;
    let cx = parts.next()?.parse().ok()?;
    let cy = parts.next()?.parse().ok()?;
    let w = parts.next()?.parse().ok()?;
    let h = parts.next()?.parse().ok()?;
    Some((class_id, cx, cy, w, h))
}

pub fn class_color(class_id: i32) -> [u8; 3] {
    match class_id {
        CLASS_IN_RANGE => IN_RANGE_COLOR,
        CLASS_OUT_OF_RANGE => OUT_OF_RANGE_COLOR,
        _ => OTHER_CLASS_COLOR,
    }
}

/// Renders the left image with one rectangle and label per detection.
/// Without a usable font the label text is skipped and boxes still render.
pub fn annotate(
    image: &RgbImage,
    detections: &[Detection],
    depth: &[DepthStats],
    font: Option<&Font>,
) -> RgbImage {
    let mut out = image.clone();
    for (i, det) in detections.iter().enumerate() {
        let color = class_color(det.class_id);
        draw_bbox(&mut out, &det.bbox, color);

        if let Some(font) = font {
            let text = match depth.get(i) {
                Some(stats) if stats.has_depth() => {
                    format!("C:{:.2} D:{:.2}m", det.confidence, stats.mean_m)
                }
                _ => format!("C:{:.2} D:--", det.confidence),
            };
            let x = det.bbox.x1.max(0.0) as i32;
            let y = (det.bbox.y1 - LABEL_FONT_PX - 4.0).max(0.0) as i32;
            draw_text(&mut out, font, &text, x, y, LABEL_FONT_PX, LABEL_TEXT_COLOR, Some(color));
        }
    }
    out
}

fn draw_bbox(image: &mut RgbImage, bbox: &BBox, color: [u8; 3]) {
    let (width, height) = (image.width(), image.height());

    let mut left = bbox.x1.floor() as i32;
    let mut top = bbox.y1.floor() as i32;
    let mut right = bbox.x2.ceil() as i32;
    let mut bottom = bbox.y2.ceil() as i32;

    left = left.clamp(0, width.saturating_sub(1) as i32);
    top = top.clamp(0, height.saturating_sub(1) as i32);
    right = right.clamp(0, width.saturating_sub(1) as i32);
    bottom = bottom.clamp(0, height.saturating_sub(1) as i32);

    if left >= right || top >= bottom {
        return;
    }

    let color = Rgb(color);
    for x in left..=right {
        put_pixel(image, x, top, color);
        put_pixel(image, x, bottom, color);
    }
    for y in top..=bottom {
        put_pixel(image, left, y, color);
        put_pixel(image, right, y, color);
    }
}

fn put_pixel(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 {
        let (x_u32, y_u32) = (x as u32, y as u32);
        if x_u32 < image.width() && y_u32 < image.height() {
            image.put_pixel(x_u32, y_u32, color);
        }
    }
}

fn draw_text(
    image: &mut RgbImage,
    font: &Font,
    text: &str,
    x: i32,
    y: i32,
    font_px: f32,
    color: [u8; 3],
    background: Option<[u8; 3]>,
) {
    let scale = Scale::uniform(font_px);
    let v_metrics = font.v_metrics(scale);
    let glyphs: Vec<_> = font
        .layout(text, scale, point(x as f32, y as f32 + v_metrics.ascent))
        .collect();

    if let Some(bg) = background {
        let text_w: i32 = glyphs
            .iter()
            .filter_map(|g| g.pixel_bounding_box())
            .map(|bb| bb.max.x - x)
            .max()
            .unwrap_or(0);
        let bg = Rgb(bg);
        for yy in y..y + font_px as i32 + 4 {
            for xx in x..x + text_w + 2 {
                put_pixel(image, xx, yy, bg);
            }
        }
    }

    for glyph in glyphs {
        if let Some(bb) = glyph.pixel_bounding_box() {
            glyph.draw(|gx, gy, v| {
                let px = bb.min.x + gx as i32;
                let py = bb.min.y + gy as i32;
                if px >= 0 && py >= 0 && (px as u32) < image.width() && (py as u32) < image.height()
                {
                    let pixel = image.get_pixel_mut(px as u32, py as u32);
                    for c in 0..3 {
                        let base = pixel[c] as f32;
                        pixel[c] = (base + (color[c] as f32 - base) * v) as u8;
                    }
                }
            });
        }
    }
}
