use crate::camera::Roi;
use crate::packets::{DepthStats, Detection};

/// Dense per-pixel distance map in meters, row-major, spatially aligned with
/// the left rectified image.
#[derive(Debug, Clone)]
pub struct DepthMap {
    data: Vec<f32>,
    width: u32,
    height: u32,
}

impl DepthMap {
    pub fn new(data: Vec<f32>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self { data, width, height }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Copies out a sub-region as its own map.
    pub fn crop(&self, roi: Roi) -> DepthMap {
        let x2 = (roi.x + roi.w).min(self.width);
        let y2 = (roi.y + roi.h).min(self.height);
        let x1 = roi.x.min(x2);
        let y1 = roi.y.min(y2);
        let (w, h) = (x2 - x1, y2 - y1);
        let mut data = Vec::with_capacity((w * h) as usize);
        for y in y1..y2 {
            let row = (y * self.width) as usize;
            data.extend_from_slice(&self.data[row + x1 as usize..row + x2 as usize]);
        }
        DepthMap::new(data, w, h)
    }
}

/// Masks invalid samples and aggregates depth per detection.
///
/// Invalidity is pervasive in stereo depth (occlusion, reflective surfaces,
/// out-of-range geometry); a sample is valid iff it is finite, positive and
/// inside the configured clipping interval.
#[derive(Debug, Clone, Copy)]
pub struct DepthExtractor {
    min_m: f32,
    max_m: f32,
}

impl DepthExtractor {
    pub fn new(min_m: f32, max_m: f32) -> Self {
        Self { min_m, max_m }
    }

    /// One aggregate per detection, index-aligned. Detections outside the
    /// in-range class carry the no-depth sentinel.
    pub fn extract(&self, map: &DepthMap, detections: &[Detection]) -> Vec<DepthStats> {
        detections
            .iter()
            .map(|det| {
                if !det.is_in_range_class() {
                    return DepthStats::NO_DEPTH;
                }
                match det.bbox.clip(map.width(), map.height()) {
                    Some(rect) => self.aggregate(map, rect.x, rect.y, rect.w, rect.h),
                    None => DepthStats::NO_DEPTH,
                }
            })
            .collect()
    }

    fn aggregate(&self, map: &DepthMap, x: u32, y: u32, w: u32, h: u32) -> DepthStats {
        let mut count = 0usize;
        let mut sum = 0.0f64;
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;

        for yy in y..y + h {
            for xx in x..x + w {
                let v = map.get(xx, yy);
                if Self::is_valid(v, self.min_m, self.max_m) {
                    count += 1;
                    sum += v as f64;
                    min = min.min(v);
                    max = max.max(v);
                }
            }
        }

        if count == 0 {
            return DepthStats::NO_DEPTH;
        }

        let mean = (sum / count as f64) as f32;

        // Sample (unbiased) standard deviation; zero for a single sample.
        let stdev = if count == 1 {
            0.0
        } else {
            let mut sq = 0.0f64;
            for yy in y..y + h {
                for xx in x..x + w {
                    let v = map.get(xx, yy);
                    if Self::is_valid(v, self.min_m, self.max_m) {
                        let d = v as f64 - mean as f64;
                        sq += d * d;
                    }
                }
            }
            (sq / (count as f64 - 1.0)).sqrt() as f32
        };

        DepthStats {
            valid_count: count,
            mean_m: mean,
            min_m: min,
            max_m: max,
            stdev_m: stdev,
        }
    }

    #[inline]
    fn is_valid(v: f32, min_m: f32, max_m: f32) -> bool {
        v.is_finite() && v > 0.0 && v >= min_m && v <= max_m
    }
}
