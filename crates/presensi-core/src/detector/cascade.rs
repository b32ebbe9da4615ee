//! Haar-feature cascade face detector.
//!
//! Classic sliding-window detection: the grayscale frame is reduced to an
//! integral image, every window position at every scale is run through the
//! boosted stages, and surviving windows are grouped into faces.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage};
use serde::Deserialize;
use thiserror::Error;

use super::{DetectorError, Evidence, FaceCheck, FaceProbe, METHOD_CASCADE};

pub const CASCADE_CONFIDENCE: f32 = 0.7;

const DEFAULT_SCALE_FACTOR: f32 = 1.1;
const DEFAULT_MIN_NEIGHBORS: usize = 3;
/// Frames are downscaled so their longer side is at most this many pixels.
const DEFAULT_MAX_SIDE: u32 = 320;
/// Windows overlapping by at least this IoU are grouped into one face.
const GROUP_IOU_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("failed to read cascade {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse cascade {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

/// Weighted rectangle inside the base detection window.
#[derive(Debug, Clone, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

/// Decision stump over one Haar feature.
///
/// The feature value is the weighted sum of its rectangles divided by the
/// window area. It is compared against `threshold` scaled by the window's
/// standard deviation; below picks `left`, otherwise `right`.
#[derive(Debug, Clone, Deserialize)]
pub struct WeakClassifier {
    pub features: Vec<WeightedRect>,
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

/// A boosted stage. The window survives when its stump sum reaches `threshold`.
#[derive(Debug, Clone, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// Cascade definition as stored on disk (JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct Cascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
}

impl Cascade {
    pub fn validate(&self) -> Result<(), CascadeError> {
        if self.window_width == 0 || self.window_height == 0 {
            return Err(CascadeError::Invalid("window size must be non-zero".into()));
        }
        if self.stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }
        for (s, stage) in self.stages.iter().enumerate() {
            for classifier in &stage.classifiers {
                for r in &classifier.features {
                    if r.x + r.width > self.window_width || r.y + r.height > self.window_height {
                        return Err(CascadeError::Invalid(format!(
                            "stage {s}: feature rectangle exceeds {}x{} window",
                            self.window_width, self.window_height
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Tuning for the multi-scale scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanParams {
    pub scale_factor: f32,
    pub min_neighbors: usize,
    pub max_side: u32,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            max_side: DEFAULT_MAX_SIDE,
        }
    }
}

/// Axis-aligned region in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Summed-area tables for pixel values and their squares.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = gray.get_pixel(x as u32, y as u32)[0] as u64;
                row += p;
                row_sq += p * p;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sq_sum[(y + 1) * stride + x + 1] = sq_sum[y * stride + x + 1] + row_sq;
            }
        }

        Self { stride, sum, sq_sum }
    }

    fn area(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y0 * stride + x1]
            - table[y1 * stride + x0]
    }

    fn rect_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::area(&self.sum, self.stride, x, y, w, h)
    }

    fn rect_sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::area(&self.sq_sum, self.stride, x, y, w, h)
    }
}

/// Cascade-classifier face detector.
pub struct CascadeDetector {
    cascade: Cascade,
    params: ScanParams,
}

impl CascadeDetector {
    /// Load a JSON cascade with default scan parameters.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        let data = fs::read(path).map_err(|source| CascadeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cascade: Cascade =
            serde_json::from_slice(&data).map_err(|e| CascadeError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let detector = Self::new(cascade, ScanParams::default())?;
        tracing::info!(
            path = %path.display(),
            stages = detector.cascade.stages.len(),
            window = ?(detector.cascade.window_width, detector.cascade.window_height),
            "loaded face cascade"
        );
        Ok(detector)
    }

    pub fn new(cascade: Cascade, params: ScanParams) -> Result<Self, CascadeError> {
        cascade.validate()?;
        if params.scale_factor <= 1.0 {
            return Err(CascadeError::Invalid("scale factor must exceed 1.0".into()));
        }
        Ok(Self { cascade, params })
    }

    /// Detect faces in a grayscale frame. Regions are in the frame's coordinates.
    pub fn detect_faces(&self, gray: &GrayImage) -> Vec<Region> {
        let (w, h) = gray.dimensions();
        if w == 0 || h == 0 {
            return Vec::new();
        }

        let longest = w.max(h);
        let (frame, ratio) = if longest > self.params.max_side {
            let ratio = self.params.max_side as f32 / longest as f32;
            let nw = ((w as f32 * ratio).round() as u32).max(1);
            let nh = ((h as f32 * ratio).round() as u32).max(1);
            let small = image::imageops::resize(gray, nw, nh, image::imageops::FilterType::Triangle);
            (small, ratio)
        } else {
            (gray.clone(), 1.0)
        };

        let hits = self.scan(&frame);
        tracing::trace!(hits = hits.len(), "cascade raw windows");

        group_regions(&hits, self.params.min_neighbors)
            .into_iter()
            .map(|r| Region {
                x: r.x / ratio,
                y: r.y / ratio,
                width: r.width / ratio,
                height: r.height / ratio,
            })
            .collect()
    }

    fn scan(&self, frame: &GrayImage) -> Vec<Region> {
        let (w, h) = frame.dimensions();
        let integral = IntegralImage::new(frame);
        let mut hits = Vec::new();
        let mut scale = 1.0f32;

        loop {
            let win_w = (self.cascade.window_width as f32 * scale).round() as u32;
            let win_h = (self.cascade.window_height as f32 * scale).round() as u32;
            if win_w > w || win_h > h {
                break;
            }
            let step = ((scale * 2.0).round() as usize).max(1);

            for y in (0..=h - win_h).step_by(step) {
                for x in (0..=w - win_w).step_by(step) {
                    if self.window_passes(&integral, x, y, win_w, win_h, scale) {
                        hits.push(Region {
                            x: x as f32,
                            y: y as f32,
                            width: win_w as f32,
                            height: win_h as f32,
                        });
                    }
                }
            }

            scale *= self.params.scale_factor;
        }

        hits
    }

    fn window_passes(
        &self,
        integral: &IntegralImage,
        x: u32,
        y: u32,
        win_w: u32,
        win_h: u32,
        scale: f32,
    ) -> bool {
        let area = (win_w * win_h) as f64;
        let mean = integral.rect_sum(x, y, win_w, win_h) as f64 / area;
        let variance = integral.rect_sq_sum(x, y, win_w, win_h) as f64 / area - mean * mean;
        let std_dev = variance.max(0.0).sqrt() as f32;

        for stage in &self.cascade.stages {
            let mut stage_sum = 0.0f32;
            for classifier in &stage.classifiers {
                let mut value = 0.0f32;
                for r in &classifier.features {
                    let rx = ((r.x as f32 * scale).round() as u32).min(win_w - 1);
                    let ry = ((r.y as f32 * scale).round() as u32).min(win_h - 1);
                    let rw = ((r.width as f32 * scale).round() as u32).clamp(1, win_w - rx);
                    let rh = ((r.height as f32 * scale).round() as u32).clamp(1, win_h - ry);
                    value += r.weight * integral.rect_sum(x + rx, y + ry, rw, rh) as f32;
                }
                value /= area as f32;

                stage_sum += if value < classifier.threshold * std_dev {
                    classifier.left
                } else {
                    classifier.right
                };
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }

        true
    }
}

impl FaceProbe for CascadeDetector {
    fn method(&self) -> &'static str {
        METHOD_CASCADE
    }

    fn detect(&mut self, image: &DynamicImage) -> Result<FaceCheck, DetectorError> {
        let faces = self.detect_faces(&image.to_luma8());
        tracing::debug!(faces = faces.len(), "cascade detection");
        if faces.is_empty() {
            Ok(FaceCheck::failed(METHOD_CASCADE))
        } else {
            Ok(FaceCheck::passed(
                METHOD_CASCADE,
                CASCADE_CONFIDENCE,
                Evidence::FacePresence,
            ))
        }
    }
}

fn iou(a: &Region, b: &Region) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Cluster overlapping windows; keep clusters with at least `min_neighbors`
/// members, each reduced to its mean rectangle.
fn group_regions(hits: &[Region], min_neighbors: usize) -> Vec<Region> {
    let mut parent: Vec<usize> = (0..hits.len()).collect();

    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..hits.len() {
        for j in (i + 1)..hits.len() {
            if iou(&hits[i], &hits[j]) >= GROUP_IOU_THRESHOLD {
                let (ri, rj) = (root(&mut parent, i), root(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut clusters: Vec<(usize, Vec<usize>)> = Vec::new();
    for i in 0..hits.len() {
        let r = root(&mut parent, i);
        match clusters.iter_mut().find(|(id, _)| *id == r) {
            Some((_, members)) => members.push(i),
            None => clusters.push((r, vec![i])),
        }
    }

    clusters
        .into_iter()
        .filter(|(_, members)| members.len() >= min_neighbors.max(1))
        .map(|(_, members)| {
            let n = members.len() as f32;
            let mut acc = Region {
                x: 0.0,
                y: 0.0,
                width: 0.0,
                height: 0.0,
            };
            for &m in &members {
                acc.x += hits[m].x;
                acc.y += hits[m].y;
                acc.width += hits[m].width;
                acc.height += hits[m].height;
            }
            Region {
                x: acc.x / n,
                y: acc.y / n,
                width: acc.width / n,
                height: acc.height / n,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One stump that fires on a bright-left / dark-right vertical edge.
    fn edge_cascade() -> Cascade {
        Cascade {
            window_width: 4,
            window_height: 4,
            stages: vec![Stage {
                threshold: 0.5,
                classifiers: vec![WeakClassifier {
                    features: vec![
                        WeightedRect { x: 0, y: 0, width: 2, height: 4, weight: -1.0 },
                        WeightedRect { x: 2, y: 0, width: 2, height: 4, weight: 1.0 },
                    ],
                    threshold: 0.0,
                    left: 1.0,
                    right: -1.0,
                }],
            }],
        }
    }

    fn edge_image(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, _| image::Luma([if x < w / 2 { 255 } else { 0 }]))
    }

    fn params(min_neighbors: usize) -> ScanParams {
        ScanParams {
            min_neighbors,
            ..ScanParams::default()
        }
    }

    #[test]
    fn test_integral_image_sums() {
        let gray = GrayImage::from_fn(3, 2, |x, y| image::Luma([(x + y * 3) as u8]));
        let ii = IntegralImage::new(&gray);
        // Pixels: 0 1 2 / 3 4 5
        assert_eq!(ii.rect_sum(0, 0, 3, 2), 15);
        assert_eq!(ii.rect_sum(1, 0, 2, 2), 1 + 2 + 4 + 5);
        assert_eq!(ii.rect_sq_sum(0, 1, 3, 1), 9 + 16 + 25);
    }

    #[test]
    fn test_edge_is_detected() {
        let detector = CascadeDetector::new(edge_cascade(), params(1)).unwrap();
        let faces = detector.detect_faces(&edge_image(8, 8));
        assert!(!faces.is_empty());
    }

    #[test]
    fn test_uniform_frame_has_no_faces() {
        let detector = CascadeDetector::new(edge_cascade(), params(1)).unwrap();
        let flat = GrayImage::from_pixel(16, 16, image::Luma([128]));
        assert!(detector.detect_faces(&flat).is_empty());
    }

    #[test]
    fn test_reversed_edge_has_no_faces() {
        let detector = CascadeDetector::new(edge_cascade(), params(1)).unwrap();
        let gray = GrayImage::from_fn(8, 8, |x, _| image::Luma([if x < 4 { 0 } else { 255 }]));
        assert!(detector.detect_faces(&gray).is_empty());
    }

    #[test]
    fn test_probe_reports_presence() {
        let mut detector = CascadeDetector::new(edge_cascade(), params(1)).unwrap();
        let image = DynamicImage::ImageLuma8(edge_image(8, 8));
        let check = detector.detect(&image).unwrap();
        assert!(check.verified);
        assert_eq!(check.confidence, CASCADE_CONFIDENCE);
        assert_eq!(check.method, METHOD_CASCADE);
        assert_eq!(check.evidence, Evidence::FacePresence);
    }

    #[test]
    fn test_large_frames_are_downscaled_back_to_frame_coordinates() {
        let detector = CascadeDetector::new(
            edge_cascade(),
            ScanParams {
                min_neighbors: 1,
                max_side: 16,
                ..ScanParams::default()
            },
        )
        .unwrap();
        let faces = detector.detect_faces(&edge_image(64, 64));
        assert!(!faces.is_empty());
        assert!(faces.iter().all(|f| f.x + f.width <= 64.5 && f.y + f.height <= 64.5));
    }

    #[test]
    fn test_group_regions_merges_overlaps() {
        let r = |x: f32| Region { x, y: 0.0, width: 10.0, height: 10.0 };
        let hits = vec![r(0.0), r(1.0), r(2.0), r(50.0)];
        let groups = group_regions(&hits, 3);
        assert_eq!(groups.len(), 1);
        assert!((groups[0].x - 1.0).abs() < 1e-6);

        let groups = group_regions(&hits, 1);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_invalid_cascades_rejected() {
        let mut cascade = edge_cascade();
        cascade.stages[0].classifiers[0].features[1].x = 3;
        assert!(matches!(
            CascadeDetector::new(cascade, ScanParams::default()),
            Err(CascadeError::Invalid(_))
        ));

        let mut cascade = edge_cascade();
        cascade.stages.clear();
        assert!(CascadeDetector::new(cascade, ScanParams::default()).is_err());

        let bad_scale = ScanParams {
            scale_factor: 1.0,
            ..ScanParams::default()
        };
        assert!(CascadeDetector::new(edge_cascade(), bad_scale).is_err());
    }

    #[test]
    fn test_load_json_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.json");
        fs::write(
            &path,
            r#"{
                "window_width": 4, "window_height": 4,
                "stages": [{ "threshold": 0.5, "classifiers": [{
                    "threshold": 0.0, "left": 1.0, "right": -1.0,
                    "features": [
                        { "x": 0, "y": 0, "width": 2, "height": 4, "weight": -1.0 },
                        { "x": 2, "y": 0, "width": 2, "height": 4, "weight": 1.0 }
                    ]
                }]}]
            }"#,
        )
        .unwrap();

        let detector = CascadeDetector::load(&path).unwrap();
        assert_eq!(detector.cascade.stages.len(), 1);

        assert!(matches!(
            CascadeDetector::load(Path::new("/nonexistent/cascade.json")),
            Err(CascadeError::Read { .. })
        ));
    }
}
