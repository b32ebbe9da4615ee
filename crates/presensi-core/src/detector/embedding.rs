//! Embedding-based face check via ONNX Runtime.
//!
//! SCRFD locates the most confident face; the crop is passed through ArcFace
//! to obtain an encoding. Producing an encoding proves a face is present. It
//! is never compared against the enrolled set here.

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

use super::{DetectorError, Evidence, FaceCheck, FaceProbe, METHOD_EMBEDDING};

pub const EMBEDDING_CONFIDENCE: f32 = 0.8;

// --- SCRFD ---
const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

// --- ArcFace ---
const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputs = (usize, usize);

/// Mapping between frame coordinates and the square detector input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    width: u32,
    height: u32,
}

fn letterbox(width: u32, height: u32, target: u32) -> Letterbox {
    let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, target);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, target);
    Letterbox {
        scale,
        pad_x: (target - new_w) / 2,
        pad_y: (target - new_h) / 2,
        width: new_w,
        height: new_h,
    }
}

/// Best-scoring face box, in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    score: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

pub struct EmbeddingDetector {
    detector: Session,
    encoder: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl EmbeddingDetector {
    /// Load the SCRFD detector and ArcFace encoder.
    pub fn load(scrfd_path: &Path, arcface_path: &Path) -> Result<Self, DetectorError> {
        let detector = open_session(scrfd_path)?;
        let encoder = open_session(arcface_path)?;

        let output_names: Vec<String> = detector
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }
        let stride_outputs = discover_outputs(&output_names);

        tracing::info!(
            scrfd = %scrfd_path.display(),
            arcface = %arcface_path.display(),
            ?stride_outputs,
            "embedding detector loaded"
        );

        Ok(Self {
            detector,
            encoder,
            stride_outputs,
        })
    }

    /// Encoding of the most confident face, or `None` when no face is found.
    pub fn best_face_encoding(
        &mut self,
        image: &DynamicImage,
    ) -> Result<Option<Vec<f32>>, DetectorError> {
        let rgb = image.to_rgb8();
        let Some(face) = self.locate(&rgb)? else {
            return Ok(None);
        };
        let Some(crop) = crop_face(&rgb, &face) else {
            return Ok(None);
        };

        let input = arcface_tensor(&crop);
        let outputs = self
            .encoder
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("encoding extraction: {e}")))?;

        let encoding = l2_normalize(raw);
        if encoding.is_empty() || encoding.iter().any(|v| !v.is_finite()) {
            return Ok(None);
        }
        tracing::debug!(score = face.score, dim = encoding.len(), "face encoded");
        Ok(Some(encoding))
    }

    fn locate(&mut self, rgb: &RgbImage) -> Result<Option<Candidate>, DetectorError> {
        let (input, lb) = scrfd_tensor(rgb);
        let stride_outputs = self.stride_outputs;
        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut best: Option<Candidate> = None;
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = stride_outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            if let Some(c) = best_anchor(scores, bboxes, stride, &lb) {
                if best.map_or(true, |b| c.score > b.score) {
                    best = Some(c);
                }
            }
        }

        Ok(best)
    }
}

impl FaceProbe for EmbeddingDetector {
    fn method(&self) -> &'static str {
        METHOD_EMBEDDING
    }

    fn detect(&mut self, image: &DynamicImage) -> Result<FaceCheck, DetectorError> {
        match self.best_face_encoding(image)? {
            Some(_) => Ok(FaceCheck::passed(
                METHOD_EMBEDDING,
                EMBEDDING_CONFIDENCE,
                Evidence::FacePresence,
            )),
            None => Ok(FaceCheck::failed(METHOD_EMBEDDING)),
        }
    }
}

fn open_session(path: &Path) -> Result<Session, DetectorError> {
    if !path.exists() {
        return Err(DetectorError::ModelNotFound(path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;
    Ok(session)
}

/// Map score/bbox tensors to stride slots by name ("score_8", "bbox_16", ...),
/// falling back to the standard positional layout [scores 8/16/32, bboxes 8/16/32].
fn discover_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut mapped = [(0usize, 0usize); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => mapped[slot] = (score, bbox),
            _ => {
                tracing::debug!(?names, "SCRFD output names not recognized; using positional mapping");
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    mapped
}

/// Letterbox an RGB frame into a normalized 1x3xNxN tensor.
fn scrfd_tensor(rgb: &RgbImage) -> (Array4<f32>, Letterbox) {
    let size = SCRFD_INPUT_SIZE as usize;
    let lb = letterbox(rgb.width(), rgb.height(), SCRFD_INPUT_SIZE);
    let resized = image::imageops::resize(rgb, lb.width, lb.height, FilterType::Triangle);

    // Zero is the normalized value of the SCRFD mean, i.e. the padding colour.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + lb.pad_x) as usize, (y + lb.pad_y) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, lb)
}

/// Resize a face crop to the ArcFace input and normalize.
fn arcface_tensor(crop: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let resized = image::imageops::resize(
        crop,
        ARCFACE_INPUT_SIZE,
        ARCFACE_INPUT_SIZE,
        FilterType::Triangle,
    );

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

/// Highest-scoring anchor above the threshold for one stride level.
fn best_anchor(scores: &[f32], bboxes: &[f32], stride: usize, lb: &Letterbox) -> Option<Candidate> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

    let mut best: Option<(usize, f32)> = None;
    for idx in 0..num_anchors.min(scores.len()) {
        let score = scores[idx];
        if score > SCRFD_SCORE_THRESHOLD && best.map_or(true, |(_, s)| score > s) {
            best = Some((idx, score));
        }
    }

    let (idx, score) = best?;
    let off = idx * 4;
    if off + 3 >= bboxes.len() {
        return None;
    }

    let anchor = idx / SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let cx = (anchor % grid) as f32 * s;
    let cy = (anchor / grid) as f32 * s;

    let unmap_x = |v: f32| (v - lb.pad_x as f32) / lb.scale;
    let unmap_y = |v: f32| (v - lb.pad_y as f32) / lb.scale;

    Some(Candidate {
        score,
        x1: unmap_x(cx - bboxes[off] * s),
        y1: unmap_y(cy - bboxes[off + 1] * s),
        x2: unmap_x(cx + bboxes[off + 2] * s),
        y2: unmap_y(cy + bboxes[off + 3] * s),
    })
}

/// Crop the candidate box, clamped to the frame. `None` if nothing remains.
fn crop_face(rgb: &RgbImage, face: &Candidate) -> Option<RgbImage> {
    let (w, h) = (rgb.width() as f32, rgb.height() as f32);
    let x0 = face.x1.clamp(0.0, w).floor() as u32;
    let y0 = face.y1.clamp(0.0, h).floor() as u32;
    let x1 = face.x2.clamp(0.0, w).ceil() as u32;
    let y1 = face.y2.clamp(0.0, h).ceil() as u32;
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(image::imageops::crop_imm(rgb, x0, y0, x1 - x0, y1 - y0).to_image())
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_letterbox() -> Letterbox {
        Letterbox {
            scale: 1.0,
            pad_x: 0,
            pad_y: 0,
            width: SCRFD_INPUT_SIZE,
            height: SCRFD_INPUT_SIZE,
        }
    }

    #[test]
    fn test_letterbox_landscape() {
        let lb = letterbox(320, 240, 640);
        assert_eq!(lb.scale, 2.0);
        assert_eq!((lb.width, lb.height), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
    }

    #[test]
    fn test_letterbox_portrait_downscale() {
        let lb = letterbox(1000, 2000, 640);
        assert_eq!((lb.width, lb.height), (320, 640));
        assert_eq!((lb.pad_x, lb.pad_y), (160, 0));
    }

    #[test]
    fn test_best_anchor_decodes_box() {
        let stride = 32;
        let grid = 640 / stride;
        let mut scores = vec![0.0f32; grid * grid * 2];
        let mut bboxes = vec![0.0f32; grid * grid * 2 * 4];
        // Cell (x=2, y=2), first anchor.
        let idx = 2 * (2 * grid + 2);
        scores[idx] = 0.9;
        scores[3] = 0.6;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let c = best_anchor(&scores, &bboxes, stride, &identity_letterbox()).unwrap();
        assert_eq!(c.score, 0.9);
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (32.0, 32.0, 96.0, 96.0));
    }

    #[test]
    fn test_best_anchor_unmaps_letterbox() {
        let stride = 32;
        let grid = 640 / stride;
        let mut scores = vec![0.0f32; grid * grid * 2];
        let mut bboxes = vec![0.0f32; grid * grid * 2 * 4];
        let idx = 2 * (3 * grid + 3);
        scores[idx] = 0.8;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);

        let lb = letterbox(320, 240, 640); // scale 2, pad_y 80
        let c = best_anchor(&scores, &bboxes, stride, &lb).unwrap();
        // Anchor (96, 96) +/- 16 in input space.
        assert_eq!(c.x1, 40.0);
        assert_eq!(c.x2, 56.0);
        assert_eq!(c.y1, 0.0);
        assert_eq!(c.y2, 16.0);
    }

    #[test]
    fn test_best_anchor_below_threshold() {
        let scores = vec![0.4f32; 800];
        let bboxes = vec![0.0f32; 3200];
        assert!(best_anchor(&scores, &bboxes, 32, &identity_letterbox()).is_none());
    }

    #[test]
    fn test_discover_outputs_named() {
        let names: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(discover_outputs(&names), [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn test_discover_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_outputs(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_crop_face_clamps_to_frame() {
        let rgb = RgbImage::new(50, 40);
        let face = Candidate { score: 0.9, x1: -10.0, y1: 5.0, x2: 30.5, y2: 100.0 };
        let crop = crop_face(&rgb, &face).unwrap();
        assert_eq!(crop.dimensions(), (31, 35));

        let outside = Candidate { score: 0.9, x1: 60.0, y1: 0.0, x2: 80.0, y2: 10.0 };
        assert!(crop_face(&rgb, &outside).is_none());
    }

    #[test]
    fn test_tensor_shapes_and_padding() {
        let rgb = RgbImage::from_pixel(320, 240, image::Rgb([255, 255, 255]));
        let (tensor, lb) = scrfd_tensor(&rgb);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        // Top padding band stays at the normalized mean.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 1, lb.pad_y as usize + 10, 10]];
        assert!((inside - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-5);

        let crop = RgbImage::from_pixel(10, 10, image::Rgb([128, 128, 128]));
        let face = arcface_tensor(&crop);
        assert_eq!(face.shape(), &[1, 3, 112, 112]);
        assert!((face[[0, 2, 50, 50]] - (128.0 - ARCFACE_MEAN) / ARCFACE_STD).abs() < 1e-5);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
