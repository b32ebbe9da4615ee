use serde::{Deserialize, Serialize};

use crate::error::AttendanceError;

/// Default descriptor length (128-d face encodings).
pub const DEFAULT_DESCRIPTOR_DIM: usize = 128;

/// A live descriptor matches when its closest enrolled descriptor is strictly
/// nearer than this Euclidean distance.
pub const MATCH_THRESHOLD: f32 = 0.6;

/// Face descriptor: a fixed-length embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceDescriptor {
    pub values: Vec<f32>,
}

impl FaceDescriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two descriptors of equal length.
    pub fn euclidean_distance(&self, other: &FaceDescriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Check length and that every component is finite.
    pub fn validate(&self, expected_dim: usize) -> Result<(), AttendanceError> {
        if self.values.len() != expected_dim {
            return Err(AttendanceError::InvalidDescriptor(format!(
                "expected {expected_dim} values, got {}",
                self.values.len()
            )));
        }
        if let Some(pos) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(AttendanceError::InvalidDescriptor(format!(
                "value at index {pos} is not finite"
            )));
        }
        Ok(())
    }
}

/// Result of matching a live descriptor against an enrolled set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DescriptorMatch {
    pub verified: bool,
    /// `max(0, 1 - distance)`.
    pub confidence: f32,
    /// Distance to the nearest enrolled descriptor.
    pub distance: f32,
}

/// Strategy for comparing a live descriptor against a user's enrolled set.
///
/// Returns `None` when the gallery is empty so callers can tell "not
/// enrolled" apart from "no match".
pub trait Matcher {
    fn compare(
        &self,
        probe: &FaceDescriptor,
        gallery: &[FaceDescriptor],
        threshold: f32,
    ) -> Option<DescriptorMatch>;
}

/// Minimum Euclidean distance matcher.
///
/// Scans the whole gallery on every call; per-user sets are small. Entries
/// whose length differs from the probe's are never compared.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &FaceDescriptor,
        gallery: &[FaceDescriptor],
        threshold: f32,
    ) -> Option<DescriptorMatch> {
        let distance = gallery
            .iter()
            .filter(|enrolled| enrolled.dim() == probe.dim())
            .map(|enrolled| probe.euclidean_distance(enrolled))
            .fold(None, |best: Option<f32>, d| match best {
                Some(b) if b <= d => Some(b),
                _ => Some(d),
            })?;

        Some(DescriptorMatch {
            verified: distance < threshold,
            confidence: (1.0 - distance).max(0.0),
            distance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(values: &[f32]) -> FaceDescriptor {
        FaceDescriptor::new(values.to_vec())
    }

    #[test]
    fn test_euclidean_distance() {
        assert!((d(&[0.0, 0.0]).euclidean_distance(&d(&[3.0, 4.0])) - 5.0).abs() < 1e-6);
        assert_eq!(d(&[1.0, 2.0]).euclidean_distance(&d(&[1.0, 2.0])), 0.0);
    }

    #[test]
    fn test_identical_descriptor_verifies_with_full_confidence() {
        let gallery = vec![d(&[0.1, 0.2, 0.3])];
        let m = EuclideanMatcher
            .compare(&d(&[0.1, 0.2, 0.3]), &gallery, MATCH_THRESHOLD)
            .unwrap();
        assert!(m.verified);
        assert_eq!(m.distance, 0.0);
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn test_threshold_is_strict() {
        let gallery = vec![d(&[0.0, 0.0])];
        let m = EuclideanMatcher
            .compare(&d(&[0.6, 0.0]), &gallery, MATCH_THRESHOLD)
            .unwrap();
        assert!(!m.verified, "distance {} must not verify", m.distance);
    }

    #[test]
    fn test_far_descriptor_rejected_and_confidence_floored() {
        let gallery = vec![d(&[0.0, 0.0]), d(&[10.0, 10.0])];
        let m = EuclideanMatcher
            .compare(&d(&[3.0, 4.0]), &gallery, MATCH_THRESHOLD)
            .unwrap();
        assert!(!m.verified);
        assert!((m.distance - 5.0).abs() < 1e-6);
        assert_eq!(m.confidence, 0.0);
    }

    #[test]
    fn test_nearest_entry_wins_regardless_of_position() {
        let gallery = vec![d(&[5.0, 5.0]), d(&[1.0, 1.0]), d(&[0.1, 0.0])];
        let m = EuclideanMatcher
            .compare(&d(&[0.0, 0.0]), &gallery, MATCH_THRESHOLD)
            .unwrap();
        assert!(m.verified);
        assert!((m.distance - 0.1).abs() < 1e-6);
        assert!((m.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_gallery_entries_of_other_length_are_skipped() {
        let gallery = vec![d(&[0.1, 0.2, 9.0, 9.0]), d(&[3.0, 4.0])];
        let m = EuclideanMatcher
            .compare(&d(&[0.0, 0.0]), &gallery, MATCH_THRESHOLD)
            .unwrap();
        assert!(!m.verified);
        assert!((m.distance - 5.0).abs() < 1e-6);

        let gallery = vec![d(&[0.1, 0.2, 9.0, 9.0])];
        assert!(EuclideanMatcher
            .compare(&d(&[0.1, 0.2]), &gallery, MATCH_THRESHOLD)
            .is_none());
    }

    #[test]
    fn test_empty_gallery_is_none() {
        assert!(EuclideanMatcher.compare(&d(&[1.0]), &[], MATCH_THRESHOLD).is_none());
    }

    #[test]
    fn test_validate_dimension_and_finiteness() {
        assert!(d(&[0.0, 1.0]).validate(2).is_ok());
        assert!(matches!(
            d(&[0.0]).validate(2),
            Err(AttendanceError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            d(&[0.0, f32::NAN]).validate(2),
            Err(AttendanceError::InvalidDescriptor(_))
        ));
    }
}
