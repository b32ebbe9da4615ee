//! Server-side face checks, ordered from strongest to weakest.
//!
//! The chain is assembled once at startup. Strategies whose models or
//! cascade files cannot be loaded are left out at that point, so a request
//! only ever walks tiers that can actually run.

pub mod basic;
pub mod cascade;
pub mod embedding;

use std::path::PathBuf;

use image::DynamicImage;
use serde::Serialize;
use thiserror::Error;

pub use basic::BasicCheck;
pub use cascade::CascadeDetector;
pub use embedding::EmbeddingDetector;

pub const METHOD_CLIENT: &str = "client-asserted";
pub const METHOD_EMBEDDING: &str = "embedding-detector";
pub const METHOD_CASCADE: &str = "cv-detector";
pub const METHOD_BASIC: &str = "basic-check";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("cascade error: {0}")]
    Cascade(#[from] cascade::CascadeError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// What a positive check actually establishes.
///
/// Only descriptor matching against the enrolled set confirms identity; none
/// of the admission tiers do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Evidence {
    /// The submitting client says it saw a face.
    ClientAsserted,
    /// A server-side detector found a face. Not an identity match.
    FacePresence,
    /// The payload is a well-formed image and nothing more.
    ImageValidity,
    None,
}

/// Result of one face check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceCheck {
    pub verified: bool,
    pub confidence: f32,
    pub method: &'static str,
    pub evidence: Evidence,
}

impl FaceCheck {
    pub fn passed(method: &'static str, confidence: f32, evidence: Evidence) -> Self {
        Self {
            verified: true,
            confidence,
            method,
            evidence,
        }
    }

    pub fn failed(method: &'static str) -> Self {
        Self {
            verified: false,
            confidence: 0.0,
            method,
            evidence: Evidence::None,
        }
    }
}

/// One server-side verification strategy.
pub trait FaceProbe: Send {
    fn method(&self) -> &'static str;

    /// Inspect a decoded image. `Ok` with `verified == false` and `Err` both
    /// send the chain on to the next tier.
    fn detect(&mut self, image: &DynamicImage) -> Result<FaceCheck, DetectorError>;
}

/// Where the optional tiers load their data from.
#[derive(Debug, Clone, Default)]
pub struct ChainConfig {
    pub scrfd_model: Option<PathBuf>,
    pub arcface_model: Option<PathBuf>,
    pub cascade: Option<PathBuf>,
}

/// Immutable, ordered list of face probes.
pub struct DetectorChain {
    probes: Vec<Box<dyn FaceProbe>>,
}

impl DetectorChain {
    /// Build a chain from explicit probes, in order.
    pub fn new(probes: Vec<Box<dyn FaceProbe>>) -> Self {
        Self { probes }
    }

    /// A chain holding only the image validity check.
    pub fn basic_only() -> Self {
        Self::new(vec![Box::new(BasicCheck)])
    }

    /// Load every optional tier that is available and append the basic check.
    pub fn from_config(config: &ChainConfig) -> Self {
        let mut probes: Vec<Box<dyn FaceProbe>> = Vec::new();

        match (&config.scrfd_model, &config.arcface_model) {
            (Some(scrfd), Some(arcface)) => match EmbeddingDetector::load(scrfd, arcface) {
                Ok(detector) => probes.push(Box::new(detector)),
                Err(e) => tracing::warn!(error = %e, "embedding detector unavailable; tier skipped"),
            },
            _ => tracing::info!("embedding detector not configured"),
        }

        match &config.cascade {
            Some(path) => match CascadeDetector::load(path) {
                Ok(detector) => probes.push(Box::new(detector)),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "cascade detector unavailable; tier skipped"
                ),
            },
            None => tracing::info!("cascade detector not configured"),
        }

        probes.push(Box::new(BasicCheck));

        let chain = Self::new(probes);
        tracing::info!(tiers = ?chain.methods(), "face detector chain ready");
        chain
    }

    /// Method names of the active tiers, in evaluation order.
    pub fn methods(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.method()).collect()
    }

    /// Run the tiers against raw image bytes, stopping at the first pass.
    ///
    /// Bytes that do not decode as an image fail every tier.
    pub fn run(&mut self, bytes: &[u8]) -> FaceCheck {
        let image = match image::load_from_memory(bytes) {
            Ok(image) => image,
            Err(e) => {
                tracing::debug!(error = %e, len = bytes.len(), "image payload did not decode");
                return FaceCheck::failed(METHOD_BASIC);
            }
        };

        for probe in self.probes.iter_mut() {
            match probe.detect(&image) {
                Ok(check) if check.verified => return check,
                Ok(_) => tracing::debug!(method = probe.method(), "no face; trying next tier"),
                Err(e) => tracing::debug!(
                    method = probe.method(),
                    error = %e,
                    "tier failed; trying next tier"
                ),
            }
        }

        FaceCheck::failed(METHOD_BASIC)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::io::Cursor;

    /// Encode a small solid-colour PNG.
    pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([120, 90, 60]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    /// Probe with a fixed answer that counts how often it ran.
    pub struct FixedProbe {
        pub method: &'static str,
        pub answer: Option<FaceCheck>,
        pub calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl FaceProbe for FixedProbe {
        fn method(&self) -> &'static str {
            self.method
        }

        fn detect(&mut self, _image: &DynamicImage) -> Result<FaceCheck, DetectorError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.answer
                .clone()
                .ok_or_else(|| DetectorError::InferenceFailed("fixed failure".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_basic_only_chain_yields_half_confidence() {
        let mut chain = DetectorChain::basic_only();
        let check = chain.run(&png_bytes(8, 8));
        assert!(check.verified);
        assert_eq!(check.confidence, 0.5);
        assert_eq!(check.method, METHOD_BASIC);
        assert_eq!(check.evidence, Evidence::ImageValidity);
    }

    #[test]
    fn test_undecodable_bytes_fail() {
        let mut chain = DetectorChain::basic_only();
        let check = chain.run(b"definitely not an image");
        assert!(!check.verified);
        assert_eq!(check.confidence, 0.0);
    }

    #[test]
    fn test_unconfigured_chain_is_basic_only() {
        let chain = DetectorChain::from_config(&ChainConfig::default());
        assert_eq!(chain.methods(), vec![METHOD_BASIC]);
    }

    #[test]
    fn test_missing_files_are_skipped_at_build() {
        let chain = DetectorChain::from_config(&ChainConfig {
            scrfd_model: Some("/nonexistent/det_10g.onnx".into()),
            arcface_model: Some("/nonexistent/w600k_r50.onnx".into()),
            cascade: Some("/nonexistent/face.json".into()),
        });
        assert_eq!(chain.methods(), vec![METHOD_BASIC]);
    }

    #[test]
    fn test_first_passing_tier_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut chain = DetectorChain::new(vec![
            Box::new(FixedProbe {
                method: METHOD_EMBEDDING,
                answer: Some(FaceCheck::passed(METHOD_EMBEDDING, 0.8, Evidence::FacePresence)),
                calls: first.clone(),
            }),
            Box::new(FixedProbe {
                method: METHOD_CASCADE,
                answer: Some(FaceCheck::passed(METHOD_CASCADE, 0.7, Evidence::FacePresence)),
                calls: second.clone(),
            }),
        ]);

        let check = chain.run(&png_bytes(4, 4));
        assert_eq!(check.method, METHOD_EMBEDDING);
        assert_eq!(check.confidence, 0.8);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_errors_and_misses_advance() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = DetectorChain::new(vec![
            Box::new(FixedProbe {
                method: METHOD_EMBEDDING,
                answer: None,
                calls: calls.clone(),
            }),
            Box::new(FixedProbe {
                method: METHOD_CASCADE,
                answer: Some(FaceCheck::failed(METHOD_CASCADE)),
                calls: calls.clone(),
            }),
            Box::new(BasicCheck),
        ]);

        let check = chain.run(&png_bytes(4, 4));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(check.method, METHOD_BASIC);
        assert_eq!(check.confidence, 0.5);
    }
}
