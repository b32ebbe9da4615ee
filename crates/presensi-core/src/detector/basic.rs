use image::DynamicImage;

use super::{DetectorError, Evidence, FaceCheck, FaceProbe, METHOD_BASIC};

pub const BASIC_CONFIDENCE: f32 = 0.5;

/// Last tier: the payload decoded as an image with non-zero size.
pub struct BasicCheck;

impl FaceProbe for BasicCheck {
    fn method(&self) -> &'static str {
        METHOD_BASIC
    }

    fn detect(&mut self, image: &DynamicImage) -> Result<FaceCheck, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(FaceCheck::failed(METHOD_BASIC));
        }
        Ok(FaceCheck::passed(
            METHOD_BASIC,
            BASIC_CONFIDENCE,
            Evidence::ImageValidity,
        ))
    }
}
