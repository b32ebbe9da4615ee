//! Decoding of the submitted `image_data` field.

use base64::{engine::general_purpose, Engine as _};

use crate::error::AttendanceError;

/// Upload ceiling for a single image payload (decoded bytes).
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 15 * 1024 * 1024;

/// Decode a base64 image, either bare or as a `data:` URL.
pub fn decode_image_data(raw: &str, max_bytes: usize) -> Result<Vec<u8>, AttendanceError> {
    let raw = raw.trim();
    let encoded = if raw.starts_with("data:") {
        let (_, body) = raw.split_once(',').ok_or_else(|| {
            AttendanceError::ImageDecodeFailure("data URL has no payload".into())
        })?;
        body
    } else {
        raw
    };

    // Reject before decoding; base64 expands by 4/3.
    if encoded.len() / 4 * 3 > max_bytes + 3 {
        return Err(AttendanceError::ImageDecodeFailure(format!(
            "payload exceeds {max_bytes} bytes"
        )));
    }

    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| AttendanceError::ImageDecodeFailure(format!("invalid base64: {e}")))?;

    if bytes.is_empty() {
        return Err(AttendanceError::ImageDecodeFailure("empty payload".into()));
    }
    if bytes.len() > max_bytes {
        return Err(AttendanceError::ImageDecodeFailure(format!(
            "payload exceeds {max_bytes} bytes"
        )));
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_url() {
        let bytes = decode_image_data("data:image/jpeg;base64,AQID", 1024).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[test]
    fn test_bare_base64() {
        assert_eq!(decode_image_data("AQID", 1024).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_data_url_without_comma() {
        assert!(matches!(
            decode_image_data("data:image/png;base64", 1024),
            Err(AttendanceError::ImageDecodeFailure(_))
        ));
    }

    #[test]
    fn test_invalid_base64() {
        assert!(matches!(
            decode_image_data("data:image/png;base64,***", 1024),
            Err(AttendanceError::ImageDecodeFailure(_))
        ));
    }

    #[test]
    fn test_empty_payload() {
        assert!(decode_image_data("data:image/png;base64,", 1024).is_err());
    }

    #[test]
    fn test_oversized_payload() {
        let encoded = general_purpose::STANDARD.encode(vec![0u8; 64]);
        assert!(decode_image_data(&encoded, 16).is_err());
        assert!(decode_image_data(&encoded, 64).is_ok());
    }
}
