//! Submission images written to the upload directory.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use presensi_core::{ArtifactSink, UserId};

use crate::error::StoreError;

pub struct UploadDir {
    root: PathBuf,
}

impl UploadDir {
    /// Use `root`, creating it if it does not exist.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::CreateDir {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// `presensi_{user}_{YYYYmmdd_HHMMSS_micro}.{ext}`
pub fn artifact_name(user_id: UserId, at: NaiveDateTime, bytes: &[u8]) -> String {
    let ext = image::guess_format(bytes)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("jpg");
    format!(
        "presensi_{user_id}_{}.{ext}",
        at.format("%Y%m%d_%H%M%S_%6f")
    )
}

/// Create `path` exclusively and fill it with `write`. A partly written file
/// is removed when `write` fails.
fn write_new(path: &Path, write: impl FnOnce(&mut File) -> io::Result<()>) -> io::Result<()> {
    // create_new: never overwrite an artifact that already exists.
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = write(&mut file) {
        drop(file);
        if let Err(rm) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %rm, "could not remove partial artifact");
        }
        return Err(e);
    }
    Ok(())
}

impl ArtifactSink for UploadDir {
    fn store(&self, user_id: UserId, at: NaiveDateTime, bytes: &[u8]) -> io::Result<String> {
        let name = artifact_name(user_id, at, bytes);
        let path = self.root.join(&name);

        write_new(&path, |file| {
            file.write_all(bytes)?;
            file.sync_all()
        })?;

        tracing::debug!(path = %path.display(), len = bytes.len(), "image artifact stored");
        Ok(name)
    }

    fn discard(&self, reference: &str) -> io::Result<()> {
        if reference.contains(['/', '\\']) || reference.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not an artifact name: {reference}"),
            ));
        }
        match std::fs::remove_file(self.root.join(reference)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::Cursor;

    fn png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(3, 3, image::Rgb([10, 20, 30]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 4)
            .unwrap()
            .and_hms_micro_opt(7, 5, 9, 31)
            .unwrap()
    }

    #[test]
    fn test_name_uses_sniffed_extension() {
        assert_eq!(artifact_name(12, at(), &png()), "presensi_12_20250304_070509_000031.png");
        assert_eq!(artifact_name(12, at(), b"????"), "presensi_12_20250304_070509_000031.jpg");
    }

    #[test]
    fn test_store_writes_exclusively() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = UploadDir::create(dir.path().join("static/uploads")).unwrap();

        let name = uploads.store(12, at(), &png()).unwrap();
        assert_eq!(std::fs::read(uploads.root().join(&name)).unwrap(), png());

        let err = uploads.store(12, at(), &png()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(uploads.root().join(&name).exists());
    }

    #[test]
    fn test_failed_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presensi_1_20250304_070509_000031.png");

        let err = write_new(&path, |file| {
            file.write_all(b"\x89PNG")?;
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(!path.exists());
    }

    #[test]
    fn test_discard() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = UploadDir::create(dir.path()).unwrap();
        let name = uploads.store(3, at(), &png()).unwrap();

        uploads.discard(&name).unwrap();
        assert!(!uploads.root().join(&name).exists());
        // Already gone is fine.
        uploads.discard(&name).unwrap();
        assert!(uploads.discard("../etc/passwd").is_err());
    }
}
