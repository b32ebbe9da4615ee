use thiserror::Error;

use crate::record::AttendanceSummary;

/// Every way an attendance operation can end without success.
///
/// All variants except [`AttendanceError::StorageUnavailable`] are expected
/// outcomes: they are reported to the submitter as-is and never leave a
/// partial record behind.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttendanceError {
    #[error("incomplete data: {field} is required")]
    MissingField { field: &'static str },
    #[error("{}", geofence_reason(.distance))]
    GeofenceViolation { distance: f64 },
    #[error("face not detected")]
    FaceNotDetected,
    #[error("no enrolled face descriptors; enroll first")]
    NotEnrolled,
    #[error("attendance already submitted today")]
    DuplicateAttendance { existing: Option<AttendanceSummary> },
    #[error("image decode failed: {0}")]
    ImageDecodeFailure(String),
    #[error("invalid face descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("storage conflict on (user, date)")]
    StorageConflict,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

fn geofence_reason(distance: &f64) -> String {
    if distance.is_finite() {
        format!("too far from authorized location: {distance:.0}m")
    } else {
        "location could not be read; outside authorized area".to_string()
    }
}

impl AttendanceError {
    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            AttendanceError::MissingField { .. } => "missing-field",
            AttendanceError::GeofenceViolation { .. } => "geofence-violation",
            AttendanceError::FaceNotDetected => "face-not-detected",
            AttendanceError::NotEnrolled => "not-enrolled",
            AttendanceError::DuplicateAttendance { .. } => "duplicate-attendance",
            AttendanceError::ImageDecodeFailure(_) => "image-decode-failure",
            AttendanceError::InvalidDescriptor(_) => "invalid-descriptor",
            AttendanceError::StorageConflict => "storage-conflict",
            AttendanceError::StorageUnavailable(_) => "storage-unavailable",
        }
    }

    /// Only an unreachable store aborts a submission; the caller must retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AttendanceError::StorageUnavailable(_))
    }
}
