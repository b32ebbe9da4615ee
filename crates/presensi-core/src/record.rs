use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::AttendanceError;
use crate::geofence::GeoPoint;

/// Identifier assigned by the identity subsystem.
pub type UserId = i64;

/// Attendance status for the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Present,
    Leave,
    Sick,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Present => "Present",
            Status::Leave => "Leave",
            Status::Sick => "Sick",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = AttendanceError;

    /// Accepts English names and the Indonesian form labels
    /// (`Hadir`, `Izin`, `Sakit`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" | "hadir" => Ok(Status::Present),
            "leave" | "izin" => Ok(Status::Leave),
            "sick" | "sakit" => Ok(Status::Sick),
            _ => Err(AttendanceError::MissingField { field: "status" }),
        }
    }
}

/// A record about to be committed. The ledger assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttendance {
    pub user_id: UserId,
    pub date: NaiveDate,
    pub check_in_time: String,
    pub check_out_time: Option<String>,
    pub status: Status,
    pub note: Option<String>,
    pub location: Option<GeoPoint>,
    pub image_ref: Option<String>,
    pub confidence: f32,
    pub method: String,
    pub verified: bool,
    pub created_at: NaiveDateTime,
}

impl NewAttendance {
    pub fn with_id(self, id: i64) -> AttendanceRecord {
        AttendanceRecord {
            id,
            user_id: self.user_id,
            date: self.date,
            check_in_time: self.check_in_time,
            check_out_time: self.check_out_time,
            status: self.status,
            note: self.note,
            location: self.location,
            image_ref: self.image_ref,
            confidence: self.confidence,
            method: self.method,
            verified: self.verified,
            created_at: self.created_at,
        }
    }
}

/// One committed day of attendance. At most one exists per (user, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub check_in_time: String,
    pub check_out_time: Option<String>,
    pub status: Status,
    pub note: Option<String>,
    pub location: Option<GeoPoint>,
    /// Name of the stored image artifact, if one was written.
    pub image_ref: Option<String>,
    pub confidence: f32,
    pub method: String,
    pub verified: bool,
    pub created_at: NaiveDateTime,
}

impl AttendanceRecord {
    pub fn summary(&self) -> AttendanceSummary {
        AttendanceSummary {
            date: self.date,
            check_in_time: self.check_in_time.clone(),
            status: self.status,
            method: self.method.clone(),
            verified: self.verified,
        }
    }
}

/// What a rejected duplicate submission is shown about the existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSummary {
    pub date: NaiveDate,
    pub check_in_time: String,
    pub status: Status,
    pub method: String,
    pub verified: bool,
}

/// Raw admission form as submitted by the client.
///
/// Every field is optional at this layer; the pipeline decides what is
/// required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub check_in_time: Option<String>,
    pub check_out_time: Option<String>,
    pub status: Option<String>,
    pub note: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    /// Base64 image, usually as a `data:image/...;base64,` URL.
    pub image_data: Option<String>,
    /// Client-side detection verdict, `"true"` or `"false"`.
    pub face_detected: Option<String>,
    /// Client-side score; informational.
    pub face_confidence: Option<String>,
}

impl AdmissionRequest {
    pub fn client_face_detected(&self) -> bool {
        self.face_detected
            .as_deref()
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    }

    pub fn client_confidence(&self) -> Option<f32> {
        self.face_confidence
            .as_deref()
            .and_then(|v| v.trim().parse::<f32>().ok())
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 1.0))
    }
}

/// Trimmed, non-empty text or `None`.
pub(crate) fn present(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
