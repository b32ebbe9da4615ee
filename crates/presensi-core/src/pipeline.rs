//! The ordered admission decision for one attendance submission.

use std::io;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::detector::{Evidence, FaceCheck};
use crate::error::AttendanceError;
use crate::geofence::{Geofence, GeofenceOutcome};
use crate::payload::decode_image_data;
use crate::record::{
    present, AdmissionRequest, AttendanceRecord, AttendanceSummary, NewAttendance, Status, UserId,
};
use crate::verifier::FaceVerifier;

/// Result of a conditional insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(AttendanceRecord),
    /// Another record for the same (user, date) was already committed.
    Existing(AttendanceRecord),
}

/// Durable store enforcing one record per (user, date).
pub trait AttendanceLedger {
    fn find(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, AttendanceError>;

    /// Insert `record` unless one already exists for its (user, date).
    /// Must be atomic with respect to concurrent callers.
    fn insert_if_absent(&self, record: NewAttendance) -> Result<InsertOutcome, AttendanceError>;
}

/// Where accepted submission images are written.
pub trait ArtifactSink {
    /// Persist `bytes` and return the stored artifact's name.
    fn store(&self, user_id: UserId, at: NaiveDateTime, bytes: &[u8]) -> io::Result<String>;

    fn discard(&self, reference: &str) -> io::Result<()>;
}

/// An accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub record: AttendanceRecord,
    pub check: FaceCheck,
}

/// Wire form of an admission outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Decision {
    Accepted {
        method: String,
        confidence: f32,
        evidence: Evidence,
        record: AttendanceRecord,
    },
    Rejected {
        kind: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        existing: Option<AttendanceSummary>,
    },
}

impl Decision {
    /// Turn an admission result into a decision. Fatal errors are passed
    /// through for the caller to surface.
    pub fn from_result(result: Result<Admission, AttendanceError>) -> Result<Self, AttendanceError> {
        match result {
            Ok(admission) => Ok(Decision::Accepted {
                method: admission.check.method.to_string(),
                confidence: admission.check.confidence,
                evidence: admission.check.evidence,
                record: admission.record,
            }),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let existing = match &e {
                    AttendanceError::DuplicateAttendance { existing } => existing.clone(),
                    _ => None,
                };
                Ok(Decision::Rejected {
                    kind: e.kind().to_string(),
                    reason: e.to_string(),
                    existing,
                })
            }
        }
    }

    pub fn accepted(&self) -> bool {
        matches!(self, Decision::Accepted { .. })
    }
}

pub struct AdmissionPipeline<L, A> {
    ledger: L,
    artifacts: A,
    geofence: Geofence,
    verifier: FaceVerifier,
    max_image_bytes: usize,
}

impl<L: AttendanceLedger, A: ArtifactSink> AdmissionPipeline<L, A> {
    pub fn new(
        ledger: L,
        artifacts: A,
        geofence: Geofence,
        verifier: FaceVerifier,
        max_image_bytes: usize,
    ) -> Self {
        Self {
            ledger,
            artifacts,
            geofence,
            verifier,
            max_image_bytes,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Decide one submission at time `now`.
    ///
    /// Steps run in a fixed order and the first failure is returned. Nothing
    /// is committed on any error path.
    pub fn admit(
        &mut self,
        user_id: UserId,
        request: &AdmissionRequest,
        now: NaiveDateTime,
    ) -> Result<Admission, AttendanceError> {
        let date = now.date();

        if let Some(existing) = self.ledger.find(user_id, date)? {
            tracing::info!(user_id, %date, "duplicate submission rejected");
            return Err(AttendanceError::DuplicateAttendance {
                existing: Some(existing.summary()),
            });
        }

        let check_in_time = present(request.check_in_time.as_deref())
            .ok_or(AttendanceError::MissingField {
                field: "check_in_time",
            })?;
        let status: Status = present(request.status.as_deref())
            .ok_or(AttendanceError::MissingField { field: "status" })?
            .parse()?;

        let fence = self
            .geofence
            .check(request.latitude.as_deref(), request.longitude.as_deref());
        if let GeofenceOutcome::Outside { distance_m } = fence {
            tracing::info!(user_id, distance_m, "outside geofence");
            return Err(AttendanceError::GeofenceViolation {
                distance: distance_m,
            });
        }

        let image = match present(request.image_data.as_deref()) {
            Some(raw) => match decode_image_data(&raw, self.max_image_bytes) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "image payload unusable; continuing without it");
                    None
                }
            },
            None => None,
        };

        let check = self.verifier.verify_submission(
            request.client_face_detected(),
            request.client_confidence(),
            image.as_deref(),
        );
        if !check.verified {
            tracing::info!(user_id, method = check.method, "face not detected");
            return Err(AttendanceError::FaceNotDetected);
        }

        let image_ref = image.as_deref().and_then(|bytes| {
            match self.artifacts.store(user_id, now, bytes) {
                Ok(name) => Some(name),
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "could not store image; continuing without it");
                    None
                }
            }
        });

        let record = NewAttendance {
            user_id,
            date,
            check_in_time,
            check_out_time: present(request.check_out_time.as_deref()),
            status,
            note: present(request.note.as_deref()),
            location: fence.point(),
            image_ref: image_ref.clone(),
            confidence: check.confidence,
            method: check.method.to_string(),
            verified: check.verified,
            created_at: now,
        };

        let committed = match self.ledger.insert_if_absent(record) {
            Ok(InsertOutcome::Inserted(record)) => Ok(record),
            Ok(InsertOutcome::Existing(existing)) => Err(AttendanceError::DuplicateAttendance {
                existing: Some(existing.summary()),
            }),
            Err(AttendanceError::StorageConflict) => {
                Err(AttendanceError::DuplicateAttendance { existing: None })
            }
            Err(e) => Err(e),
        };

        let record = match committed {
            Ok(record) => record,
            Err(e) => {
                if let Some(name) = &image_ref {
                    if let Err(io_err) = self.artifacts.discard(name) {
                        tracing::warn!(user_id, artifact = %name, error = %io_err, "could not discard image");
                    }
                }
                tracing::info!(user_id, kind = e.kind(), "commit rejected");
                return Err(e);
            }
        };

        tracing::info!(
            user_id,
            record_id = record.id,
            method = check.method,
            confidence = check.confidence,
            "admission accepted"
        );
        Ok(Admission { record, check })
    }
}
