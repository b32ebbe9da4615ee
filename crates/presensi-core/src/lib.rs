//! presensi-core: Attendance admission engine.
//!
//! Combines a geofence check, tiered face verification and a duplicate
//! attendance guard into a single admission decision. Storage is reached
//! through the [`AttendanceLedger`], [`EnrollmentStore`] and [`ArtifactSink`]
//! traits so the pipeline stays independent of the database.

pub mod detector;
pub mod enrollment;
pub mod error;
pub mod geofence;
pub mod payload;
pub mod pipeline;
pub mod record;
pub mod types;
pub mod verifier;

pub use detector::{DetectorChain, Evidence, FaceCheck, FaceProbe};
pub use enrollment::{Enrollment, EnrollmentStore, FaceEnrollment, TrainingStatus};
pub use error::AttendanceError;
pub use geofence::{GeoPoint, Geofence, GeofenceOutcome};
pub use pipeline::{
    Admission, AdmissionPipeline, ArtifactSink, AttendanceLedger, Decision, InsertOutcome,
};
pub use record::{AdmissionRequest, AttendanceRecord, AttendanceSummary, NewAttendance, Status, UserId};
pub use types::{DescriptorMatch, EuclideanMatcher, FaceDescriptor, Matcher};
pub use verifier::{ClientTrust, FaceVerifier};
