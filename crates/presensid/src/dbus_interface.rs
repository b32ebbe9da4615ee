use presensi_core::enrollment::{TrainRequest, VerifyRequest};
use presensi_core::{AdmissionRequest, AttendanceError, GeoPoint};
use serde::Serialize;
use zbus::interface;

use crate::engine::{EngineError, EngineHandle};

pub const BUS_NAME: &str = "org.presensi.Attendance1";
pub const OBJECT_PATH: &str = "/org/presensi/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.presensi.Attendance1
/// Object path: /org/presensi/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    site: GeoPoint,
    radius_m: f64,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, site: GeoPoint, radius_m: f64) -> Self {
        Self {
            engine,
            site,
            radius_m,
        }
    }
}

fn parse<'a, T: serde::Deserialize<'a>>(what: &str, json: &'a str) -> zbus::fdo::Result<T> {
    serde_json::from_str(json)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("malformed {what}: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn fdo_error(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Attendance(AttendanceError::InvalidDescriptor(msg)) => {
            zbus::fdo::Error::InvalidArgs(format!("invalid face descriptor: {msg}"))
        }
        other => {
            tracing::error!(error = %other, "request failed");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}

#[interface(name = "org.presensi.Attendance1")]
impl AttendanceService {
    /// Submit today's attendance. Returns the decision as JSON; rejections
    /// are decisions, not errors.
    async fn admit(&self, user_id: i64, request_json: &str) -> zbus::fdo::Result<String> {
        tracing::info!(user_id, "admit requested");
        let request: AdmissionRequest = parse("admission request", request_json)?;
        let decision = self.engine.admit(user_id, request).await.map_err(fdo_error)?;
        to_json(&decision)
    }

    /// Replace the user's enrolled face descriptors.
    async fn train(&self, user_id: i64, request_json: &str) -> zbus::fdo::Result<String> {
        tracing::info!(user_id, "train requested");
        let request: TrainRequest = parse("training request", request_json)?;
        let status = self
            .engine
            .train(user_id, request.descriptors)
            .await
            .map_err(fdo_error)?;
        to_json(&status)
    }

    /// Match a live descriptor against the enrolled set.
    async fn verify(&self, user_id: i64, request_json: &str) -> zbus::fdo::Result<String> {
        tracing::info!(user_id, "verify requested");
        let request: VerifyRequest = parse("verify request", request_json)?;
        match self.engine.verify(user_id, request.descriptor).await {
            Ok(m) => to_json(&m),
            Err(EngineError::Attendance(AttendanceError::NotEnrolled)) => {
                Ok(serde_json::json!({ "enrolled": false }).to_string())
            }
            Err(e) => Err(fdo_error(e)),
        }
    }

    async fn training_status(&self, user_id: i64) -> zbus::fdo::Result<String> {
        let status = self
            .engine
            .training_status(user_id)
            .await
            .map_err(fdo_error)?;
        to_json(&status)
    }

    /// Clear the user's enrollment. Succeeds when there is nothing to clear.
    async fn reset(&self, user_id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(user_id, "reset requested");
        self.engine.reset(user_id).await.map_err(fdo_error)?;
        Ok(true)
    }

    async fn history(&self, user_id: i64) -> zbus::fdo::Result<String> {
        let records = self.engine.history(user_id).await.map_err(fdo_error)?;
        to_json(&records)
    }

    async fn tally(&self, user_id: i64) -> zbus::fdo::Result<String> {
        let tally = self.engine.tally(user_id).await.map_err(fdo_error)?;
        to_json(&tally)
    }

    async fn daily_counts(&self, days: u32) -> zbus::fdo::Result<String> {
        let counts = self.engine.daily_counts(days).await.map_err(fdo_error)?;
        to_json(&counts)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "tiers": self.engine.tiers(),
            "client_trust": self.engine.client_trust(),
            "site": self.site,
            "radius_m": self.radius_m,
        })
        .to_string())
    }
}
