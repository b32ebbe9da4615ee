use chrono::NaiveDateTime;
use presensi_core::{
    AdmissionPipeline, AdmissionRequest, AttendanceError, AttendanceRecord, ClientTrust, Decision,
    DescriptorMatch, DetectorChain, FaceEnrollment, FaceVerifier, Geofence, TrainingStatus, UserId,
};
use presensi_store::{
    DailyCount, SqliteEnrollmentStore, SqliteLedger, StatusTally, StoreError, UploadDir,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Attendance(#[from] AttendanceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Admit {
        user_id: UserId,
        request: Box<AdmissionRequest>,
        reply: Reply<Decision>,
    },
    Train {
        user_id: UserId,
        descriptors: Vec<Vec<f32>>,
        reply: Reply<TrainingStatus>,
    },
    Verify {
        user_id: UserId,
        descriptor: Vec<f32>,
        reply: Reply<DescriptorMatch>,
    },
    TrainingStatus {
        user_id: UserId,
        reply: Reply<TrainingStatus>,
    },
    Reset {
        user_id: UserId,
        reply: Reply<()>,
    },
    History {
        user_id: UserId,
        reply: Reply<Vec<AttendanceRecord>>,
    },
    Tally {
        user_id: UserId,
        reply: Reply<StatusTally>,
    },
    DailyCounts {
        days: u32,
        reply: Reply<Vec<DailyCount>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    tiers: Vec<&'static str>,
    trust: ClientTrust,
}

impl EngineHandle {
    /// Server-side detector tiers that loaded, strongest first.
    pub fn tiers(&self) -> &[&'static str] {
        &self.tiers
    }

    pub fn client_trust(&self) -> ClientTrust {
        self.trust
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Run one submission through the admission pipeline.
    pub async fn admit(
        &self,
        user_id: UserId,
        request: AdmissionRequest,
    ) -> Result<Decision, EngineError> {
        self.call(|reply| EngineRequest::Admit {
            user_id,
            request: Box::new(request),
            reply,
        })
        .await
    }

    pub async fn train(
        &self,
        user_id: UserId,
        descriptors: Vec<Vec<f32>>,
    ) -> Result<TrainingStatus, EngineError> {
        self.call(|reply| EngineRequest::Train {
            user_id,
            descriptors,
            reply,
        })
        .await
    }

    pub async fn verify(
        &self,
        user_id: UserId,
        descriptor: Vec<f32>,
    ) -> Result<DescriptorMatch, EngineError> {
        self.call(|reply| EngineRequest::Verify {
            user_id,
            descriptor,
            reply,
        })
        .await
    }

    pub async fn training_status(&self, user_id: UserId) -> Result<TrainingStatus, EngineError> {
        self.call(|reply| EngineRequest::TrainingStatus { user_id, reply })
            .await
    }

    pub async fn reset(&self, user_id: UserId) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Reset { user_id, reply })
            .await
    }

    pub async fn history(&self, user_id: UserId) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.call(|reply| EngineRequest::History { user_id, reply })
            .await
    }

    pub async fn tally(&self, user_id: UserId) -> Result<StatusTally, EngineError> {
        self.call(|reply| EngineRequest::Tally { user_id, reply })
            .await
    }

    pub async fn daily_counts(&self, days: u32) -> Result<Vec<DailyCount>, EngineError> {
        self.call(|reply| EngineRequest::DailyCounts { days, reply })
            .await
    }
}

/// Everything the engine thread owns.
struct Engine {
    pipeline: AdmissionPipeline<SqliteLedger, UploadDir>,
    enrollment: FaceEnrollment<SqliteEnrollmentStore>,
    clock: fn() -> NaiveDateTime,
}

impl Engine {
    fn handle(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Admit {
                user_id,
                request,
                reply,
            } => {
                let now = (self.clock)();
                let result = self.pipeline.admit(user_id, &request, now);
                let _ = reply.send(Decision::from_result(result).map_err(EngineError::from));
            }
            EngineRequest::Train {
                user_id,
                descriptors,
                reply,
            } => {
                let now = (self.clock)();
                let result = self.enrollment.train(user_id, descriptors, now);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::Verify {
                user_id,
                descriptor,
                reply,
            } => {
                let result = self.enrollment.verify(user_id, descriptor);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::TrainingStatus { user_id, reply } => {
                let _ = reply.send(self.enrollment.check(user_id).map_err(EngineError::from));
            }
            EngineRequest::Reset { user_id, reply } => {
                let _ = reply.send(self.enrollment.reset(user_id).map_err(EngineError::from));
            }
            EngineRequest::History { user_id, reply } => {
                let _ = reply.send(self.pipeline.ledger().history(user_id).map_err(EngineError::from));
            }
            EngineRequest::Tally { user_id, reply } => {
                let _ = reply.send(self.pipeline.ledger().tally(user_id).map_err(EngineError::from));
            }
            EngineRequest::DailyCounts { days, reply } => {
                let _ = reply.send(self.pipeline.ledger().daily_counts(days).map_err(EngineError::from));
            }
        }
    }
}

fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the database and upload directory and builds the detector chain
/// before returning. Storage problems fail startup; missing detector models
/// only remove their tier.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    spawn_with_clock(config, local_now)
}

fn spawn_with_clock(
    config: &Config,
    clock: fn() -> NaiveDateTime,
) -> Result<EngineHandle, EngineError> {
    let ledger = SqliteLedger::open(&config.db_path)?;
    let enrollments = SqliteEnrollmentStore::open(&config.db_path)?;
    let uploads = UploadDir::create(&config.upload_dir)?;
    tracing::info!(dir = %config.upload_dir.display(), "upload directory ready");

    let chain = DetectorChain::from_config(&config.chain_config());
    let verifier = FaceVerifier::new(chain, config.client_trust);
    let tiers = verifier.tiers();

    let geofence = Geofence::new(config.site, config.radius_m);
    tracing::info!(
        latitude = config.site.latitude,
        longitude = config.site.longitude,
        radius_m = config.radius_m,
        client_trust = ?config.client_trust,
        "geofence configured"
    );

    let mut engine = Engine {
        pipeline: AdmissionPipeline::new(
            ledger,
            uploads,
            geofence,
            verifier,
            config.max_image_bytes,
        ),
        enrollment: FaceEnrollment::new(enrollments, config.descriptor_dim, config.match_threshold),
        clock,
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("presensi-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        tiers,
        trust: config.client_trust,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusKind, Config};
    use chrono::NaiveDate;
    use presensi_core::detector::METHOD_CLIENT;
    use presensi_core::{GeoPoint, Status};

    fn fixed_clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 4)
            .unwrap()
            .and_hms_opt(7, 30, 0)
            .unwrap()
    }

    fn config(dir: &std::path::Path) -> Config {
        Config {
            db_path: dir.join("db/presensi.db"),
            upload_dir: dir.join("uploads"),
            site: GeoPoint::new(-6.2, 106.8),
            radius_m: 100.0,
            match_threshold: 0.6,
            descriptor_dim: 4,
            model_dir: dir.join("models"),
            cascade_path: dir.join("models/face_cascade.json"),
            client_trust: ClientTrust::Sufficient,
            max_image_bytes: 1024 * 1024,
            bus: BusKind::Session,
        }
    }

    fn form(status: &str) -> AdmissionRequest {
        AdmissionRequest {
            check_in_time: Some("07:30".into()),
            status: Some(status.into()),
            face_detected: Some("true".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_missing_models_leave_basic_tier() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_with_clock(&config(dir.path()), fixed_clock).unwrap();
        assert_eq!(engine.tiers(), &["basic-check"]);
        assert_eq!(engine.client_trust(), ClientTrust::Sufficient);
    }

    #[tokio::test]
    async fn test_admit_then_duplicate_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_with_clock(&config(dir.path()), fixed_clock).unwrap();

        let first = engine.admit(9, form("Izin")).await.unwrap();
        match &first {
            Decision::Accepted { method, record, .. } => {
                assert_eq!(method, METHOD_CLIENT);
                assert_eq!(record.status, Status::Leave);
            }
            other => panic!("unexpected {other:?}"),
        }

        let second = engine.admit(9, form("Hadir")).await.unwrap();
        assert!(!second.accepted());

        let history = engine.history(9).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(engine.tally(9).await.unwrap().leave, 1);

        let daily = engine.daily_counts(7).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].count, 1);
    }

    #[tokio::test]
    async fn test_rejection_is_a_decision_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_with_clock(&config(dir.path()), fixed_clock).unwrap();

        let mut req = form("Hadir");
        req.latitude = Some("-6.2018".into());
        req.longitude = Some("106.8".into());
        match engine.admit(9, req).await.unwrap() {
            Decision::Rejected { kind, .. } => assert_eq!(kind, "geofence-violation"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(engine.history(9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enrollment_round() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_with_clock(&config(dir.path()), fixed_clock).unwrap();

        assert!(matches!(
            engine.verify(4, vec![0.0; 4]).await,
            Err(EngineError::Attendance(AttendanceError::NotEnrolled))
        ));

        let status = engine
            .train(4, vec![vec![0.1, 0.2, 0.3, 0.4]])
            .await
            .unwrap();
        assert_eq!(status.trained_at, Some(fixed_clock()));
        assert!(engine.training_status(4).await.unwrap().trained);

        let m = engine.verify(4, vec![0.1, 0.2, 0.3, 0.4]).await.unwrap();
        assert!(m.verified);

        engine.reset(4).await.unwrap();
        assert!(!engine.training_status(4).await.unwrap().trained);
    }
}
