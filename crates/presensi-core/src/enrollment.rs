//! Per-user face enrollment: train, check, reset, and descriptor verification.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::AttendanceError;
use crate::record::UserId;
use crate::types::{DescriptorMatch, EuclideanMatcher, FaceDescriptor, Matcher};

/// Stored enrollment for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub descriptors: Vec<FaceDescriptor>,
    pub trained_at: NaiveDateTime,
}

/// Backing store for enrolled descriptor sets.
pub trait EnrollmentStore {
    /// Replace the user's descriptor set.
    fn replace(
        &self,
        user_id: UserId,
        descriptors: &[FaceDescriptor],
        trained_at: NaiveDateTime,
    ) -> Result<(), AttendanceError>;

    fn load(&self, user_id: UserId) -> Result<Option<Enrollment>, AttendanceError>;

    /// Remove the user's enrollment. Succeeds when there is none.
    fn clear(&self, user_id: UserId) -> Result<(), AttendanceError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainRequest {
    pub descriptors: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRequest {
    pub descriptor: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatus {
    pub trained: bool,
    pub trained_at: Option<NaiveDateTime>,
}

/// Enrollment operations scoped to a single user id per call.
pub struct FaceEnrollment<S> {
    store: S,
    descriptor_dim: usize,
    threshold: f32,
}

impl<S: EnrollmentStore> FaceEnrollment<S> {
    pub fn new(store: S, descriptor_dim: usize, threshold: f32) -> Self {
        Self {
            store,
            descriptor_dim,
            threshold,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Replace the user's reference set with `descriptors`.
    pub fn train(
        &self,
        user_id: UserId,
        descriptors: Vec<Vec<f32>>,
        now: NaiveDateTime,
    ) -> Result<TrainingStatus, AttendanceError> {
        if descriptors.is_empty() {
            return Err(AttendanceError::InvalidDescriptor(
                "descriptor list is empty".into(),
            ));
        }

        let descriptors: Vec<FaceDescriptor> =
            descriptors.into_iter().map(FaceDescriptor::new).collect();
        for descriptor in &descriptors {
            descriptor.validate(self.descriptor_dim)?;
        }

        self.store.replace(user_id, &descriptors, now)?;
        tracing::info!(user_id, count = descriptors.len(), "face enrollment trained");

        Ok(TrainingStatus {
            trained: true,
            trained_at: Some(now),
        })
    }

    pub fn check(&self, user_id: UserId) -> Result<TrainingStatus, AttendanceError> {
        let status = match self.store.load(user_id)? {
            Some(e) if !e.descriptors.is_empty() => TrainingStatus {
                trained: true,
                trained_at: Some(e.trained_at),
            },
            _ => TrainingStatus {
                trained: false,
                trained_at: None,
            },
        };
        Ok(status)
    }

    pub fn reset(&self, user_id: UserId) -> Result<(), AttendanceError> {
        self.store.clear(user_id)?;
        tracing::info!(user_id, "face enrollment reset");
        Ok(())
    }

    /// Match a live descriptor against the user's enrolled set.
    pub fn verify(
        &self,
        user_id: UserId,
        descriptor: Vec<f32>,
    ) -> Result<DescriptorMatch, AttendanceError> {
        let probe = FaceDescriptor::new(descriptor);
        probe.validate(self.descriptor_dim)?;

        let gallery = self
            .store
            .load(user_id)?
            .map(|e| e.descriptors)
            .unwrap_or_default();
        if let Some(stale) = gallery.iter().find(|d| d.dim() != self.descriptor_dim) {
            tracing::warn!(
                user_id,
                stored = stale.dim(),
                expected = self.descriptor_dim,
                "enrolled descriptors have the wrong length"
            );
            return Err(AttendanceError::InvalidDescriptor(format!(
                "enrolled descriptors have {} values, expected {}; retrain",
                stale.dim(),
                self.descriptor_dim
            )));
        }

        let result = EuclideanMatcher
            .compare(&probe, &gallery, self.threshold)
            .ok_or(AttendanceError::NotEnrolled)?;

        tracing::info!(
            user_id,
            verified = result.verified,
            distance = result.distance,
            gallery = gallery.len(),
            "descriptor verification"
        );
        Ok(result)
    }
}
