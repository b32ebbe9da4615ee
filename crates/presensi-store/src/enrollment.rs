use std::path::Path;

use chrono::NaiveDateTime;
use presensi_core::{AttendanceError, Enrollment, EnrollmentStore, FaceDescriptor, UserId};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::ledger::{timestamp_at, TIMESTAMP_FORMAT};
use crate::schema;

/// Face descriptor sets, one JSON column per user.
pub struct SqliteEnrollmentStore {
    conn: Connection,
}

impl SqliteEnrollmentStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            conn: schema::open(path)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: schema::open_in_memory()?,
        })
    }

    fn write(
        &self,
        user_id: UserId,
        descriptors: &[FaceDescriptor],
        trained_at: NaiveDateTime,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(descriptors).map_err(|e| StoreError::Corrupt {
            user_id,
            column: "descriptors",
            message: e.to_string(),
        })?;
        self.conn.execute(
            "INSERT INTO face_enrollments (user_id, descriptors, trained_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (user_id) DO UPDATE SET
                 descriptors = excluded.descriptors,
                 trained_at = excluded.trained_at",
            params![user_id, json, trained_at.format(TIMESTAMP_FORMAT).to_string()],
        )?;
        Ok(())
    }

    fn read(&self, user_id: UserId) -> Result<Option<Enrollment>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT descriptors, trained_at FROM face_enrollments WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get::<_, String>(0)?, timestamp_at(row, 1)?)),
            )
            .optional()?;

        let Some((json, trained_at)) = row else {
            return Ok(None);
        };
        let descriptors: Vec<FaceDescriptor> =
            serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                user_id,
                column: "descriptors",
                message: e.to_string(),
            })?;

        Ok(Some(Enrollment {
            descriptors,
            trained_at,
        }))
    }
}

impl EnrollmentStore for SqliteEnrollmentStore {
    fn replace(
        &self,
        user_id: UserId,
        descriptors: &[FaceDescriptor],
        trained_at: NaiveDateTime,
    ) -> Result<(), AttendanceError> {
        Ok(self.write(user_id, descriptors, trained_at)?)
    }

    fn load(&self, user_id: UserId) -> Result<Option<Enrollment>, AttendanceError> {
        Ok(self.read(user_id)?)
    }

    fn clear(&self, user_id: UserId) -> Result<(), AttendanceError> {
        self.conn
            .execute(
                "DELETE FROM face_enrollments WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }
}
