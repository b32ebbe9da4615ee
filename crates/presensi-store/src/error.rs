use presensi_core::AttendanceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row {column} for user {user_id}: {message}")]
    Corrupt {
        user_id: i64,
        column: &'static str,
        message: String,
    },
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
}

impl StoreError {
    /// A `UNIQUE` constraint rejected the write.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        )
    }
}

impl From<StoreError> for AttendanceError {
    fn from(e: StoreError) -> Self {
        if e.is_unique_violation() {
            AttendanceError::StorageConflict
        } else {
            AttendanceError::StorageUnavailable(e.to_string())
        }
    }
}
