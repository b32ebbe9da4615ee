use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::StoreError;

/// How long a writer waits for a competing connection's lock.
pub(crate) const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id        INTEGER NOT NULL,
    date           TEXT    NOT NULL,
    check_in_time  TEXT    NOT NULL,
    check_out_time TEXT,
    status         TEXT    NOT NULL CHECK (status IN ('Present', 'Leave', 'Sick')),
    note           TEXT,
    latitude       REAL,
    longitude      REAL,
    image_ref      TEXT,
    confidence     REAL    NOT NULL,
    method         TEXT    NOT NULL,
    verified       INTEGER NOT NULL,
    created_at     TEXT    NOT NULL,
    UNIQUE (user_id, date)
);
CREATE INDEX IF NOT EXISTS attendance_date ON attendance (date);

CREATE TABLE IF NOT EXISTS face_enrollments (
    user_id     INTEGER PRIMARY KEY,
    descriptors TEXT NOT NULL,
    trained_at  TEXT NOT NULL
);
";

/// Open (creating if needed) the database at `path` with the schema applied.
pub(crate) fn open(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

#[cfg(test)]
pub(crate) fn open_in_memory() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}
