//! Attendance ledger: one row per (user, date), enforced by the schema.

use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use presensi_core::{
    AttendanceError, AttendanceLedger, AttendanceRecord, GeoPoint, InsertOutcome, NewAttendance,
    Status, UserId,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;

use crate::error::StoreError;
use crate::schema;

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const COLUMNS: &str = "id, user_id, date, check_in_time, check_out_time, status, note, \
                       latitude, longitude, image_ref, confidence, method, verified, created_at";

/// Number of records per status for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusTally {
    pub present: u32,
    pub leave: u32,
    pub sick: u32,
}

impl StatusTally {
    pub fn total(&self) -> u32 {
        self.present + self.leave + self.sick
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: u32,
}

pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = schema::open(path)?;
        tracing::info!(path = %path.display(), "attendance ledger opened");
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: schema::open_in_memory()?,
        })
    }

    /// The user's records, newest date first.
    pub fn history(&self, user_id: UserId) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM attendance WHERE user_id = ?1 ORDER BY date DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn tally(&self, user_id: UserId) -> Result<StatusTally, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM attendance WHERE user_id = ?1 GROUP BY status")?;
        let mut rows = stmt.query(params![user_id])?;

        let mut tally = StatusTally::default();
        while let Some(row) = rows.next()? {
            let count: u32 = row.get(1)?;
            match status_at(row, 0)? {
                Status::Present => tally.present = count,
                Status::Leave => tally.leave = count,
                Status::Sick => tally.sick = count,
            }
        }
        Ok(tally)
    }

    /// Record counts for the `days` most recent dates that have any, oldest
    /// first.
    pub fn daily_counts(&self, days: u32) -> Result<Vec<DailyCount>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT date, COUNT(*) FROM attendance GROUP BY date ORDER BY date DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![days], |row| {
            Ok(DailyCount {
                date: date_at(row, 0)?,
                count: row.get(1)?,
            })
        })?;
        let mut counts = rows.collect::<Result<Vec<_>, _>>()?;
        counts.reverse();
        Ok(counts)
    }

    fn insert(&self, record: NewAttendance) -> Result<InsertOutcome, StoreError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        if let Some(existing) = find_in(&tx, record.user_id, record.date)? {
            return Ok(InsertOutcome::Existing(existing));
        }

        tx.execute(
            "INSERT INTO attendance (user_id, date, check_in_time, check_out_time, status, note,
                                     latitude, longitude, image_ref, confidence, method, verified,
                                     created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.user_id,
                record.date.format(DATE_FORMAT).to_string(),
                record.check_in_time,
                record.check_out_time,
                record.status.as_str(),
                record.note,
                record.location.map(|p| p.latitude),
                record.location.map(|p| p.longitude),
                record.image_ref,
                f64::from(record.confidence),
                record.method,
                record.verified,
                record.created_at.format(TIMESTAMP_FORMAT).to_string(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::debug!(id, user_id = record.user_id, date = %record.date, "attendance inserted");
        Ok(InsertOutcome::Inserted(record.with_id(id)))
    }
}

impl AttendanceLedger for SqliteLedger {
    fn find(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, AttendanceError> {
        Ok(find_in(&self.conn, user_id, date)?)
    }

    fn insert_if_absent(&self, record: NewAttendance) -> Result<InsertOutcome, AttendanceError> {
        Ok(self.insert(record)?)
    }
}

fn find_in(
    conn: &Connection,
    user_id: UserId,
    date: NaiveDate,
) -> Result<Option<AttendanceRecord>, StoreError> {
    let record = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM attendance WHERE user_id = ?1 AND date = ?2"),
            params![user_id, date.format(DATE_FORMAT).to_string()],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let latitude: Option<f64> = row.get(7)?;
    let longitude: Option<f64> = row.get(8)?;

    Ok(AttendanceRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        date: date_at(row, 2)?,
        check_in_time: row.get(3)?,
        check_out_time: row.get(4)?,
        status: status_at(row, 5)?,
        note: row.get(6)?,
        location: latitude.zip(longitude).map(|(lat, lon)| GeoPoint::new(lat, lon)),
        image_ref: row.get(9)?,
        confidence: row.get::<_, f64>(10)? as f32,
        method: row.get(11)?,
        verified: row.get(12)?,
        created_at: timestamp_at(row, 13)?,
    })
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn date_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(|e| conversion_error(idx, e))
}

fn status_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Status> {
    let raw: String = row.get(idx)?;
    raw.parse::<Status>().map_err(|e| conversion_error(idx, e))
}
