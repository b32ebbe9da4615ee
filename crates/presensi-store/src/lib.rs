//! presensi-store: SQLite persistence and image artifacts for presensi.
//!
//! [`SqliteLedger`] and [`SqliteEnrollmentStore`] each own one connection to
//! the same database file; several connections (or processes) may share it.

pub mod artifact;
pub mod enrollment;
pub mod error;
pub mod ledger;
mod schema;

pub use artifact::UploadDir;
pub use enrollment::SqliteEnrollmentStore;
pub use error::StoreError;
pub use ledger::{DailyCount, SqliteLedger, StatusTally};
