//! SQLite-backed persistence for the synced key-value store: the per-device
//! append-only `Log` table and the on-disk package layout.

pub mod file_package;
pub mod log_database;

pub use file_package::FilePackage;
pub use log_database::{LogDatabase, Order, Row};
