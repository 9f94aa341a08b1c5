//! Domain types for the synced key-value store: the property-list value
//! model, its canonical binary codec, log entries, identifiers, the
//! monotonic timestamp source, and the last-writer-wins conflict rule.
//!
//! No I/O lives here; the `syncstore-db` and `syncstore-sync` crates build
//! on top of these types.

pub mod codec;
pub mod conflict;
pub mod entry;
pub mod error;
pub mod ids;
pub mod plist;
pub mod projection;
pub mod timestamp;

pub use conflict::should_apply;
pub use entry::{Change, LogEntry};
pub use error::{Error, Result};
pub use ids::{DeviceId, Key, Timestamp, DISTANT_FUTURE, DISTANT_PAST};
pub use plist::PList;
pub use projection::KeySet;
pub use timestamp::TimestampSource;
