//! Cross-device last-writer-wins conflict resolution (spec §4.7.4).
//!
//! Adapted from the teacher's `should_apply_lww` (timestamp, then event-id
//! tiebreak): this engine's timestamps are already totally ordered integers,
//! so the tiebreak only matters on an exact tie, resolved by device id.

use crate::ids::{DeviceId, Timestamp};

/// Returns `true` if an incoming `(timestamp, device)` pair should overwrite
/// whatever is currently recorded at `(current_timestamp, current_device)`.
///
/// Ties are broken by lexicographic device-id order: the greater device id
/// wins, deterministically, regardless of which side observes the tie first.
pub fn should_apply(
    current_timestamp: Timestamp,
    current_device: &DeviceId,
    incoming_timestamp: Timestamp,
    incoming_device: &DeviceId,
) -> bool {
    match incoming_timestamp.cmp(&current_timestamp) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => incoming_device > current_device,
    }
}
