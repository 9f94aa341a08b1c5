//! Offline union of two on-disk packages (spec §4.7.9, §4.10).
//!
//! Unlike [`crate::merge_engine::MergeEngine`], which merges one device's
//! live view against its peers' logs, `MergeTool` operates entirely offline:
//! it copies every device's rows from a source package into a destination
//! package's matching device directories, skipping rows already present.
//! No in-memory materialized view is produced; a caller that wants one
//! loads the destination package afterward with a `MergeEngine`.

use std::collections::BTreeSet;

use syncstore_core::{DeviceId, Result};
use syncstore_db::{FilePackage, LogDatabase, Order};

/// Per-device row counts a `union` pass copied, for reporting to a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub copied_rows: usize,
    pub skipped_devices: Vec<DeviceId>,
}

/// Copies rows from `source`'s device logs into `destination`'s, excluding
/// any device id in `unsafe_devices` entirely (spec §4.10: a device whose
/// log is known corrupt or untrusted must never be merged in, even
/// read-only).
pub fn union(
    source: &FilePackage,
    destination: &FilePackage,
    unsafe_devices: &BTreeSet<DeviceId>,
) -> Result<MergeReport> {
    destination.prepare()?;

    let mut report = MergeReport::default();
    let mut source_devices = source.enumerate_foreign_devices()?;
    source_devices.push(source.local_device().clone());

    for device in source_devices {
        if unsafe_devices.contains(&device) {
            report.skipped_devices.push(device);
            continue;
        }

        let source_is_local = device == *source.local_device();
        let source_path = if source_is_local {
            source.resolve_readwrite()
        } else {
            source.resolve_readonly(&device)
        };
        if !source_path.exists() {
            continue;
        }
        let mut source_db = LogDatabase::open(&source_path, true)?;

        let destination_is_local = device == *destination.local_device();
        let destination_path = if destination_is_local {
            destination.resolve_readwrite()
        } else {
            let device_dir = destination.devices_dir().join(device.as_str());
            std::fs::create_dir_all(&device_dir)?;
            destination.resolve_readonly(&device)
        };
        let mut destination_db = LogDatabase::open(&destination_path, false)?;

        let mut pending = Vec::new();
        source_db.fetch_after(
            syncstore_core::TimestampSource::distant_past(),
            Order::Ascending,
            256,
            |batch| {
                for row in batch {
                    if !destination_db.contains_exact(row.timestamp, &row.key)? {
                        pending.push(row.clone());
                    }
                }
                Ok(true)
            },
        )?;

        if !pending.is_empty() {
            report.copied_rows += pending.len();
            destination_db.append_batch(&pending)?;
        }
    }

    Ok(report)
}
