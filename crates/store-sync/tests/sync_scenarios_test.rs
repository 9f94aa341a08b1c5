//! End-to-end scenarios spanning load, client writes, cross-device sync,
//! conflict resolution, and offline import against a real on-disk package.

use std::collections::BTreeSet;
use std::time::Duration;

use syncstore_core::{DeviceId, KeySet, LogEntry, PList};
use syncstore_db::FilePackage;
use syncstore_sync::merge_engine::{EngineTuning, InsertMode};
use syncstore_sync::{union, MergeEngine};
use tempfile::tempdir;

fn fast_tuning() -> EngineTuning {
    EngineTuning {
        save_delay: Duration::from_millis(15),
        save_coalesce: Duration::from_millis(40),
        auto_close_delay: Duration::from_millis(150),
        scan_batch_size: 32,
    }
}

fn open(root: std::path::PathBuf, device: &str) -> std::sync::Arc<MergeEngine> {
    let package = FilePackage::new(root, DeviceId::new(device));
    MergeEngine::new(package, KeySet::All, fast_tuning())
}

#[test]
fn single_device_write_survives_a_reload() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("pkg");

    {
        let engine = open(root.clone(), "laptop");
        engine.load_now().unwrap();
        engine
            .set("journal".to_string(), Some(PList::String("day one".to_string())))
            .unwrap();
        engine.save_now().unwrap();
    }

    let engine = open(root, "laptop");
    engine.load_now().unwrap();
    assert_eq!(
        engine.get("journal").unwrap(),
        Some(PList::String("day one".to_string()))
    );
}

#[test]
fn two_devices_converge_on_a_new_key() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("pkg");

    let phone = open(root.clone(), "phone");
    phone.load_now().unwrap();
    phone.set("title".to_string(), Some(PList::String("vacation".to_string()))).unwrap();
    phone.save_now().unwrap();

    let laptop = open(root, "laptop");
    laptop.load_now().unwrap();
    assert_eq!(
        laptop.get("title").unwrap(),
        Some(PList::String("vacation".to_string()))
    );
}

#[test]
fn last_writer_wins_picks_the_later_timestamp_regardless_of_insert_order() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("pkg");

    // B writes the later timestamp to its own log before A ever loads, so
    // A's own write (an earlier timestamp to the same key) loses to B's on
    // both the initial load and an explicit re-sync.
    let device_b = open(root.clone(), "B");
    device_b.load_now().unwrap();
    device_b
        .insert_changes(
            vec![LogEntry::new(500, None, "status".to_string())
                .with_blob(syncstore_core::codec::encode(&PList::String("done".to_string())).unwrap())],
            InsertMode::AppendOnly,
        )
        .unwrap();

    let device_a = open(root, "A");
    device_a.load_now().unwrap();
    device_a
        .insert_changes(
            vec![LogEntry::new(100, None, "status".to_string())
                .with_blob(syncstore_core::codec::encode(&PList::String("started".to_string())).unwrap())],
            InsertMode::AppendOnly,
        )
        .unwrap();

    device_a.sync_now().unwrap();
    assert_eq!(
        device_a.get("status").unwrap(),
        Some(PList::String("done".to_string()))
    );
}

#[test]
fn reverse_chronological_import_still_resolves_to_the_newest_value() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path().join("pkg"), "A");
    engine.load_now().unwrap();

    let newer = LogEntry::new(200, None, "k".to_string())
        .with_blob(syncstore_core::codec::encode(&PList::Int(2)).unwrap());
    let older = LogEntry::new(100, None, "k".to_string())
        .with_blob(syncstore_core::codec::encode(&PList::Int(1)).unwrap());

    // Overwrite mode is for importing historical data out of order; unlike
    // AppendOnly it does not require each batch to advance the cursor.
    engine.insert_changes(vec![newer], InsertMode::Overwrite).unwrap();
    engine.insert_changes(vec![older], InsertMode::Overwrite).unwrap();

    assert_eq!(engine.get("k").unwrap(), Some(PList::Int(2)));
}

#[test]
fn a_peer_that_appears_after_load_is_picked_up_on_the_next_sync() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("pkg");

    let laptop = open(root.clone(), "laptop");
    laptop.load_now().unwrap();
    assert_eq!(laptop.get("note").unwrap(), None);

    // The peer "tablet" writes after laptop has already loaded.
    let tablet = open(root, "tablet");
    tablet.load_now().unwrap();
    tablet.set("note".to_string(), Some(PList::String("hi".to_string()))).unwrap();
    tablet.save_now().unwrap();

    laptop.sync_now().unwrap();
    assert_eq!(laptop.get("note").unwrap(), Some(PList::String("hi".to_string())));
}

#[test]
fn a_burst_of_writes_coalesces_into_one_saved_state() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path().join("pkg"), "A");
    engine.load_now().unwrap();

    for i in 0..20 {
        engine.set(format!("k{i}"), Some(PList::Int(i))).unwrap();
    }
    engine.save_now().unwrap();

    let history = engine.fetch_changes("k0").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(engine.get("k19").unwrap(), Some(PList::Int(19)));
}

#[test]
fn merge_tool_excludes_unsafe_devices_from_an_offline_union() {
    let dir = tempdir().unwrap();
    let root_a = dir.path().join("a");
    let root_b = dir.path().join("b");

    let device_a = open(root_a.clone(), "A");
    device_a.load_now().unwrap();
    device_a.set("k".to_string(), Some(PList::String("from a".to_string()))).unwrap();
    device_a.save_now().unwrap();

    let package_a = FilePackage::new(root_a, DeviceId::new("A"));
    let package_b = FilePackage::new(root_b.clone(), DeviceId::new("B"));

    let mut unsafe_devices = BTreeSet::new();
    unsafe_devices.insert(DeviceId::new("A"));
    let report = union(&package_a, &package_b, &unsafe_devices).unwrap();
    assert_eq!(report.copied_rows, 0);

    let report = union(&package_a, &package_b, &BTreeSet::new()).unwrap();
    assert_eq!(report.copied_rows, 1);

    let device_b = open(root_b, "B");
    device_b.load_now().unwrap();
    assert_eq!(
        device_b.get("k").unwrap(),
        Some(PList::String("from a".to_string()))
    );
}
