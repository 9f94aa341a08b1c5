//! The concurrent merge engine (spec §4.7): load, client writes, incremental
//! sync, conflict resolution, save/auto-close timers, and history queries.
//!
//! Two serial queues enforce the discipline spec §4.1 describes:
//!
//! * the **memory queue** owns `current`/`key_ts`, the in-memory materialized
//!   view other code reads through [`MergeEngine::get`]/[`MergeEngine::all_entries`];
//! * the **database queue** owns `local_db`/`foreign_dbs`/`cursors`, the
//!   on-disk logs.
//!
//! The memory queue never synchronously calls into the database queue; it
//! only ever posts to it asynchronously (spec §4.1's reentrancy note). The
//! database queue calls back into the memory queue synchronously only to
//! hand over a batch of resolved changes, which is itself posted from the
//! memory queue's side as an async job, so no cross-queue `submit_sync` pair
//! ever nests the two in a way that could deadlock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use syncstore_core::{
    should_apply, Change, DeviceId, Error, Key, KeySet, LogEntry, PList, Result, Timestamp,
    TimestampSource,
};
use syncstore_db::{FilePackage, LogDatabase, Order};

use crate::notification::{Event, NotificationBus};
use crate::serial_executor::{ReentrantPolicy, SerialExecutor, TimerBehavior};
use crate::watch_source::WatchSource;

/// Durations and batch sizes the engine's timers and scans use.
///
/// Centralized so tests can shrink every delay instead of sleeping through
/// production-sized windows (spec §10 ambient config).
#[derive(Debug, Clone, Copy)]
pub struct EngineTuning {
    /// `save` debounce: resets on every write (`TimerBehavior::Delay`).
    pub save_delay: Duration,
    /// `save` ceiling: a write train can postpone `save` this long at most
    /// (`TimerBehavior::Coalesce`).
    pub save_coalesce: Duration,
    /// Idle window before `close_database_now` runs automatically.
    pub auto_close_delay: Duration,
    /// Row count per `fetch_after` batch during load and sync scans.
    pub scan_batch_size: usize,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            save_delay: Duration::from_secs(1),
            save_coalesce: Duration::from_secs(15),
            auto_close_delay: Duration::from_secs(60),
            scan_batch_size: 256,
        }
    }
}

/// Mints a fresh device identity for a store instance that has never opened
/// this package before. Grounded on the teacher's `device-sync` crate,
/// which mints its client id the same way (`uuid::Uuid::new_v4`).
pub fn generate_device_id() -> DeviceId {
    DeviceId::new(uuid::Uuid::new_v4().to_string())
}

const TIMER_SAVE_DELAY: &str = "save-delay";
const TIMER_SAVE_COALESCE: &str = "save-coalesce";
const TIMER_AUTO_CLOSE: &str = "auto-close";

/// How `insert_changes` treats a batch relative to the target log's cursor
/// (spec §4.7.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Reject (with `Error::Conflict`) any entry not strictly after the
    /// current cursor for its device.
    AppendOnly,
    /// Accept entries at any timestamp, skipping ones already present
    /// (`LogDatabase::contains_exact`).
    Overwrite,
}

struct MemoryState {
    current: HashMap<Key, PList>,
    key_ts: HashMap<Key, (Timestamp, DeviceId)>,
    loaded: bool,
    torn_down: bool,
    /// Set once the package has been observed missing from disk (spec §3,
    /// §7). Writes are rejected with `Error::Deleted` while this is set.
    deleted: bool,
}

struct DatabaseState {
    local_db: Option<LogDatabase>,
    foreign_dbs: HashMap<DeviceId, LogDatabase>,
    cursors: HashMap<DeviceId, Timestamp>,
    /// Writes made via `set`/`set_many` before the local log has ever been
    /// opened (i.e. before the first `load`/`load_now`), held here until
    /// `scan_all_devices_for_load` opens the log and flushes them in.
    pending_local_writes: Vec<LogEntry>,
}

/// The merge engine for one device's view of one package.
pub struct MergeEngine {
    package: FilePackage,
    key_set: KeySet,
    tuning: EngineTuning,
    clock: TimestampSource,
    memory_queue: Arc<SerialExecutor>,
    db_queue: Arc<SerialExecutor>,
    memory: Mutex<MemoryState>,
    database: Mutex<DatabaseState>,
    notifications: NotificationBus,
    devices_watch: Mutex<Option<WatchSource>>,
}

impl MergeEngine {
    pub fn new(package: FilePackage, key_set: KeySet, tuning: EngineTuning) -> Arc<Self> {
        Arc::new(Self {
            package,
            key_set,
            tuning,
            clock: TimestampSource::new(),
            memory_queue: SerialExecutor::with_policy("memory", ReentrantPolicy::ExecuteInline),
            db_queue: SerialExecutor::with_policy("database", ReentrantPolicy::ExecuteInline),
            memory: Mutex::new(MemoryState {
                current: HashMap::new(),
                key_ts: HashMap::new(),
                loaded: false,
                torn_down: false,
                deleted: false,
            }),
            database: Mutex::new(DatabaseState {
                local_db: None,
                foreign_dbs: HashMap::new(),
                cursors: HashMap::new(),
                pending_local_writes: Vec::new(),
            }),
            notifications: NotificationBus::new(),
            devices_watch: Mutex::new(None),
        })
    }

    pub fn package(&self) -> &FilePackage {
        &self.package
    }

    pub fn subscribe(&self) -> (u64, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        self.notifications.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.notifications.unsubscribe(id)
    }

    pub fn is_loaded(&self) -> bool {
        self.memory.lock().expect("memory mutex poisoned").loaded
    }

    /// True once the package has been observed missing from disk (spec §3,
    /// §7). Cheap: reads the cached flag rather than re-checking the
    /// filesystem; `check_deleted` is what refreshes it.
    pub fn is_deleted(&self) -> bool {
        self.memory.lock().expect("memory mutex poisoned").deleted
    }

    /// Marks the store deleted and posts `DidDelete`, once, the first time
    /// disappearance is observed (spec §7).
    fn mark_deleted(&self) {
        let mut memory = self.memory.lock().expect("memory mutex poisoned");
        if memory.deleted {
            return;
        }
        memory.deleted = true;
        drop(memory);
        self.notifications.post(Event::DidDelete);
    }

    /// Re-checks the package against the filesystem and updates `deleted`
    /// accordingly; returns the refreshed state. Called from the places that
    /// actually touch disk (`sync_now`, the device-directory watch) rather
    /// than from every read, since a stat on every `get` would be wasteful.
    fn check_deleted(&self) -> bool {
        if self.package.is_deleted() {
            self.mark_deleted();
            true
        } else {
            self.is_deleted()
        }
    }

    /// True if the calling thread's call chain has already entered the
    /// memory queue — used to reject operations spec §4.8 marks as
    /// forbidden from within a running transaction or event handler.
    pub fn is_on_memory_queue(&self) -> bool {
        self.memory_queue.in_current_stack()
    }

    // ---- Load (spec §4.7.1) -------------------------------------------

    /// Loads every device log into memory, applying last-writer-wins as each
    /// row is folded in. Synchronous: blocks until the initial scan finishes.
    pub fn load_now(self: &Arc<Self>) -> Result<()> {
        self.package.prepare()?;

        let engine = self.clone();
        let entries = self.db_queue.submit_sync(move || engine.scan_all_devices_for_load())??;
        self.apply_loaded_entries(entries)?;

        {
            let mut memory = self.memory.lock().expect("memory mutex poisoned");
            memory.loaded = true;
            memory.deleted = false;
        }
        self.start_watches();
        self.notifications.post(Event::DidLoad);
        Ok(())
    }

    /// Posts the load to the database queue and returns immediately; the
    /// engine becomes `is_loaded() == true` once it completes.
    pub fn load(self: &Arc<Self>) {
        let engine = self.clone();
        self.db_queue.submit_async(move || {
            if let Err(e) = engine.load_now() {
                log::warn!("load failed: {e}");
            }
        });
    }

    fn scan_all_devices_for_load(&self) -> Result<Vec<(DeviceId, LogEntry)>> {
        let local_device = self.package.local_device().clone();
        let mut database = self.database.lock().expect("database mutex poisoned");

        if database.local_db.is_none() {
            database.local_db =
                Some(LogDatabase::open(self.package.resolve_readwrite(), false)?);
        }
        if !database.pending_local_writes.is_empty() {
            let pending = std::mem::take(&mut database.pending_local_writes);
            let local = database.local_db.as_mut().expect("just opened above");
            local.append_batch(&pending)?;
        }
        let foreign_devices = self.package.enumerate_foreign_devices()?;
        for device in &foreign_devices {
            database
                .foreign_dbs
                .entry(device.clone())
                .or_insert(LogDatabase::open(self.package.resolve_readonly(device), true)?);
        }

        let mut all_entries = Vec::new();
        let batch_size = self.tuning.scan_batch_size;
        let distant_past = TimestampSource::distant_past();

        if let Some(local) = database.local_db.as_mut() {
            let (device_entries, cursor) =
                scan_device(local, distant_past, &self.key_set, batch_size)?;
            database.cursors.insert(local_device.clone(), cursor);
            all_entries.extend(device_entries.into_iter().map(|e| (local_device.clone(), e)));
        }

        for device in &foreign_devices {
            let db = database
                .foreign_dbs
                .get_mut(device)
                .expect("just inserted above");
            let (device_entries, cursor) = scan_device(db, distant_past, &self.key_set, batch_size)?;
            database.cursors.insert(device.clone(), cursor);
            all_entries.extend(device_entries.into_iter().map(|e| (device.clone(), e)));
        }

        all_entries.sort_by_key(|(_, entry)| entry.timestamp);
        Ok(all_entries)
    }

    fn apply_loaded_entries(self: &Arc<Self>, entries: Vec<(DeviceId, LogEntry)>) -> Result<()> {
        let engine = self.clone();
        self.memory_queue.submit_sync(move || {
            let mut memory = engine.memory.lock().expect("memory mutex poisoned");
            for (device, entry) in entries {
                if !engine.key_set.wants(&entry.key) {
                    continue;
                }
                apply_entry_locked(&mut memory, &device, &entry);
            }
        })?;
        Ok(())
    }

    // ---- Client write (spec §4.7.2) -----------------------------------

    pub fn set(self: &Arc<Self>, key: Key, value: Option<PList>) -> Result<()> {
        let mut changes = BTreeMap::new();
        changes.insert(key, value);
        self.set_many(changes)
    }

    /// Applies every change in `changes` at one shared timestamp, so they
    /// are indistinguishable from a single atomic write to any observer.
    pub fn set_many(self: &Arc<Self>, changes: BTreeMap<Key, Option<PList>>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        if self.is_deleted() {
            return Err(Error::Deleted);
        }
        let local_device = self.package.local_device().clone();
        let timestamp = self.clock.now();

        let engine = self.clone();
        let changes_for_memory = changes.clone();
        let entries = self.memory_queue.submit_sync(move || {
            let mut memory = engine.memory.lock().expect("memory mutex poisoned");
            let mut entries = Vec::with_capacity(changes_for_memory.len());
            for (key, value) in changes_for_memory {
                let parent = memory.key_ts.get(&key).map(|(ts, _)| *ts);
                let blob = match &value {
                    Some(v) => Some(syncstore_core::codec::encode(v)?),
                    None => None,
                };
                let mut entry = LogEntry::new(timestamp, parent, key.clone());
                entry.blob = blob;
                match value {
                    Some(v) => memory.current.insert(key.clone(), v),
                    None => memory.current.remove(&key),
                };
                memory.key_ts.insert(key, (timestamp, local_device.clone()));
                entries.push(entry);
            }
            Ok::<_, Error>(entries)
        })??;

        let engine = self.clone();
        self.db_queue.submit_async(move || {
            let mut database = engine.database.lock().expect("database mutex poisoned");
            if database.local_db.is_none() {
                // Not loaded yet: hold the write until `load`/`load_now`
                // opens the local log, which flushes this buffer (spec
                // §4.8: "else value is buffered and written post-load").
                database.pending_local_writes.extend(entries);
                return;
            }
            let local = database.local_db.as_mut().expect("checked above");
            if let Err(e) = local.append_batch(&entries) {
                log::warn!("append_batch failed: {e}");
                return;
            }
            let local_device = engine.package.local_device().clone();
            let max_ts = entries.iter().map(|e| e.timestamp).max();
            if let Some(max_ts) = max_ts {
                let cursor = database.cursors.entry(local_device).or_insert(TimestampSource::distant_past());
                if max_ts > *cursor {
                    *cursor = max_ts;
                }
            }
        });

        self.notifications.post(Event::DidChange {
            values: changes.clone(),
            timestamps: changes
                .keys()
                .map(|k| (k.clone(), timestamp))
                .collect(),
        });
        self.schedule_save();
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<PList>> {
        let memory = self.memory.lock().expect("memory mutex poisoned");
        Ok(memory.current.get(key).cloned())
    }

    pub fn all_entries(&self) -> Result<BTreeMap<Key, PList>> {
        let memory = self.memory.lock().expect("memory mutex poisoned");
        Ok(memory.current.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Runs `f` with exclusive access to the memory queue, so a caller can
    /// read-then-write several keys atomically (spec §4.7.2: transactions).
    pub fn run_transaction<F, R>(self: &Arc<Self>, f: F) -> Result<R>
    where
        F: FnOnce(&Arc<Self>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let engine = self.clone();
        self.memory_queue.submit_sync(move || f(&engine))
    }

    // ---- Save / auto-close (spec §4.7.5, §4.7.6) -----------------------

    fn schedule_save(self: &Arc<Self>) {
        let engine = self.clone();
        self.db_queue.schedule_timer(
            TIMER_SAVE_DELAY,
            self.tuning.save_delay,
            TimerBehavior::Delay,
            {
                let engine = engine.clone();
                move || engine.run_save()
            },
        );
        self.db_queue.schedule_timer(
            TIMER_SAVE_COALESCE,
            self.tuning.save_coalesce,
            TimerBehavior::Coalesce,
            move || engine.run_save(),
        );
    }

    fn run_save(self: Arc<Self>) {
        self.db_queue.cancel_timer(TIMER_SAVE_DELAY);
        self.db_queue.cancel_timer(TIMER_SAVE_COALESCE);
        let mut database = self.database.lock().expect("database mutex poisoned");
        if let Some(local) = database.local_db.as_mut() {
            if let Err(e) = local.save() {
                log::warn!("save failed: {e}");
                return;
            }
            local.blink();
        }
        drop(database);
        self.schedule_auto_close();
    }

    /// Flushes the local log immediately (spec §4.7.5).
    pub fn save_now(self: &Arc<Self>) -> Result<()> {
        let engine = self.clone();
        self.db_queue.submit_sync(move || engine.run_save())
    }

    fn schedule_auto_close(self: &Arc<Self>) {
        let engine = self.clone();
        self.db_queue.schedule_timer(
            TIMER_AUTO_CLOSE,
            self.tuning.auto_close_delay,
            TimerBehavior::Delay,
            move || {
                if let Err(e) = engine.close_database_now() {
                    log::warn!("auto-close failed: {e}");
                }
            },
        );
    }

    /// Releases the local database's connection; it reopens lazily on next
    /// use (spec §4.7.6).
    pub fn close_database_now(self: &Arc<Self>) -> Result<()> {
        let engine = self.clone();
        self.db_queue.submit_sync(move || {
            let mut database = engine.database.lock().expect("database mutex poisoned");
            if let Some(local) = database.local_db.as_mut() {
                local.close();
            }
            for db in database.foreign_dbs.values_mut() {
                db.close();
            }
        })
    }

    // ---- Incremental sync (spec §4.7.3, §4.7.4) ------------------------

    /// Scans every foreign device's log past its cursor, applies
    /// last-writer-wins, and posts `DidSync` for anything that changed.
    pub fn sync_now(self: &Arc<Self>) -> Result<()> {
        if self.check_deleted() {
            return Err(Error::Deleted);
        }
        let engine = self.clone();
        let resolved = self.db_queue.submit_sync(move || engine.scan_foreign_devices_for_sync())??;
        if resolved.is_empty() {
            return Ok(());
        }

        let engine = self.clone();
        let applied = self.memory_queue.submit_sync(move || {
            let mut memory = engine.memory.lock().expect("memory mutex poisoned");
            let mut applied = BTreeMap::new();
            for (device, entry) in &resolved {
                if !engine.key_set.wants(&entry.key) {
                    continue;
                }
                if apply_entry_locked(&mut memory, device, entry) {
                    let value = if entry.is_tombstone() {
                        None
                    } else {
                        decode_blob(entry).ok().flatten()
                    };
                    applied.insert(entry.key.clone(), (value, entry.timestamp));
                }
            }
            applied
        })?;

        if !applied.is_empty() {
            self.notifications.post(Event::DidSync {
                values: applied.iter().map(|(k, (v, _))| (k.clone(), v.clone())).collect(),
                timestamps: applied.iter().map(|(k, (_, ts))| (k.clone(), *ts)).collect(),
            });
        }
        Ok(())
    }

    /// Posts a sync pass to the database queue without blocking the caller.
    pub fn sync(self: &Arc<Self>) {
        let engine = self.clone();
        self.db_queue.submit_async(move || {
            if let Err(e) = engine.sync_now() {
                log::warn!("sync failed: {e}");
            }
        });
    }

    fn scan_foreign_devices_for_sync(&self) -> Result<Vec<(DeviceId, LogEntry)>> {
        let batch_size = self.tuning.scan_batch_size;
        let mut database = self.database.lock().expect("database mutex poisoned");

        let foreign_devices = self.package.enumerate_foreign_devices()?;
        for device in &foreign_devices {
            database
                .foreign_dbs
                .entry(device.clone())
                .or_insert(LogDatabase::open(self.package.resolve_readonly(device), true)?);
        }

        let mut resolved = Vec::new();
        for device in &foreign_devices {
            let cursor = database
                .cursors
                .get(device)
                .copied()
                .unwrap_or(TimestampSource::distant_past());
            let db = database
                .foreign_dbs
                .get_mut(device)
                .expect("just inserted above");
            let (device_entries, new_cursor) = scan_device(db, cursor, &self.key_set, batch_size)?;
            database.cursors.insert(device.clone(), new_cursor);
            resolved.extend(device_entries.into_iter().map(|e| (device.clone(), e)));
        }

        resolved.sort_by_key(|(_, entry)| entry.timestamp);
        Ok(resolved)
    }

    fn start_watches(self: &Arc<Self>) {
        let devices_dir = self.package.devices_dir();
        let local_device = self.package.local_device().as_str().to_string();
        let engine = self.clone();
        // Suppress syncs triggered purely by this device's own writes under
        // devices/<local>/ (spec §4.6); anything else under devices/ (a
        // foreign device's log changing, or the package itself vanishing)
        // still triggers a sync pass.
        let watch = WatchSource::start(devices_dir, Some(local_device), move || {
            if engine.package.is_deleted() {
                engine.mark_deleted();
            } else {
                engine.sync();
            }
        });
        *self.devices_watch.lock().expect("watch mutex poisoned") = Some(watch);
    }

    // ---- History queries (spec §4.7.7) ---------------------------------

    /// Every change recorded for `key`, across every known device, in
    /// ascending timestamp order.
    pub fn fetch_changes(&self, key: &str) -> Result<Vec<Change>> {
        let mut database = self.database.lock().expect("database mutex poisoned");
        let mut changes = Vec::new();

        if let Some(local) = database.local_db.as_mut() {
            collect_key_history(local, key, &mut changes)?;
        }
        let devices: Vec<DeviceId> = database.foreign_dbs.keys().cloned().collect();
        for device in devices {
            let db = database.foreign_dbs.get_mut(&device).expect("device present");
            collect_key_history(db, key, &mut changes)?;
        }

        changes.sort_by_key(|c| c.timestamp);
        Ok(changes)
    }

    /// Walks `parent_timestamp` links backward from `from`, oldest last.
    pub fn fetch_predecessors(&self, key: &str, from: Timestamp) -> Result<Vec<Change>> {
        let history = self.fetch_changes(key)?;
        let by_timestamp: HashMap<Timestamp, &Change> =
            history.iter().map(|c| (c.timestamp, c)).collect();

        let mut chain = Vec::new();
        let mut cursor = by_timestamp.get(&from).and_then(|c| c.parent_timestamp);
        while let Some(ts) = cursor {
            match by_timestamp.get(&ts) {
                Some(change) => {
                    chain.push((*change).clone());
                    cursor = change.parent_timestamp;
                }
                None => break,
            }
        }
        Ok(chain)
    }

    /// Every recorded change to `key` strictly after `from`, ascending.
    pub fn fetch_successors(&self, key: &str, from: Timestamp) -> Result<Vec<Change>> {
        let history = self.fetch_changes(key)?;
        Ok(history.into_iter().filter(|c| c.timestamp > from).collect())
    }

    /// The newest known timestamp per device (spec §8's cursor invariant,
    /// exposed for diagnostics and `MergeTool`).
    pub fn most_recent_timestamps(&self) -> HashMap<DeviceId, Timestamp> {
        self.database.lock().expect("database mutex poisoned").cursors.clone()
    }

    // ---- Insert / import (spec §4.7.8) ---------------------------------

    /// Appends `entries` to this device's own log under `mode`, then folds
    /// any that win last-writer-wins into the in-memory view.
    ///
    /// Only the local device's log is writable here, matching spec's
    /// single-writer-per-log rule; importing a batch on behalf of another
    /// device is `MergeTool`'s job, operating directly on package files
    /// rather than through a live engine (spec §4.7.9).
    pub fn insert_changes(self: &Arc<Self>, entries: Vec<LogEntry>, mode: InsertMode) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        if self.is_deleted() {
            return Err(Error::Deleted);
        }
        let engine = self.clone();
        let local_device = self.package.local_device().clone();
        let entries_for_db = entries.clone();
        let accepted = self.db_queue.submit_sync(move || {
            let mut database = engine.database.lock().expect("database mutex poisoned");
            let cursor = database
                .cursors
                .get(&local_device)
                .copied()
                .unwrap_or(TimestampSource::distant_past());
            let db = database
                .local_db
                .get_or_insert(LogDatabase::open(engine.package.resolve_readwrite(), false)?);

            let mut accepted = Vec::new();
            for entry in entries_for_db {
                match mode {
                    InsertMode::AppendOnly => {
                        if entry.timestamp <= cursor {
                            return Err(Error::Conflict {
                                attempted: entry.timestamp,
                                cursor,
                            });
                        }
                        accepted.push(entry);
                    }
                    InsertMode::Overwrite => {
                        if !db.contains_exact(entry.timestamp, &entry.key)? {
                            accepted.push(entry);
                        }
                    }
                }
            }
            if !accepted.is_empty() {
                db.append_batch(&accepted)?;
                let max_ts = accepted.iter().map(|e| e.timestamp).max().expect("non-empty");
                let cursor = database
                    .cursors
                    .entry(local_device.clone())
                    .or_insert(TimestampSource::distant_past());
                if max_ts > *cursor {
                    *cursor = max_ts;
                }
            }
            Ok(accepted)
        })??;

        if accepted.is_empty() {
            return Ok(());
        }

        let engine = self.clone();
        let local_device = self.package.local_device().clone();
        let applied = self.memory_queue.submit_sync(move || {
            let mut memory = engine.memory.lock().expect("memory mutex poisoned");
            let mut applied = BTreeMap::new();
            for entry in &accepted {
                if !engine.key_set.wants(&entry.key) {
                    continue;
                }
                if apply_entry_locked(&mut memory, &local_device, entry) {
                    let value = if entry.is_tombstone() { None } else { decode_blob(entry).ok().flatten() };
                    applied.insert(entry.key.clone(), (value, entry.timestamp));
                }
            }
            applied
        })?;

        if !applied.is_empty() {
            self.notifications.post(Event::DidSync {
                values: applied.iter().map(|(k, (v, _))| (k.clone(), v.clone())).collect(),
                timestamps: applied.iter().map(|(k, (_, ts))| (k.clone(), *ts)).collect(),
            });
        }
        Ok(())
    }

    // ---- Tear-down (spec §5) -------------------------------------------

    pub fn tear_down_now(self: &Arc<Self>) -> Result<()> {
        {
            let mut watch = self.devices_watch.lock().expect("watch mutex poisoned");
            if let Some(w) = watch.take() {
                w.stop();
            }
        }
        self.db_queue.cancel_all_timers();
        self.close_database_now()?;

        let engine = self.clone();
        self.memory_queue.submit_sync(move || {
            let mut memory = engine.memory.lock().expect("memory mutex poisoned");
            memory.current.clear();
            memory.key_ts.clear();
            memory.loaded = false;
            memory.torn_down = true;
        })?;
        self.notifications.post(Event::DidTearDown);
        Ok(())
    }

    pub fn tear_down(self: &Arc<Self>) {
        let engine = self.clone();
        self.db_queue.submit_async(move || {
            if let Err(e) = engine.tear_down_now() {
                log::warn!("tear_down failed: {e}");
            }
        });
    }

    /// Blocks until every job already queued on either serial queue has
    /// drained (spec §4.8: `wait_until_finished`).
    pub fn wait_until_finished(&self) -> Result<()> {
        self.db_queue.submit_sync(|| ())?;
        self.memory_queue.submit_sync(|| ())?;
        Ok(())
    }
}

/// Reads the rows of one device's log that matter for `key_set`, starting
/// strictly after `since`, and returns them alongside the cursor the caller
/// should remember for next time.
///
/// For `KeySet::All` this is an unbounded ascending scan and the cursor is
/// simply the last row's timestamp. For `KeySet::Only`, spec §11 calls for
/// stopping early: scan newest-first, track which requested keys are still
/// unresolved, and stop once every one of them has yielded its newest row —
/// any older row for an already-resolved key cannot change the materialized
/// view, and rows for keys outside the set are never wanted. The cursor is
/// still the true newest timestamp seen in the scan (the first row of the
/// first batch, since rows arrive newest-first), not merely the newest of
/// the *returned* rows, so a later scan never re-examines a row just
/// because its key wasn't in this engine's projection.
fn scan_device(
    db: &mut LogDatabase,
    since: Timestamp,
    key_set: &KeySet,
    batch_size: usize,
) -> Result<(Vec<LogEntry>, Timestamp)> {
    match key_set {
        KeySet::All => {
            let mut out = Vec::new();
            db.fetch_after(since, Order::Ascending, batch_size, |batch| {
                out.extend(batch.iter().cloned());
                Ok(true)
            })?;
            let cursor = out.last().map(|e| e.timestamp).unwrap_or(since);
            Ok((out, cursor))
        }
        KeySet::Only(keys) => {
            if keys.is_empty() {
                return Ok((Vec::new(), since));
            }
            let mut out = Vec::new();
            let mut pending: HashSet<Key> = keys.clone();
            let mut cursor = since;
            db.fetch_after(since, Order::Descending, batch_size, |batch| {
                if cursor == since {
                    if let Some(first) = batch.first() {
                        cursor = first.timestamp;
                    }
                }
                for row in batch {
                    if pending.remove(&row.key) {
                        out.push(row.clone());
                    }
                }
                Ok(!pending.is_empty())
            })?;
            Ok((out, cursor))
        }
    }
}

fn decode_blob(entry: &LogEntry) -> Result<Option<PList>> {
    match &entry.blob {
        Some(bytes) => syncstore_core::codec::decode(bytes).map(Some),
        None => Ok(None),
    }
}

/// Folds one log row into `memory`'s `current`/`key_ts`, applying
/// last-writer-wins (spec §4.7.4). Returns `true` if the row won and changed
/// the materialized view.
fn apply_entry_locked(memory: &mut MemoryState, device: &DeviceId, entry: &LogEntry) -> bool {
    let current = memory.key_ts.get(&entry.key).cloned();
    let wins = match current {
        None => true,
        Some((current_ts, ref current_device)) => {
            should_apply(current_ts, current_device, entry.timestamp, device)
        }
    };
    if !wins {
        return false;
    }

    memory.key_ts.insert(entry.key.clone(), (entry.timestamp, device.clone()));
    if entry.is_tombstone() {
        memory.current.remove(&entry.key);
    } else {
        match decode_blob(entry) {
            Ok(Some(value)) => {
                memory.current.insert(entry.key.clone(), value);
            }
            Ok(None) => {
                memory.current.remove(&entry.key);
            }
            Err(e) => {
                log::warn!("dropping row with undecodable blob for key {}: {e}", entry.key);
                return false;
            }
        }
    }
    true
}

fn collect_key_history(db: &mut LogDatabase, key: &str, out: &mut Vec<Change>) -> Result<()> {
    db.fetch_after(TimestampSource::distant_past(), Order::Ascending, 256, |batch| {
        for row in batch {
            if row.key != key {
                continue;
            }
            let value = decode_blob(row)?;
            out.push(Change {
                timestamp: row.timestamp,
                parent_timestamp: row.parent_timestamp,
                key: row.key.clone(),
                value,
            });
        }
        Ok(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(root: std::path::PathBuf, device: &str) -> Arc<MergeEngine> {
        let package = FilePackage::new(root, DeviceId::new(device));
        MergeEngine::new(package, KeySet::All, EngineTuning {
            save_delay: Duration::from_millis(20),
            save_coalesce: Duration::from_millis(50),
            auto_close_delay: Duration::from_millis(200),
            scan_batch_size: 16,
        })
    }

    #[test]
    fn generate_device_id_produces_distinct_non_empty_ids() {
        let a = generate_device_id();
        let b = generate_device_id();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn set_then_get_round_trips_through_memory() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path().join("pkg"), "A");
        engine.load_now().unwrap();

        engine.set("title".to_string(), Some(PList::String("hello".to_string()))).unwrap();
        assert_eq!(engine.get("title").unwrap(), Some(PList::String("hello".to_string())));
    }

    #[test]
    fn set_persists_to_local_log_across_reload() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("pkg");
        {
            let engine = engine(root.clone(), "A");
            engine.load_now().unwrap();
            engine.set("title".to_string(), Some(PList::Int(7))).unwrap();
            engine.save_now().unwrap();
        }

        let engine = engine(root, "A");
        engine.load_now().unwrap();
        assert_eq!(engine.get("title").unwrap(), Some(PList::Int(7)));
    }

    #[test]
    fn tombstone_removes_key_from_current_view() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path().join("pkg"), "A");
        engine.load_now().unwrap();

        engine.set("title".to_string(), Some(PList::Int(1))).unwrap();
        engine.set("title".to_string(), None).unwrap();
        assert_eq!(engine.get("title").unwrap(), None);
    }

    #[test]
    fn two_devices_sync_a_new_key_via_insert_changes() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("pkg");

        let device_a = engine(root.clone(), "A");
        device_a.load_now().unwrap();
        device_a.set("title".to_string(), Some(PList::String("from a".to_string()))).unwrap();
        device_a.save_now().unwrap();

        let device_b = engine(root, "B");
        device_b.load_now().unwrap();
        assert_eq!(
            device_b.get("title").unwrap(),
            Some(PList::String("from a".to_string()))
        );
    }

    #[test]
    fn last_writer_wins_on_conflicting_concurrent_writes() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("pkg");

        let device_a = engine(root.clone(), "A");
        device_a.load_now().unwrap();
        let entries = vec![LogEntry::new(100, None, "title".to_string())
            .with_blob(syncstore_core::codec::encode(&PList::String("older".to_string())).unwrap())];
        device_a.insert_changes(entries, InsertMode::AppendOnly).unwrap();

        let device_b = engine(root, "B");
        device_b.load_now().unwrap();
        let entries = vec![LogEntry::new(200, None, "title".to_string())
            .with_blob(syncstore_core::codec::encode(&PList::String("newer".to_string())).unwrap())];
        device_b.insert_changes(entries, InsertMode::AppendOnly).unwrap();

        device_a.sync_now().unwrap();
        assert_eq!(
            device_a.get("title").unwrap(),
            Some(PList::String("newer".to_string()))
        );
    }

    #[test]
    fn append_only_insert_rejects_non_advancing_timestamp() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path().join("pkg"), "A");
        engine.load_now().unwrap();
        engine
            .insert_changes(vec![LogEntry::new(100, None, "k".to_string())], InsertMode::AppendOnly)
            .unwrap();

        let result = engine.insert_changes(
            vec![LogEntry::new(50, None, "k".to_string())],
            InsertMode::AppendOnly,
        );
        assert!(matches!(result, Err(Error::Conflict { .. })));
    }

    #[test]
    fn fetch_changes_returns_full_key_history_ascending() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path().join("pkg"), "A");
        engine.load_now().unwrap();
        engine.set("k".to_string(), Some(PList::Int(1))).unwrap();
        engine.set("k".to_string(), Some(PList::Int(2))).unwrap();

        let history = engine.fetch_changes("k").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp < history[1].timestamp);
        assert_eq!(history[1].value, Some(PList::Int(2)));
    }

    #[test]
    fn fetch_predecessors_walks_parent_chain_backward() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path().join("pkg"), "A");
        engine.load_now().unwrap();
        engine.set("k".to_string(), Some(PList::Int(1))).unwrap();
        engine.set("k".to_string(), Some(PList::Int(2))).unwrap();
        let latest = engine.fetch_changes("k").unwrap().pop().unwrap();

        let predecessors = engine.fetch_predecessors("k", latest.timestamp).unwrap();
        assert_eq!(predecessors.len(), 1);
        assert_eq!(predecessors[0].value, Some(PList::Int(1)));
    }

    #[test]
    fn run_transaction_sees_consistent_state() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path().join("pkg"), "A");
        engine.load_now().unwrap();
        engine.set("counter".to_string(), Some(PList::Int(1))).unwrap();

        let doubled = engine
            .run_transaction(|engine| {
                let current = engine.get("counter").unwrap().and_then(|v| v.as_int()).unwrap_or(0);
                current * 2
            })
            .unwrap();
        assert_eq!(doubled, 2);
    }
}
