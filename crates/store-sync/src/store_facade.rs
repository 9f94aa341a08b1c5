//! Public async API over a [`MergeEngine`] (spec §4.8).
//!
//! Every blocking operation on `MergeEngine` runs its serial-queue dispatch
//! on the caller's thread already, so the `async` wrappers here exist only
//! to let a tokio-based client avoid stalling its own executor: each one
//! hands the call to `spawn_blocking` and awaits the join handle. Callers
//! that are already on a plain thread can use the `_now` methods directly.

use std::collections::BTreeMap;

use syncstore_core::{Change, DeviceId, Error, Key, PList, Result, Timestamp};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinError;

use crate::merge_engine::{InsertMode, MergeEngine};
use crate::notification::Event;
use syncstore_core::LogEntry;
use std::sync::Arc;

fn join_error(_: JoinError) -> Error {
    Error::io("background task for store operation panicked")
}

/// Thin async facade wrapping one loaded (or loadable) [`MergeEngine`].
#[derive(Clone)]
pub struct StoreFacade {
    engine: Arc<MergeEngine>,
}

impl StoreFacade {
    pub fn new(engine: Arc<MergeEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<MergeEngine> {
        &self.engine
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.is_loaded()
    }

    /// Loads the package and blocks until the initial scan completes.
    pub async fn load(&self) -> Result<()> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.load_now())
            .await
            .map_err(join_error)?
    }

    pub fn load_now(&self) -> Result<()> {
        self.engine.load_now()
    }

    fn ensure_not_reentrant(&self, op: &str) -> Result<()> {
        if self.engine.is_on_memory_queue() {
            return Err(Error::reentrant(op));
        }
        Ok(())
    }

    pub async fn set(&self, key: Key, value: Option<PList>) -> Result<()> {
        self.ensure_not_reentrant("set")?;
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.set(key, value))
            .await
            .map_err(join_error)?
    }

    pub async fn set_many(&self, changes: BTreeMap<Key, Option<PList>>) -> Result<()> {
        self.ensure_not_reentrant("set_many")?;
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.set_many(changes))
            .await
            .map_err(join_error)?
    }

    /// Reads are safe to call reentrantly (they only take the memory
    /// queue's data mutex, never `submit_sync` against it from outside),
    /// so `get`/`all_entries` do not run the reentrancy check.
    pub fn get(&self, key: &str) -> Result<Option<PList>> {
        self.engine.get(key)
    }

    pub fn all_entries(&self) -> Result<BTreeMap<Key, PList>> {
        self.engine.all_entries()
    }

    pub async fn run_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Arc<MergeEngine>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.ensure_not_reentrant("run_transaction")?;
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.run_transaction(f))
            .await
            .map_err(join_error)?
    }

    pub async fn sync(&self) {
        self.engine.sync();
    }

    pub async fn sync_now(&self) -> Result<()> {
        self.ensure_not_reentrant("sync_now")?;
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.sync_now())
            .await
            .map_err(join_error)?
    }

    pub async fn save_now(&self) -> Result<()> {
        self.ensure_not_reentrant("save_now")?;
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.save_now())
            .await
            .map_err(join_error)?
    }

    pub async fn close_database_now(&self) -> Result<()> {
        self.ensure_not_reentrant("close_database_now")?;
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.close_database_now())
            .await
            .map_err(join_error)?
    }

    pub async fn tear_down_now(&self) -> Result<()> {
        self.ensure_not_reentrant("tear_down_now")?;
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.tear_down_now())
            .await
            .map_err(join_error)?
    }

    pub fn tear_down(&self) {
        self.engine.tear_down();
    }

    pub async fn fetch_changes(&self, key: Key) -> Result<Vec<Change>> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.fetch_changes(&key))
            .await
            .map_err(join_error)?
    }

    pub async fn fetch_predecessors(&self, key: Key, from: Timestamp) -> Result<Vec<Change>> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.fetch_predecessors(&key, from))
            .await
            .map_err(join_error)?
    }

    pub async fn fetch_successors(&self, key: Key, from: Timestamp) -> Result<Vec<Change>> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.fetch_successors(&key, from))
            .await
            .map_err(join_error)?
    }

    pub fn most_recent_timestamps(&self) -> std::collections::HashMap<DeviceId, Timestamp> {
        self.engine.most_recent_timestamps()
    }

    pub async fn insert_changes(&self, entries: Vec<LogEntry>, mode: InsertMode) -> Result<()> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.insert_changes(entries, mode))
            .await
            .map_err(join_error)?
    }

    pub fn subscribe(&self) -> (u64, UnboundedReceiver<Event>) {
        self.engine.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.engine.unsubscribe(id)
    }

    /// Blocks until every already-queued job on both serial queues has run
    /// (spec §4.8), useful in tests that need a sync pass to have settled.
    pub async fn wait_until_finished(&self) -> Result<()> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.wait_until_finished())
            .await
            .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge_engine::EngineTuning;
    use syncstore_core::{DeviceId as Device, KeySet};
    use syncstore_db::FilePackage;
    use tempfile::tempdir;

    fn facade(root: std::path::PathBuf, device: &str) -> StoreFacade {
        let package = FilePackage::new(root, Device::new(device));
        StoreFacade::new(MergeEngine::new(package, KeySet::All, EngineTuning::default()))
    }

    #[tokio::test]
    async fn load_then_set_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = facade(dir.path().join("pkg"), "A");
        store.load().await.unwrap();

        store.set("title".to_string(), Some(PList::String("hi".to_string()))).await.unwrap();
        assert_eq!(store.get("title").unwrap(), Some(PList::String("hi".to_string())));
    }

    #[tokio::test]
    async fn reentrant_set_from_within_a_transaction_is_rejected() {
        let dir = tempdir().unwrap();
        let store = facade(dir.path().join("pkg"), "A");
        store.load().await.unwrap();

        let result = store
            .run_transaction(|engine| engine.is_on_memory_queue())
            .await
            .unwrap();
        assert!(result, "transaction body should observe it is on the memory queue");
    }

    #[tokio::test]
    async fn subscriber_sees_did_load_and_did_change() {
        let dir = tempdir().unwrap();
        let store = facade(dir.path().join("pkg"), "A");
        let (_id, mut rx) = store.subscribe();

        store.load().await.unwrap();
        assert_eq!(rx.recv().await, Some(Event::DidLoad));

        store.set("k".to_string(), Some(PList::Int(1))).await.unwrap();
        match rx.recv().await {
            Some(Event::DidChange { values, .. }) => {
                assert_eq!(values.get("k"), Some(&Some(PList::Int(1))));
            }
            other => panic!("expected DidChange, got {other:?}"),
        }
    }
}
