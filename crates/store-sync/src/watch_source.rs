//! Coarse, directory-granularity file-system event streams (spec §4.6).
//!
//! Grounded on the debounced-`notify::RecommendedWatcher`-per-root design
//! sketched in the pack's `ferrex` file-watcher module: one watcher per
//! root, events forwarded through a channel to a callback, restartable by
//! dropping and recreating the underlying watcher.
//!
//! Events carry no discrimination finer than the paths `notify` itself
//! reports — callers must not assume per-file granularity beyond that
//! (spec §4.6). `start`'s optional `ignore_prefix` lets a caller suppress a
//! burst that touched only paths under one subtree (its own device's log),
//! so the store doesn't chase its own writes into a sync storm.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};

/// A single restartable watch over one root directory.
///
/// Raw, possibly-bursty `notify` events are coalesced into a single
/// "something changed" callback invocation per quiet period, matching the
/// directory-level granularity spec §4.6 promises.
pub struct WatchSource {
    root: PathBuf,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl WatchSource {
    /// Starts watching `root` (recursively), invoking `on_event` at most
    /// once per burst of underlying notify events. `on_event` runs on a
    /// dedicated background thread, not the caller's.
    ///
    /// If `ignore_prefix` is set, a burst where every changed path falls
    /// under it is suppressed entirely; a burst touching anything else
    /// (even alongside ignored paths) still invokes `on_event`.
    pub fn start(
        root: impl Into<PathBuf>,
        ignore_prefix: Option<String>,
        mut on_event: impl FnMut() + Send + 'static,
    ) -> Self {
        let root = root.into();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_for_worker = stop.clone();
        let watch_root = root.clone();

        let worker = std::thread::Builder::new()
            .name(format!("watch-source-{}", watch_root.display()))
            .spawn(move || {
                let (tx, rx) = mpsc::channel::<PathBuf>();
                let mut watcher = match RecommendedWatcher::new(
                    move |res: notify::Result<notify::Event>| {
                        if let Ok(event) = res {
                            for path in event.paths {
                                let _ = tx.send(path);
                            }
                        }
                    },
                    notify::Config::default(),
                ) {
                    Ok(w) => w,
                    Err(e) => {
                        log::warn!("watch source failed to start for {}: {e}", watch_root.display());
                        return;
                    }
                };
                if let Err(e) = watcher.watch(&watch_root, RecursiveMode::Recursive) {
                    log::warn!("watch source failed to watch {}: {e}", watch_root.display());
                    return;
                }

                loop {
                    if stop_for_worker.load(std::sync::atomic::Ordering::SeqCst) {
                        return;
                    }
                    match rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(path) => {
                            // Drain any further events in this burst before
                            // reporting, so a flurry of FS activity becomes
                            // one coarse notification.
                            let mut paths = vec![path];
                            while let Ok(p) = rx.recv_timeout(Duration::from_millis(50)) {
                                paths.push(p);
                            }
                            let all_ignored = match &ignore_prefix {
                                Some(prefix) => paths
                                    .iter()
                                    .all(|p| is_within_local_device(&watch_root, prefix, p)),
                                None => false,
                            };
                            if !all_ignored {
                                on_event();
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .expect("spawning watch source worker thread");

        Self {
            root,
            worker: Mutex::new(Some(worker)),
            stop,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stops the watcher. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().expect("worker mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatchSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// True if `event_path` lies within the local device's subdirectory of
/// `devices_dir` — used to suppress syncs triggered by the store's own
/// writes (spec §4.6).
pub fn is_within_local_device(devices_dir: &Path, local_device: &str, event_path: &Path) -> bool {
    event_path.starts_with(devices_dir.join(local_device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn fires_on_change_under_root() {
        let dir = tempdir().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let watch = WatchSource::start(dir.path(), None, move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Give the watcher time to register before mutating.
        std::thread::sleep(Duration::from_millis(150));
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::thread::sleep(Duration::from_millis(500));

        assert!(count.load(Ordering::SeqCst) >= 1);
        watch.stop();
    }

    #[test]
    fn ignores_a_burst_confined_to_the_ignore_prefix() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("A")).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let watch = WatchSource::start(dir.path(), Some("A".to_string()), move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(150));
        std::fs::write(dir.path().join("A").join("logs.db"), b"own write").unwrap();
        std::thread::sleep(Duration::from_millis(500));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        watch.stop();
    }

    #[test]
    fn reports_a_burst_that_touches_anything_outside_the_ignore_prefix() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("A")).unwrap();
        std::fs::create_dir_all(dir.path().join("B")).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let watch = WatchSource::start(dir.path(), Some("A".to_string()), move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(150));
        std::fs::write(dir.path().join("B").join("logs.db"), b"peer write").unwrap();
        std::thread::sleep(Duration::from_millis(500));

        assert!(count.load(Ordering::SeqCst) >= 1);
        watch.stop();
    }

    #[test]
    fn local_device_path_is_recognized() {
        let devices_dir = Path::new("/pkg/devices");
        let local_event = devices_dir.join("A").join("logs.db");
        let foreign_event = devices_dir.join("B").join("logs.db");
        assert!(is_within_local_device(devices_dir, "A", &local_event));
        assert!(!is_within_local_device(devices_dir, "A", &foreign_event));
    }
}
