//! Versioned copy-on-write configuration snapshots.
//!
//! One [`ConfigDraft`] exists per [`SnapshotStore`]. It owns the only mutable
//! [`Configuration`] and lives on the editing thread. Every other thread reads
//! through [`SnapshotStore::snapshot`], which hands out an `Arc` to an immutable
//! copy. Publishing swaps the pointer; readers holding an older snapshot keep it
//! alive until they drop it.

use crate::config::{Configuration, ScreenMetrics};
use crate::log_info;
use arc_swap::ArcSwap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct ConfigSnapshot {
    version: u64,
    config: Configuration,
}

impl ConfigSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }
}

impl Deref for ConfigSnapshot {
    type Target = Configuration;

    fn deref(&self) -> &Configuration {
        &self.config
    }
}

/// Work another thread needs applied to the draft by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftRequest {
    RecalculateDimensions(ScreenMetrics),
}

pub struct SnapshotStore {
    current: ArcSwap<ConfigSnapshot>,
    version: AtomicU64,
    request_tx: Sender<DraftRequest>,
}

impl SnapshotStore {
    /// Creates the store and its single draft. The initial configuration is
    /// visible as version 0 before anything is published.
    pub fn new(initial: Configuration) -> (Arc<Self>, ConfigDraft) {
        let (request_tx, request_rx) = unbounded();
        let store = Arc::new(Self {
            current: ArcSwap::from_pointee(ConfigSnapshot {
                version: 0,
                config: initial.clone(),
            }),
            version: AtomicU64::new(0),
            request_tx,
        });

        let draft = ConfigDraft {
            store: Arc::clone(&store),
            config: initial,
            requests: request_rx,
        };

        (store, draft)
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Version of the snapshot [`snapshot`](Self::snapshot) would return right now.
    pub fn current_version(&self) -> u64 {
        self.current.load().version
    }

    pub fn request_sender(&self) -> Sender<DraftRequest> {
        self.request_tx.clone()
    }

    fn install(&self, config: Configuration) -> Arc<ConfigSnapshot> {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Arc::new(ConfigSnapshot { version, config });
        self.current.store(Arc::clone(&snapshot));
        snapshot
    }
}

/// The editable configuration. Not `Clone`: whoever holds it is the editing thread.
pub struct ConfigDraft {
    store: Arc<SnapshotStore>,
    config: Configuration,
    requests: Receiver<DraftRequest>,
}

impl ConfigDraft {
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Mutates the draft. Nothing is visible to other threads until [`publish`](Self::publish).
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut Configuration) -> R) -> R {
        f(&mut self.config)
    }

    pub fn replace(&mut self, config: Configuration) {
        self.config = config;
    }

    pub fn publish(&mut self) -> Arc<ConfigSnapshot> {
        self.store.install(self.config.clone())
    }

    /// Applies queued [`DraftRequest`]s and publishes once if any of them changed
    /// the draft. Returns the new snapshot in that case.
    pub fn apply_requests(&mut self) -> Option<Arc<ConfigSnapshot>> {
        let mut changed = false;
        while let Ok(request) = self.requests.try_recv() {
            match request {
                DraftRequest::RecalculateDimensions(screen) => {
                    if self.config.recalculate_dimensions(screen) {
                        log_info!("Recalculated mode dimensions for {}x{}", screen.width, screen.height);
                        changed = true;
                    }
                }
            }
        }

        changed.then(|| self.publish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn mirror(name: &str) -> MirrorConfig {
        MirrorConfig {
            name: name.to_string(),
            source: Default::default(),
            output: Default::default(),
            color_key: None,
            enabled: true,
        }
    }

    #[test]
    fn initial_snapshot_is_version_zero() {
        let (store, draft) = SnapshotStore::new(Configuration::default());
        let snap = store.snapshot();
        assert_eq!(snap.version(), 0);
        assert_eq!(store.current_version(), 0);
        assert_eq!(snap.config(), draft.config());
    }

    #[test]
    fn edits_are_invisible_until_published() {
        let (store, mut draft) = SnapshotStore::new(Configuration::default());
        draft.edit(|cfg| cfg.mirrors.push(mirror("map")));
        assert!(store.snapshot().mirrors.is_empty());

        let published = draft.publish();
        assert_eq!(published.version(), 1);
        assert_eq!(store.snapshot().mirrors.len(), 1);
    }

    #[test]
    fn old_handle_survives_later_publish_unchanged() {
        let (store, mut draft) = SnapshotStore::new(Configuration::default());
        draft.edit(|cfg| cfg.mirrors.push(mirror("first")));
        draft.publish();
        let held = store.snapshot();

        draft.edit(|cfg| {
            cfg.mirrors[0].name = "renamed".to_string();
            cfg.mirrors.push(mirror("second"));
        });
        draft.publish();

        assert_eq!(held.version(), 1);
        assert_eq!(held.mirrors.len(), 1);
        assert_eq!(held.mirrors[0].name, "first");
        assert_eq!(store.snapshot().mirrors[0].name, "renamed");
    }

    #[test]
    fn versions_never_go_backwards_for_a_reader() {
        let (store, mut draft) = SnapshotStore::new(Configuration::default());
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last = 0;
                let mut observations = 0u64;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    let version = store.snapshot().version();
                    assert!(version >= last, "saw {} after {}", version, last);
                    assert!(store.current_version() >= version);
                    last = version;
                    observations += 1;
                    if finished {
                        break;
                    }
                }
                (last, observations)
            })
        };

        for i in 0..500 {
            draft.edit(|cfg| cfg.window_search_interval_ms = i);
            draft.publish();
        }
        done.store(true, Ordering::Release);

        let (last, observations) = reader.join().unwrap();
        assert!(observations > 0);
        assert_eq!(last, 500);
        assert_eq!(store.current_version(), 500);
    }

    #[test]
    fn dimension_request_publishes_only_on_change() {
        let (store, mut draft) = SnapshotStore::new(Configuration::default());
        let tx = store.request_sender();
        let screen = ScreenMetrics::new(1920, 1080);

        tx.send(DraftRequest::RecalculateDimensions(screen)).unwrap();
        let snap = draft.apply_requests().expect("first recalculation publishes");
        assert_eq!(snap.version(), 1);
        assert_eq!(snap.modes[0].resolved.unwrap().rect.width, 1920);

        tx.send(DraftRequest::RecalculateDimensions(screen)).unwrap();
        assert!(draft.apply_requests().is_none());
        assert_eq!(store.current_version(), 1);
    }
}
