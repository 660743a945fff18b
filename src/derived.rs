//! Derived state computed by the logic thread and read lock-free elsewhere.

use crate::config::{Rect, ScreenMetrics};
use crate::double_buffer::DoubleBuffer;
use crate::snapshot::ConfigSnapshot;
use crate::transition::ViewportTransitionSnapshot;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SCREEN_REFRESH_INTERVAL: Duration = Duration::from_millis(250);
pub const VIEWPORT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewportMode {
    pub mode_id: String,
    pub rect: Rect,
    pub screen: ScreenMetrics,
    pub config_version: u64,
}

impl ViewportMode {
    /// Falls back to the full screen when `mode_id` is not configured.
    pub fn compute(snapshot: &ConfigSnapshot, mode_id: &str, screen: ScreenMetrics) -> Self {
        let rect = snapshot
            .mode(mode_id)
            .map(|mode| mode.geometry_for(screen))
            .unwrap_or(Rect {
                x: 0,
                y: 0,
                width: screen.width,
                height: screen.height,
            });
        Self {
            mode_id: mode_id.to_string(),
            rect,
            screen,
            config_version: snapshot.version(),
        }
    }
}

/// Indices into the snapshot's `mirrors` that the mode shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMirrors {
    pub mode_id: String,
    pub indices: Vec<usize>,
    pub config_version: u64,
}

/// Name → position maps for one configuration version.
#[derive(Debug, Default)]
pub struct NameIndex {
    version: u64,
    mirrors: HashMap<String, usize>,
}

impl NameIndex {
    pub fn build(snapshot: &ConfigSnapshot) -> Self {
        let mut mirrors = HashMap::with_capacity(snapshot.mirrors.len());
        for (i, mirror) in snapshot.mirrors.iter().enumerate() {
            // First definition wins on duplicate names.
            mirrors.entry(mirror.name.clone()).or_insert(i);
        }
        Self {
            version: snapshot.version(),
            mirrors,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn active_mirrors(&self, snapshot: &ConfigSnapshot, mode_id: &str) -> ActiveMirrors {
        let mut seen = HashSet::new();
        let indices = snapshot
            .mode(mode_id)
            .map(|mode| {
                mode.mirrors
                    .iter()
                    .filter_map(|name| self.mirrors.get(name).copied())
                    .filter(|&i| snapshot.mirrors[i].enabled && seen.insert(i))
                    .collect()
            })
            .unwrap_or_default();
        ActiveMirrors {
            mode_id: mode_id.to_string(),
            indices,
            config_version: snapshot.version(),
        }
    }
}

/// Hotkeys currently toggled to their secondary mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecondaryModes {
    pub toggled: HashMap<String, bool>,
}

impl SecondaryModes {
    pub fn is_secondary(&self, keys: &str) -> bool {
        self.toggled.get(keys).copied().unwrap_or(false)
    }
}

pub struct DerivedCaches {
    pub screen: DoubleBuffer<ScreenMetrics>,
    pub viewport: DoubleBuffer<ViewportMode>,
    pub active_mirrors: DoubleBuffer<ActiveMirrors>,
    pub secondary_modes: DoubleBuffer<SecondaryModes>,
    pub transition: DoubleBuffer<ViewportTransitionSnapshot>,
    screen_dirty: AtomicBool,
}

impl Default for DerivedCaches {
    fn default() -> Self {
        Self::new()
    }
}

impl DerivedCaches {
    pub fn new() -> Self {
        Self {
            screen: DoubleBuffer::new(),
            viewport: DoubleBuffer::new(),
            active_mirrors: DoubleBuffer::new(),
            secondary_modes: DoubleBuffer::new(),
            transition: DoubleBuffer::new(),
            screen_dirty: AtomicBool::new(true),
        }
    }

    /// Asks the logic thread to re-read screen metrics on its next tick.
    pub fn invalidate_screen(&self) {
        self.screen_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn take_screen_dirty(&self) -> bool {
        self.screen_dirty.swap(false, Ordering::AcqRel)
    }

    pub fn screen_or(&self, measure: impl FnOnce() -> ScreenMetrics) -> ScreenMetrics {
        *self.screen.read_or_init(measure)
    }

    /// Current viewport. Before the logic thread's first refresh this computes
    /// the default mode directly from `snapshot` and seeds the cache.
    pub fn viewport_or_compute(&self, snapshot: &ConfigSnapshot, screen: ScreenMetrics) -> Arc<ViewportMode> {
        self.viewport
            .read_or_init(|| ViewportMode::compute(snapshot, &snapshot.default_mode, screen))
    }

    pub fn active_mirrors_or_compute(&self, snapshot: &ConfigSnapshot) -> Arc<ActiveMirrors> {
        self.active_mirrors.read_or_init(|| {
            NameIndex::build(snapshot).active_mirrors(snapshot, &snapshot.default_mode)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, Dimension, MirrorConfig, ModeConfig};
    use crate::snapshot::SnapshotStore;

    fn mirror(name: &str, enabled: bool) -> MirrorConfig {
        MirrorConfig {
            name: name.to_string(),
            source: Rect::default(),
            output: Default::default(),
            color_key: None,
            enabled,
        }
    }

    fn sample_config() -> Configuration {
        let mut cfg = Configuration::default();
        let mut thin = ModeConfig::new("thin");
        thin.width = Dimension::Pixels(300);
        thin.x = Dimension::Percent(50.0);
        thin.mirrors = vec!["pie".into(), "missing".into(), "off".into(), "pie".into(), "map".into()];
        cfg.modes.push(thin);
        cfg.mirrors = vec![mirror("map", true), mirror("pie", true), mirror("off", false)];
        cfg
    }

    #[test]
    fn active_mirrors_resolve_by_name_and_skip_disabled() {
        let (store, _draft) = SnapshotStore::new(sample_config());
        let snap = store.snapshot();
        let index = NameIndex::build(&snap);
        let active = index.active_mirrors(&snap, "thin");
        assert_eq!(active.indices, vec![1, 0]);
        assert!(index.active_mirrors(&snap, "nope").indices.is_empty());
    }

    #[test]
    fn viewport_falls_back_to_direct_computation() {
        let (store, _draft) = SnapshotStore::new(sample_config());
        let snap = store.snapshot();
        let caches = DerivedCaches::new();
        let screen = ScreenMetrics::new(1920, 1080);

        let viewport = caches.viewport_or_compute(&snap, screen);
        assert_eq!(viewport.mode_id, "fullscreen");
        assert_eq!(viewport.rect.width, 1920);
        assert_eq!(caches.viewport.generation(), 1);

        let thin = ViewportMode::compute(&snap, "thin", screen);
        assert_eq!(thin.rect.x, 960);
        assert_eq!(thin.rect.width, 300);
        assert_eq!(thin.rect.height, 1080);
    }

    #[test]
    fn screen_starts_dirty() {
        let caches = DerivedCaches::new();
        assert!(caches.take_screen_dirty());
        assert!(!caches.take_screen_dirty());
        caches.invalidate_screen();
        assert!(caches.take_screen_dirty());
    }
}
