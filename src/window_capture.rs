//! Background thread that captures external windows for the window overlays.

use crate::platform::{GameWindow, WindowPlatform};
use crate::snapshot::{ConfigSnapshot, SnapshotStore};
use crate::triple_buffer::TripleReader;
use crate::window_overlay::{FrameBuffer, OverlayStatus, StepOutcome, WindowOverlayEntry};
use crate::workers::Tick;
use crate::{log_info, log_warn};
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const WINDOW_CAPTURE_INTERVAL: Duration = Duration::from_millis(5);
pub const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Upload half of one overlay's triple buffer, handed to the render thread.
pub struct OverlayFeed {
    pub name: String,
    pub reader: TripleReader<FrameBuffer>,
    pub status: Arc<OverlayStatus>,
}

pub struct WindowCaptureWorker {
    store: Arc<SnapshotStore>,
    platform: Box<dyn WindowPlatform>,
    game_window: Arc<GameWindow>,
    feeds: Sender<OverlayFeed>,
    entries: Vec<WindowOverlayEntry>,
    last_version: Option<u64>,
    last_sweep: Option<Instant>,
}

impl WindowCaptureWorker {
    pub fn new(
        store: Arc<SnapshotStore>,
        platform: Box<dyn WindowPlatform>,
        game_window: Arc<GameWindow>,
        feeds: Sender<OverlayFeed>,
    ) -> Self {
        Self {
            store,
            platform,
            game_window,
            feeds,
            entries: Vec::new(),
            last_version: None,
            last_sweep: None,
        }
    }

    pub fn entry(&self, name: &str) -> Option<&WindowOverlayEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn sync_entries(&mut self, snapshot: &ConfigSnapshot) {
        let search_interval = Duration::from_millis(snapshot.window_search_interval_ms);
        let log_search = snapshot.debug.log_window_search;

        let before = self.entries.len();
        self.entries
            .retain(|entry| snapshot.window_overlay(entry.name()).is_some());
        if self.entries.len() != before {
            log_info!("Removed {} window overlay(s)", before - self.entries.len());
        }

        for config in &snapshot.window_overlays {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.name() == config.name) {
                if entry.config() != config {
                    entry.apply_config(config.clone());
                }
                entry.set_search_interval(search_interval);
                entry.set_log_search(log_search);
                continue;
            }

            let (mut entry, reader) = WindowOverlayEntry::new(config.clone(), search_interval);
            entry.set_log_search(log_search);
            let feed = OverlayFeed {
                name: config.name.clone(),
                reader,
                status: Arc::clone(entry.status()),
            };
            if self.feeds.send(feed).is_err() {
                log_warn!("Render side is gone; window overlay '{}' will not be shown", config.name);
            }
            log_info!("Added window overlay '{}'", config.name);
            self.entries.push(entry);
        }
    }
}

impl Tick for WindowCaptureWorker {
    fn tick(&mut self, now: Instant) {
        let snapshot = self.store.snapshot();
        if self.last_version != Some(snapshot.version()) {
            self.sync_entries(&snapshot);
            self.last_version = Some(snapshot.version());
        }

        let sweep_due = self
            .last_sweep
            .map_or(true, |last| now.saturating_duration_since(last) >= LIVENESS_SWEEP_INTERVAL);
        if sweep_due {
            self.last_sweep = Some(now);
            for entry in &mut self.entries {
                entry.revalidate(self.platform.as_ref());
            }
        }

        let game_window = self.game_window.get();
        let log_timing = snapshot.debug.log_capture_timing;
        for entry in &mut self.entries {
            let started = Instant::now();
            let outcome = entry.step(self.platform.as_mut(), game_window, now);
            if log_timing && outcome == StepOutcome::Captured {
                log_info!("Captured window overlay '{}' in {:?}", entry.name(), started.elapsed());
            }
        }
    }

    fn shutdown(&mut self) {
        self.entries.clear();
    }
}
