//! The ~60 Hz logic thread: owns mode state and refreshes the derived caches.

use crate::config::{Rect, ScreenMetrics};
use crate::derived::{
    DerivedCaches, NameIndex, SecondaryModes, ViewportMode, SCREEN_REFRESH_INTERVAL, VIEWPORT_REFRESH_INTERVAL,
};
use crate::platform::ScreenSource;
use crate::snapshot::{ConfigSnapshot, DraftRequest, SnapshotStore};
use crate::transition::{ModeTransition, ViewportTransitionSnapshot};
use crate::workers::Tick;
use crate::{log_info, log_warn};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const LOGIC_INTERVAL: Duration = Duration::from_micros(16_667);

/// Structural changes queued for the logic thread by other threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingChange {
    SwitchMode { mode: String, animate: bool },
    /// Raw key combination as configured in a [`HotkeyBinding`](crate::config::HotkeyBinding).
    HotkeyPressed(String),
    /// The named mode's dimensions were edited and republished.
    ModeDimensionsChanged(String),
}

pub struct LogicWorker {
    store: Arc<SnapshotStore>,
    caches: Arc<DerivedCaches>,
    screen_source: Box<dyn ScreenSource>,
    changes: Receiver<PendingChange>,
    draft_requests: Sender<DraftRequest>,

    current_mode: String,
    transition: Option<ModeTransition>,
    secondary: HashMap<String, bool>,
    secondary_dirty: bool,
    name_index: Option<NameIndex>,

    last_version: Option<u64>,
    last_screen_check: Option<Instant>,
    last_viewport_refresh: Option<Instant>,
    requested_recalculation: Option<(ScreenMetrics, u64)>,
    force_viewport: bool,
}

impl LogicWorker {
    pub fn new(
        store: Arc<SnapshotStore>,
        caches: Arc<DerivedCaches>,
        screen_source: Box<dyn ScreenSource>,
        changes: Receiver<PendingChange>,
    ) -> Self {
        let current_mode = store.snapshot().default_mode.clone();
        let draft_requests = store.request_sender();
        Self {
            store,
            caches,
            screen_source,
            changes,
            draft_requests,
            current_mode,
            transition: None,
            secondary: HashMap::new(),
            secondary_dirty: true,
            name_index: None,
            last_version: None,
            last_screen_check: None,
            last_viewport_refresh: None,
            requested_recalculation: None,
            force_viewport: true,
        }
    }

    pub fn current_mode(&self) -> &str {
        &self.current_mode
    }

    pub fn transition_active(&self) -> bool {
        self.transition.is_some()
    }

    fn refresh_screen(&mut self, now: Instant) -> bool {
        let dirty = self.caches.take_screen_dirty();
        let due = self
            .last_screen_check
            .map_or(true, |last| now.saturating_duration_since(last) >= SCREEN_REFRESH_INTERVAL);
        if !dirty && !due {
            return false;
        }
        self.last_screen_check = Some(now);

        let Some(size) = self.screen_source.screen_size() else {
            return false;
        };

        let changed = self.caches.screen.read().map(|s| *s) != Some(size);
        if changed {
            log_info!("Screen metrics now {}x{}", size.width, size.height);
            self.caches.screen.refresh(size);
        }

        changed
    }

    /// Asks the draft owner to recompute mode geometry once per stale
    /// (screen, version) pair.
    fn request_recalculation(&mut self, snapshot: &ConfigSnapshot, screen: ScreenMetrics) {
        let stale = snapshot
            .modes
            .iter()
            .any(|mode| mode.resolved.map(|r| r.screen) != Some(screen));
        let key = (screen, snapshot.version());
        if stale && self.requested_recalculation != Some(key) {
            if self.draft_requests.send(DraftRequest::RecalculateDimensions(screen)).is_ok() {
                self.requested_recalculation = Some(key);
            }
        }
    }

    fn displayed_rect(&self, snapshot: &ConfigSnapshot, screen: ScreenMetrics) -> Rect {
        match &self.transition {
            Some(transition) => transition.current_rect(),
            None => ViewportMode::compute(snapshot, &self.current_mode, screen).rect,
        }
    }

    fn switch_mode(&mut self, snapshot: &ConfigSnapshot, screen: ScreenMetrics, mode: &str, animate: bool, now: Instant) {
        if snapshot.mode(mode).is_none() {
            log_warn!("Ignoring switch to unknown mode '{}'", mode);
            return;
        }
        if mode == self.current_mode && self.transition.is_none() {
            return;
        }

        let from = self.displayed_rect(snapshot, screen);
        let to = ViewportMode::compute(snapshot, mode, screen).rect;
        let duration = if animate {
            Duration::from_millis(snapshot.transition.duration_ms)
        } else {
            Duration::ZERO
        };

        log_info!("Switching mode '{}' -> '{}' ({:?})", self.current_mode, mode, duration);
        self.transition = Some(ModeTransition::start(
            self.current_mode.clone(),
            from,
            mode,
            to,
            now,
            duration,
            snapshot.transition.easing,
        ));
        self.current_mode = mode.to_string();
        self.force_viewport = true;
    }

    fn drain_changes(&mut self, snapshot: &ConfigSnapshot, screen: ScreenMetrics, now: Instant) {
        while let Ok(change) = self.changes.try_recv() {
            match change {
                PendingChange::SwitchMode { mode, animate } => {
                    self.switch_mode(snapshot, screen, &mode, animate, now);
                }
                PendingChange::HotkeyPressed(keys) => {
                    let Some(binding) = snapshot.hotkey(&keys) else {
                        log_warn!("No binding for hotkey '{}'", keys);
                        continue;
                    };
                    let target = match &binding.secondary_mode {
                        Some(secondary) => {
                            let toggled = self.secondary.entry(keys.clone()).or_insert(false);
                            *toggled = !*toggled;
                            self.secondary_dirty = true;
                            if *toggled {
                                secondary.clone()
                            } else {
                                binding.mode.clone()
                            }
                        }
                        None => binding.mode.clone(),
                    };
                    self.switch_mode(snapshot, screen, &target, true, now);
                }
                PendingChange::ModeDimensionsChanged(mode) => {
                    let rect = ViewportMode::compute(snapshot, &mode, screen).rect;
                    if let Some(transition) = self.transition.as_mut().filter(|t| t.to_mode() == mode) {
                        transition.retarget(rect);
                    }
                    if mode == self.current_mode {
                        self.force_viewport = true;
                    }
                }
            }
        }
    }

    fn refresh_viewport(&mut self, snapshot: &ConfigSnapshot, screen: ScreenMetrics, version_changed: bool, screen_changed: bool, now: Instant) {
        let periodic = self
            .last_viewport_refresh
            .map_or(true, |last| now.saturating_duration_since(last) >= VIEWPORT_REFRESH_INTERVAL);
        if !(version_changed || screen_changed || self.force_viewport || periodic) {
            return;
        }
        self.force_viewport = false;
        self.last_viewport_refresh = Some(now);

        let viewport = ViewportMode::compute(snapshot, &self.current_mode, screen);
        if let Some(transition) = self.transition.as_mut() {
            if transition.target() != viewport.rect {
                transition.retarget(viewport.rect);
            }
        }
        if self.caches.viewport.read().as_deref() != Some(&viewport) {
            self.caches.viewport.refresh(viewport);
        }
    }

    fn refresh_active_mirrors(&mut self, snapshot: &ConfigSnapshot) {
        let index = match self.name_index.take() {
            Some(index) if index.version() == snapshot.version() => index,
            _ => NameIndex::build(snapshot),
        };
        let active = index.active_mirrors(snapshot, &self.current_mode);
        self.name_index = Some(index);

        if self.caches.active_mirrors.read().as_deref() != Some(&active) {
            self.caches.active_mirrors.refresh(active);
        }
    }

    fn refresh_secondary_modes(&mut self, snapshot: &ConfigSnapshot, version_changed: bool) {
        if version_changed {
            let before = self.secondary.len();
            self.secondary
                .retain(|keys, _| snapshot.hotkey(keys).is_some_and(|b| b.secondary_mode.is_some()));
            self.secondary_dirty |= before != self.secondary.len();
        }
        if self.secondary_dirty {
            self.secondary_dirty = false;
            self.caches.secondary_modes.refresh(SecondaryModes {
                toggled: self.secondary.clone(),
            });
        }
    }

    fn advance_transition(&mut self, snapshot: &ConfigSnapshot, screen: ScreenMetrics, now: Instant) {
        let published = match self.transition.as_mut() {
            Some(transition) => {
                transition.advance(now);
                transition.snapshot()
            }
            None => ViewportTransitionSnapshot::idle(
                &self.current_mode,
                ViewportMode::compute(snapshot, &self.current_mode, screen).rect,
            ),
        };

        if self.transition.as_ref().is_some_and(|t| t.is_complete()) {
            self.transition = None;
        }
        if self.caches.transition.read().as_deref() != Some(&published) {
            self.caches.transition.refresh(published);
        }
    }
}

impl Tick for LogicWorker {
    fn tick(&mut self, now: Instant) {
        let snapshot = self.store.snapshot();
        let version_changed = self.last_version != Some(snapshot.version());

        let screen_changed = self.refresh_screen(now);
        let Some(screen) = self.caches.screen.read().map(|s| *s) else {
            return;
        };
        if version_changed || screen_changed {
            self.request_recalculation(&snapshot, screen);
        }

        if version_changed && snapshot.mode(&self.current_mode).is_none() {
            log_warn!("Mode '{}' was removed, falling back to '{}'", self.current_mode, snapshot.default_mode);
            self.current_mode = snapshot.default_mode.clone();
            self.transition = None;
            self.force_viewport = true;
        }

        self.drain_changes(&snapshot, screen, now);
        self.refresh_viewport(&snapshot, screen, version_changed, screen_changed, now);
        self.refresh_active_mirrors(&snapshot);
        self.refresh_secondary_modes(&snapshot, version_changed);
        self.advance_transition(&snapshot, screen, now);

        self.last_version = Some(snapshot.version());
    }
}
