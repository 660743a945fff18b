//! Owns every shared service object and the worker threads that drive them.

use crate::config::Configuration;
use crate::derived::DerivedCaches;
use crate::error::HostError;
use crate::frame_exchange::{frame_channel, GpuFrameExchange};
use crate::gpu::GpuTimeline;
use crate::logic::{LogicWorker, PendingChange, LOGIC_INTERVAL};
use crate::mirror_capture::{MirrorCaptureWorker, MIRROR_CAPTURE_INTERVAL};
use crate::platform::{GameWindow, ScreenSource, WindowPlatform};
use crate::render::RenderSide;
use crate::snapshot::{ConfigDraft, SnapshotStore};
use crate::window_capture::{WindowCaptureWorker, WINDOW_CAPTURE_INTERVAL};
use crate::workers::{spawn_ticking, TickStats, WorkerHandle};
use crate::log_info;
use crossbeam_channel::{unbounded, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Platform and GPU collaborators the host's threads run against.
pub struct HostBackends {
    pub screen: Box<dyn ScreenSource>,
    pub windows: Box<dyn WindowPlatform>,
    /// Fence timeline of the render thread's GPU device.
    pub timeline: Arc<dyn GpuTimeline>,
    /// Shared with `screen` when it reads the game window's client area.
    pub game_window: Arc<GameWindow>,
}

#[derive(Debug, Clone, Copy)]
pub struct HostOptions {
    pub capture_queue_capacity: usize,
    pub logic_interval: Duration,
    pub mirror_capture_interval: Duration,
    pub window_capture_interval: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            capture_queue_capacity: 4,
            logic_interval: LOGIC_INTERVAL,
            mirror_capture_interval: MIRROR_CAPTURE_INTERVAL,
            window_capture_interval: WINDOW_CAPTURE_INTERVAL,
        }
    }
}

pub struct OverlayHost {
    store: Arc<SnapshotStore>,
    caches: Arc<DerivedCaches>,
    exchange: Arc<GpuFrameExchange>,
    game_window: Arc<GameWindow>,
    changes: Sender<PendingChange>,
    /// Stop order: window capture, mirror capture, logic.
    workers: Vec<WorkerHandle>,
}

impl OverlayHost {
    /// Starts the worker threads. The returned draft belongs to the editing
    /// thread and the render side to the render thread.
    pub fn start(initial: Configuration, backends: HostBackends) -> Result<(Self, ConfigDraft, RenderSide), HostError> {
        Self::start_with(initial, backends, HostOptions::default())
    }

    pub fn start_with(
        initial: Configuration,
        backends: HostBackends,
        options: HostOptions,
    ) -> Result<(Self, ConfigDraft, RenderSide), HostError> {
        let log_timing = initial.debug.log_capture_timing;
        let (store, draft) = SnapshotStore::new(initial);
        let caches = Arc::new(DerivedCaches::new());
        let exchange = Arc::new(GpuFrameExchange::new());
        let game_window = backends.game_window;
        let (change_tx, change_rx) = unbounded();
        let (feed_tx, feed_rx) = unbounded();

        let (producer, consumer) = frame_channel(
            Arc::clone(&exchange),
            backends.timeline,
            options.capture_queue_capacity,
        );
        let render = RenderSide::new(Arc::clone(&store), Arc::clone(&caches), producer, feed_rx);

        let mut workers = Vec::with_capacity(3);
        workers.push(spawn_ticking(
            "window-capture",
            options.window_capture_interval,
            WindowCaptureWorker::new(Arc::clone(&store), backends.windows, Arc::clone(&game_window), feed_tx),
        )?);
        workers.push(spawn_ticking(
            "mirror-capture",
            options.mirror_capture_interval,
            MirrorCaptureWorker::new(consumer, Arc::clone(&exchange), log_timing),
        )?);
        workers.push(spawn_ticking(
            "logic",
            options.logic_interval,
            LogicWorker::new(Arc::clone(&store), Arc::clone(&caches), backends.screen, change_rx),
        )?);

        log_info!("Overlay host started");
        let host = Self {
            store,
            caches,
            exchange,
            game_window,
            changes: change_tx,
            workers,
        };
        Ok((host, draft, render))
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn caches(&self) -> &Arc<DerivedCaches> {
        &self.caches
    }

    pub fn exchange(&self) -> &Arc<GpuFrameExchange> {
        &self.exchange
    }

    pub fn game_window(&self) -> &Arc<GameWindow> {
        &self.game_window
    }

    pub fn change_sender(&self) -> Sender<PendingChange> {
        self.changes.clone()
    }

    pub fn switch_mode(&self, mode: &str, animate: bool) {
        let _ = self.changes.send(PendingChange::SwitchMode {
            mode: mode.to_string(),
            animate,
        });
    }

    pub fn hotkey_pressed(&self, keys: &str) {
        let _ = self.changes.send(PendingChange::HotkeyPressed(keys.to_string()));
    }

    pub fn mode_dimensions_changed(&self, mode: &str) {
        let _ = self.changes.send(PendingChange::ModeDimensionsChanged(mode.to_string()));
    }

    pub fn worker_stats(&self) -> Vec<(String, Option<TickStats>)> {
        self.workers
            .iter()
            .map(|w| (w.name().to_string(), w.stats()))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.workers.iter().any(WorkerHandle::is_running)
    }

    /// Joins every worker. The capture textures are freed by the render side
    /// on its next frame or in [`RenderSide::shutdown`].
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for worker in &mut self.workers {
            worker.stop();
        }
        self.workers.clear();
        log_info!("Overlay host stopped");
    }
}

impl Drop for OverlayHost {
    fn drop(&mut self) {
        self.stop();
    }
}
