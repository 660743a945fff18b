//! Work the host does on the render thread, once per presented frame.

use crate::config::ScreenMetrics;
use crate::derived::{ActiveMirrors, DerivedCaches, ViewportMode};
use crate::frame_exchange::{ExchangeStatsSnapshot, FrameProducer, ReadyFrame, SubmitOutcome};
use crate::gpu::{GpuTimeline, RenderGpu, TextureId, TextureUsage};
use crate::snapshot::{ConfigSnapshot, SnapshotStore};
use crate::transition::ViewportTransitionSnapshot;
use crate::window_capture::OverlayFeed;
use crate::{log_info, log_warn};
use crossbeam_channel::Receiver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Longest the render thread waits on a fallback frame's fence.
pub const FALLBACK_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayTexture {
    pub texture: TextureId,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub error: bool,
}

struct UploadedOverlay {
    feed: OverlayFeed,
    texture: Option<OverlayTexture>,
}

/// Everything the draw code needs for one frame.
pub struct FramePlan {
    pub snapshot: Arc<ConfigSnapshot>,
    pub viewport: Arc<ViewportMode>,
    pub active_mirrors: Arc<ActiveMirrors>,
    pub transition: Option<Arc<ViewportTransitionSnapshot>>,
    pub game_frame: Option<ReadyFrame>,
    pub submit: SubmitOutcome,
    pub uploads: usize,
    /// Window overlays to draw for the viewport's mode.
    pub overlays: Vec<(String, OverlayTexture)>,
    /// Present when the configuration asks for on-screen capture stats.
    pub capture_stats: Option<ExchangeStatsSnapshot>,
}

pub struct RenderSide {
    store: Arc<SnapshotStore>,
    caches: Arc<DerivedCaches>,
    producer: FrameProducer,
    feeds: Receiver<OverlayFeed>,
    overlays: HashMap<String, UploadedOverlay>,
    last_backbuffer: Option<(u32, u32)>,
    timeline: Option<Arc<dyn GpuTimeline>>,
}

impl RenderSide {
    pub fn new(
        store: Arc<SnapshotStore>,
        caches: Arc<DerivedCaches>,
        producer: FrameProducer,
        feeds: Receiver<OverlayFeed>,
    ) -> Self {
        Self {
            store,
            caches,
            producer,
            feeds,
            overlays: HashMap::new(),
            last_backbuffer: None,
            timeline: None,
        }
    }

    pub fn overlay_texture(&self, name: &str) -> Option<OverlayTexture> {
        self.overlays.get(name).and_then(|o| o.texture)
    }

    pub fn overlay_count(&self) -> usize {
        self.overlays.len()
    }

    /// Swap-buffers hook. Never blocks on another thread's lock beyond the
    /// triple buffer's swap.
    pub fn on_swap_buffers(&mut self, gpu: &mut dyn RenderGpu) -> FramePlan {
        let snapshot = self.store.snapshot();
        let timeline = Arc::clone(self.timeline.get_or_insert_with(|| gpu.timeline()));

        let backbuffer = gpu.backbuffer_size();
        if backbuffer != self.last_backbuffer {
            if let (Some(old), Some(new)) = (self.last_backbuffer, backbuffer) {
                log_info!("Back buffer {}x{} -> {}x{}", old.0, old.1, new.0, new.1);
            }
            self.last_backbuffer = backbuffer;
            self.caches.invalidate_screen();
        }

        let submit = self.producer.submit(gpu);
        let uploads = self.service_overlays(gpu, &snapshot);

        let screen = self.caches.screen_or(|| {
            let (width, height) = backbuffer.unwrap_or((1, 1));
            ScreenMetrics::new(width, height)
        });
        let viewport = self.caches.viewport_or_compute(&snapshot, screen);
        let active_mirrors = self.caches.active_mirrors_or_compute(&snapshot);
        let transition = self.caches.transition.read();
        let game_frame = self
            .producer
            .exchange()
            .frame_for_sampling(timeline.as_ref(), FALLBACK_WAIT);
        let overlays = self.visible_overlays(&snapshot, &viewport.mode_id);
        let capture_stats = snapshot
            .debug
            .show_capture_stats
            .then(|| self.producer.exchange().stats());

        FramePlan {
            snapshot,
            viewport,
            active_mirrors,
            transition,
            game_frame,
            submit,
            uploads,
            overlays,
            capture_stats,
        }
    }

    fn service_overlays(&mut self, gpu: &mut dyn RenderGpu, snapshot: &ConfigSnapshot) -> usize {
        while let Ok(feed) = self.feeds.try_recv() {
            let name = feed.name.clone();
            if let Some(old) = self.overlays.insert(name, UploadedOverlay { feed, texture: None }) {
                if let Some(texture) = old.texture {
                    gpu.release_texture(texture.texture);
                }
            }
        }

        let mut removed = Vec::new();
        let mut uploads = 0;
        for (name, overlay) in self.overlays.iter_mut() {
            // Only the capture side ends an overlay. A feed can arrive before
            // this thread sees the snapshot that configured it.
            if !overlay.feed.reader.writer_alive() {
                removed.push(name.clone());
                continue;
            }
            if !snapshot.window_overlay(name).is_some_and(|o| o.enabled) {
                continue;
            }

            let Some(frame) = overlay.feed.reader.take() else {
                continue;
            };
            if frame.is_empty() {
                continue;
            }

            let texture = match overlay.texture {
                Some(t) if t.width == frame.width && t.height == frame.height => t.texture,
                existing => {
                    if let Some(old) = existing {
                        gpu.release_texture(old.texture);
                    }
                    overlay.texture = None;
                    match gpu.create_texture(frame.width, frame.height, TextureUsage::Upload) {
                        Ok(id) => id,
                        Err(e) => {
                            log_warn!("Overlay '{}' texture creation failed: {}", name, e);
                            continue;
                        }
                    }
                }
            };

            match gpu.write_texture(texture, frame.width, frame.height, &frame.pixels) {
                Ok(()) => {
                    overlay.texture = Some(OverlayTexture {
                        texture,
                        width: frame.width,
                        height: frame.height,
                        sequence: frame.sequence,
                        error: frame.error,
                    });
                    uploads += 1;
                }
                Err(e) => {
                    log_warn!("Overlay '{}' upload failed: {}", name, e);
                    gpu.release_texture(texture);
                    overlay.texture = None;
                }
            }
        }

        for name in removed {
            if let Some(texture) = self.overlays.remove(&name).and_then(|o| o.texture) {
                gpu.release_texture(texture.texture);
            }
        }
        uploads
    }

    /// Enabled overlays listed by `mode_id` that have a texture, in the mode's order.
    fn visible_overlays(&self, snapshot: &ConfigSnapshot, mode_id: &str) -> Vec<(String, OverlayTexture)> {
        let Some(mode) = snapshot.mode(mode_id) else {
            return Vec::new();
        };
        mode.window_overlays
            .iter()
            .filter(|name| snapshot.window_overlay(name).is_some_and(|o| o.enabled))
            .filter_map(|name| self.overlay_texture(name).map(|t| (name.clone(), t)))
            .collect()
    }

    /// Frees every GPU resource this side created. Call on the render thread
    /// before the context goes away.
    pub fn shutdown(&mut self, gpu: &mut dyn RenderGpu) {
        self.producer.release_resources(gpu);
        for (_, overlay) in self.overlays.drain() {
            if let Some(texture) = overlay.texture {
                gpu.release_texture(texture.texture);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, WindowOverlayConfig};
    use crate::frame_exchange::{frame_channel, GpuFrameExchange};
    use crate::gpu::HeadlessGpu;
    use crate::triple_buffer::triple_buffer;
    use crate::platform::{FakeDesktop, GameWindow};
    use crate::window_capture::WindowCaptureWorker;
    use crate::window_overlay::{FrameBuffer, OverlayStatus};
    use crate::workers::Tick;
    use crossbeam_channel::unbounded;
    use std::time::Instant;

    fn solid(width: u32, height: u32, sequence: u64) -> FrameBuffer {
        FrameBuffer {
            width,
            height,
            pixels: vec![7; (width * height * 4) as usize],
            sequence,
            error: false,
        }
    }

    #[test]
    fn uploads_fresh_overlay_frames_once() {
        let mut cfg = Configuration::default();
        cfg.window_overlays.push(WindowOverlayConfig::new("chat"));
        let (store, _draft) = crate::snapshot::SnapshotStore::new(cfg);
        let caches = Arc::new(DerivedCaches::new());
        let mut gpu = HeadlessGpu::new(320, 240);
        let exchange = Arc::new(GpuFrameExchange::new());
        let (producer, mut consumer) = frame_channel(Arc::clone(&exchange), gpu.timeline(), 2);
        let (feed_tx, feed_rx) = unbounded();
        let mut render = RenderSide::new(store, Arc::clone(&caches), producer, feed_rx);

        let (mut writer, reader) = triple_buffer::<FrameBuffer>();
        feed_tx
            .send(OverlayFeed {
                name: "chat".into(),
                reader,
                status: Arc::new(OverlayStatus::default()),
            })
            .unwrap();

        *writer.buffer_mut() = solid(16, 8, 1);
        writer.publish();

        let plan = render.on_swap_buffers(&mut gpu);
        assert!(matches!(plan.submit, SubmitOutcome::Submitted(_)));
        assert_eq!(plan.uploads, 1);
        assert_eq!(plan.viewport.rect.width, 320);
        let uploaded = render.overlay_texture("chat").unwrap();
        assert_eq!((uploaded.width, uploaded.height, uploaded.sequence), (16, 8, 1));

        consumer.poll(Duration::from_millis(5));
        let plan = render.on_swap_buffers(&mut gpu);
        assert_eq!(plan.uploads, 0);
        assert!(plan.game_frame.is_some());

        drop(writer);
        render.on_swap_buffers(&mut gpu);
        assert_eq!(render.overlay_count(), 0);

        render.shutdown(&mut gpu);
        assert_eq!(gpu.live_textures(), 0);
    }

    #[test]
    fn backbuffer_resize_flags_screen_dirty() {
        let (store, _draft) = crate::snapshot::SnapshotStore::new(Configuration::default());
        let caches = Arc::new(DerivedCaches::new());
        let mut gpu = HeadlessGpu::new(640, 480);
        let exchange = Arc::new(GpuFrameExchange::new());
        let (producer, _consumer) = frame_channel(Arc::clone(&exchange), gpu.timeline(), 2);
        let (_feed_tx, feed_rx) = unbounded();
        let mut render = RenderSide::new(store, Arc::clone(&caches), producer, feed_rx);

        render.on_swap_buffers(&mut gpu);
        assert!(caches.take_screen_dirty());
        render.on_swap_buffers(&mut gpu);
        assert!(!caches.take_screen_dirty());

        gpu.resize_backbuffer(800, 600);
        render.on_swap_buffers(&mut gpu);
        assert!(caches.take_screen_dirty());
    }

    fn render_side(store: Arc<crate::snapshot::SnapshotStore>, gpu: &HeadlessGpu) -> (RenderSide, crossbeam_channel::Sender<OverlayFeed>) {
        let exchange = Arc::new(GpuFrameExchange::new());
        let (producer, _consumer) = frame_channel(exchange, gpu.timeline(), 2);
        let (feed_tx, feed_rx) = unbounded();
        (RenderSide::new(store, Arc::new(DerivedCaches::new()), producer, feed_rx), feed_tx)
    }

    fn chat_config(enabled: bool) -> Configuration {
        let mut cfg = Configuration::default();
        cfg.modes[0].window_overlays.push("chat".into());
        cfg.window_overlays.push(WindowOverlayConfig {
            window_title: "Chat".into(),
            enabled,
            ..WindowOverlayConfig::new("chat")
        });
        cfg
    }

    #[test]
    fn disabled_overlay_comes_back_when_reenabled() {
        let desktop = FakeDesktop::new(1);
        desktop.add_window(10, "Chat", "", "", 2);
        let (store, mut draft) = crate::snapshot::SnapshotStore::new(chat_config(true));
        let mut gpu = HeadlessGpu::new(320, 240);
        let (mut render, feed_tx) = render_side(Arc::clone(&store), &gpu);
        let mut worker =
            WindowCaptureWorker::new(Arc::clone(&store), Box::new(desktop), Arc::new(GameWindow::default()), feed_tx);

        let t0 = Instant::now();
        worker.tick(t0);
        let plan = render.on_swap_buffers(&mut gpu);
        assert_eq!(plan.overlays.len(), 1);

        draft.edit(|cfg| cfg.window_overlays[0].enabled = false);
        draft.publish();
        worker.tick(t0 + Duration::from_millis(5));
        let plan = render.on_swap_buffers(&mut gpu);
        assert!(plan.overlays.is_empty());
        assert_eq!(render.overlay_count(), 1);

        draft.edit(|cfg| cfg.window_overlays[0].enabled = true);
        draft.publish();
        worker.tick(t0 + Duration::from_millis(10));
        let plan = render.on_swap_buffers(&mut gpu);
        assert_eq!(plan.uploads, 1);
        assert_eq!(plan.overlays.len(), 1);
        assert_eq!(plan.overlays[0].0, "chat");
        assert_eq!(render.overlay_texture("chat").unwrap().sequence, 2);
    }

    #[test]
    fn feed_ahead_of_render_snapshot_is_kept_until_configured() {
        let (store, mut draft) = crate::snapshot::SnapshotStore::new(Configuration::default());
        let mut gpu = HeadlessGpu::new(320, 240);
        let (mut render, feed_tx) = render_side(Arc::clone(&store), &gpu);

        let (mut writer, reader) = triple_buffer::<FrameBuffer>();
        feed_tx
            .send(OverlayFeed {
                name: "chat".into(),
                reader,
                status: Arc::new(OverlayStatus::default()),
            })
            .unwrap();
        *writer.buffer_mut() = solid(16, 8, 1);
        writer.publish();

        let plan = render.on_swap_buffers(&mut gpu);
        assert_eq!(plan.uploads, 0);
        assert_eq!(render.overlay_count(), 1);

        draft.replace(chat_config(true));
        draft.publish();
        let plan = render.on_swap_buffers(&mut gpu);
        assert_eq!(plan.uploads, 1);
        assert_eq!(plan.overlays.len(), 1);
    }

    #[test]
    fn plan_lists_only_overlays_of_the_current_mode() {
        let mut cfg = chat_config(true);
        cfg.window_overlays.push(WindowOverlayConfig::new("notes"));
        cfg.debug.show_capture_stats = true;
        let (store, _draft) = crate::snapshot::SnapshotStore::new(cfg);
        let mut gpu = HeadlessGpu::new(320, 240);
        let (mut render, feed_tx) = render_side(store, &gpu);

        let mut writers = Vec::new();
        for name in ["chat", "notes"] {
            let (mut writer, reader) = triple_buffer::<FrameBuffer>();
            *writer.buffer_mut() = solid(4, 4, 1);
            writer.publish();
            feed_tx
                .send(OverlayFeed {
                    name: name.into(),
                    reader,
                    status: Arc::new(OverlayStatus::default()),
                })
                .unwrap();
            writers.push(writer);
        }

        let plan = render.on_swap_buffers(&mut gpu);
        assert_eq!(plan.uploads, 2);
        let names: Vec<_> = plan.overlays.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["chat"]);
        assert_eq!(plan.capture_stats.map(|s| s.submitted), Some(1));
    }
}
