//! Ready/fallback game-frame exchange driven by GPU fences.
//!
//! The render thread ([`FrameProducer`]) copies the back buffer into one of two
//! rotating textures and pushes a [`CaptureNotification`]. The mirror-capture
//! thread ([`FrameConsumer`]) waits on the fence and only then exposes the
//! texture as the ready frame. Readers that find no ready frame may take the
//! latest submitted one, but must wait on its fence themselves.

use crate::capture_queue::{CaptureNotification, CaptureReceiver, CaptureSender};
use crate::error::GpuError;
use crate::gpu::{FenceValue, FenceWait, GpuTimeline, RenderGpu, TextureId, TextureUsage};
use crate::{log_error, log_info, log_warn};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A finished copy that is safe to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyFrame {
    pub texture: TextureId,
    pub slot: usize,
    pub width: u32,
    pub height: u32,
    pub frame_number: u64,
}

/// The latest submitted copy, possibly still in flight on the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackFrame {
    pub texture: TextureId,
    pub slot: usize,
    pub width: u32,
    pub height: u32,
    pub fence: FenceValue,
    pub frame_number: u64,
}

impl FallbackFrame {
    /// Must succeed before the texture is sampled.
    pub fn wait(&self, timeline: &dyn GpuTimeline, timeout: Duration) -> bool {
        timeline.wait(self.fence, timeout) == FenceWait::Signaled
    }
}

#[derive(Debug, Default)]
pub struct ExchangeStats {
    pub submitted: AtomicU64,
    pub skipped_busy: AtomicU64,
    pub skipped_full: AtomicU64,
    pub finalized: AtomicU64,
    pub device_lost: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStatsSnapshot {
    pub submitted: u64,
    pub skipped_busy: u64,
    pub skipped_full: u64,
    pub finalized: u64,
    pub device_lost: u64,
}

impl ExchangeStats {
    pub fn snapshot(&self) -> ExchangeStatsSnapshot {
        ExchangeStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            skipped_busy: self.skipped_busy.load(Ordering::Relaxed),
            skipped_full: self.skipped_full.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
            device_lost: self.device_lost.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct GpuFrameExchange {
    ready: ArcSwapOption<ReadyFrame>,
    fallback: Mutex<Option<FallbackFrame>>,
    /// Set from submission until the consumer has finalized or dropped the frame.
    outstanding: AtomicBool,
    teardown_requested: AtomicBool,
    stats: ExchangeStats,
}

impl GpuFrameExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never blocks.
    pub fn ready_frame(&self) -> Option<ReadyFrame> {
        self.ready.load().as_deref().copied()
    }

    pub fn ready_texture(&self) -> Option<TextureId> {
        self.ready_frame().map(|f| f.texture)
    }

    pub fn ready_width(&self) -> u32 {
        self.ready_frame().map_or(0, |f| f.width)
    }

    pub fn ready_height(&self) -> u32 {
        self.ready_frame().map_or(0, |f| f.height)
    }

    pub fn fallback_frame(&self) -> Option<FallbackFrame> {
        *self.fallback.lock()
    }

    /// The ready frame if there is one, otherwise the fallback after waiting on its fence.
    pub fn frame_for_sampling(&self, timeline: &dyn GpuTimeline, timeout: Duration) -> Option<ReadyFrame> {
        if let Some(ready) = self.ready_frame() {
            return Some(ready);
        }
        let fallback = self.fallback_frame()?;
        fallback.wait(timeline, timeout).then_some(ReadyFrame {
            texture: fallback.texture,
            slot: fallback.slot,
            width: fallback.width,
            height: fallback.height,
            frame_number: fallback.frame_number,
        })
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ExchangeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Asks the render thread to free the capture textures on its next frame.
    pub fn request_teardown(&self) {
        self.teardown_requested.store(true, Ordering::Release);
    }

    pub fn teardown_pending(&self) -> bool {
        self.teardown_requested.load(Ordering::Acquire)
    }

    fn clear_frames(&self) {
        self.ready.store(None);
        *self.fallback.lock() = None;
    }

    fn publish_ready(&self, notification: &CaptureNotification) -> ReadyFrame {
        let frame = ReadyFrame {
            texture: notification.texture,
            slot: notification.slot,
            width: notification.width,
            height: notification.height,
            frame_number: notification.frame_number,
        };
        self.ready.store(Some(Arc::new(frame)));
        frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CaptureTextures {
    ids: [TextureId; 2],
    width: u32,
    height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted(CaptureNotification),
    /// The previous copy has not been finalized yet.
    Busy,
    QueueFull,
    NoBackbuffer,
    Failed,
    TornDown,
}

/// Render-thread half. Owns the two capture textures.
pub struct FrameProducer {
    exchange: Arc<GpuFrameExchange>,
    sender: CaptureSender<CaptureNotification>,
    textures: Option<CaptureTextures>,
    frame_number: u64,
    last_slot: usize,
    torn_down: bool,
}

impl FrameProducer {
    pub fn new(exchange: Arc<GpuFrameExchange>, sender: CaptureSender<CaptureNotification>) -> Self {
        Self {
            exchange,
            sender,
            textures: None,
            frame_number: 0,
            last_slot: 1,
            torn_down: false,
        }
    }

    pub fn exchange(&self) -> &Arc<GpuFrameExchange> {
        &self.exchange
    }

    /// Called once per presented frame. Never waits on the GPU or the consumer.
    pub fn submit(&mut self, gpu: &mut dyn RenderGpu) -> SubmitOutcome {
        if self.exchange.teardown_pending() {
            self.release_resources(gpu);
        }
        if self.torn_down {
            return SubmitOutcome::TornDown;
        }

        if self.exchange.has_outstanding() {
            self.exchange.stats.skipped_busy.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Busy;
        }
        if self.sender.is_full() {
            self.exchange.stats.skipped_full.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::QueueFull;
        }

        let Some((width, height)) = gpu.backbuffer_size() else {
            return SubmitOutcome::NoBackbuffer;
        };

        let textures = match self.ensure_textures(gpu, width, height) {
            Ok(textures) => textures,
            Err(e) => {
                log_error!("Failed to create capture textures ({}x{}): {}", width, height, e);
                return SubmitOutcome::Failed;
            }
        };

        // Never write into the texture the ready frame points at.
        let slot = match self.exchange.ready_frame() {
            Some(ready) => 1 - ready.slot,
            None => 1 - self.last_slot,
        };
        let texture = textures.ids[slot];

        let fence = match gpu.copy_backbuffer(texture) {
            Ok(fence) => fence,
            Err(e) => {
                log_warn!("Back buffer copy failed: {}", e);
                return SubmitOutcome::Failed;
            }
        };

        self.frame_number += 1;
        let notification = CaptureNotification {
            texture,
            fence,
            width,
            height,
            slot,
            frame_number: self.frame_number,
        };

        self.exchange.outstanding.store(true, Ordering::Release);
        if self.sender.push(notification).is_err() {
            self.exchange.outstanding.store(false, Ordering::Release);
            self.exchange.stats.skipped_full.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::QueueFull;
        }

        *self.exchange.fallback.lock() = Some(FallbackFrame {
            texture,
            slot,
            width,
            height,
            fence,
            frame_number: self.frame_number,
        });
        self.last_slot = slot;
        self.exchange.stats.submitted.fetch_add(1, Ordering::Relaxed);
        SubmitOutcome::Submitted(notification)
    }

    fn ensure_textures(&mut self, gpu: &mut dyn RenderGpu, width: u32, height: u32) -> Result<CaptureTextures, GpuError> {
        if let Some(textures) = self.textures {
            if textures.width == width && textures.height == height {
                return Ok(textures);
            }
            log_info!(
                "Back buffer resized {}x{} -> {}x{}, recreating capture textures",
                textures.width, textures.height, width, height
            );
            self.exchange.clear_frames();
            for id in textures.ids {
                gpu.release_texture(id);
            }
            self.textures = None;
        }

        let first = gpu.create_texture(width, height, TextureUsage::Capture)?;
        let second = match gpu.create_texture(width, height, TextureUsage::Capture) {
            Ok(id) => id,
            Err(e) => {
                gpu.release_texture(first);
                return Err(e);
            }
        };

        let textures = CaptureTextures {
            ids: [first, second],
            width,
            height,
        };
        self.textures = Some(textures);
        Ok(textures)
    }

    /// Frees the capture textures. Must run on the thread that owns `gpu`.
    pub fn release_resources(&mut self, gpu: &mut dyn RenderGpu) {
        if self.torn_down {
            return;
        }
        self.exchange.clear_frames();
        if let Some(textures) = self.textures.take() {
            for id in textures.ids {
                gpu.release_texture(id);
            }
            log_info!("Capture textures released");
        }
        self.torn_down = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Idle,
    /// A notification is held but its fence has not signaled yet.
    Pending,
    Finalized(ReadyFrame),
    DeviceLost,
}

/// Mirror-capture-thread half. The only code that waits on capture fences.
pub struct FrameConsumer {
    exchange: Arc<GpuFrameExchange>,
    receiver: CaptureReceiver<CaptureNotification>,
    timeline: Arc<dyn GpuTimeline>,
    pending: Option<CaptureNotification>,
}

impl FrameConsumer {
    pub fn new(
        exchange: Arc<GpuFrameExchange>,
        receiver: CaptureReceiver<CaptureNotification>,
        timeline: Arc<dyn GpuTimeline>,
    ) -> Self {
        Self {
            exchange,
            receiver,
            timeline,
            pending: None,
        }
    }

    /// Takes the next notification (or keeps the one still pending) and waits
    /// up to `wait` for its fence.
    pub fn poll(&mut self, wait: Duration) -> ConsumeOutcome {
        let notification = match self.pending.take().or_else(|| self.receiver.pop()) {
            Some(n) => n,
            None => return ConsumeOutcome::Idle,
        };

        match self.timeline.wait(notification.fence, wait) {
            FenceWait::Signaled => {
                let frame = self.exchange.publish_ready(&notification);
                self.exchange.outstanding.store(false, Ordering::Release);
                self.exchange.stats.finalized.fetch_add(1, Ordering::Relaxed);
                ConsumeOutcome::Finalized(frame)
            }
            FenceWait::TimedOut => {
                self.pending = Some(notification);
                ConsumeOutcome::Pending
            }
            FenceWait::DeviceLost => {
                log_error!("GPU device lost while waiting on capture fence {}", notification.fence.0);
                self.exchange.outstanding.store(false, Ordering::Release);
                self.exchange.stats.device_lost.fetch_add(1, Ordering::Relaxed);
                ConsumeOutcome::DeviceLost
            }
        }
    }

    /// Drops whatever is queued so the producer is not left waiting.
    pub fn drain(&mut self) {
        self.pending = None;
        while self.receiver.pop().is_some() {}
        self.exchange.outstanding.store(false, Ordering::Release);
    }
}

/// Wires a producer/consumer pair around `exchange`.
pub fn frame_channel(
    exchange: Arc<GpuFrameExchange>,
    timeline: Arc<dyn GpuTimeline>,
    capacity: usize,
) -> (FrameProducer, FrameConsumer) {
    let (sender, receiver) = crate::capture_queue::capture_queue(capacity);
    (
        FrameProducer::new(Arc::clone(&exchange), sender),
        FrameConsumer::new(exchange, receiver, timeline),
    )
}
