//! GPU handles and the two seams the capture protocol needs: the render
//! thread's context ([`RenderGpu`]) and a fence timeline any thread may wait
//! on ([`GpuTimeline`]).
//!
//! Handles are plain numbers so they can cross threads by value. The
//! resources behind them stay with the thread that owns the context.

use crate::error::{GpuError, GpuResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// Point on a monotonically increasing GPU timeline. Work submitted before
/// the fence is complete once the timeline reaches this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceValue(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
    DeviceLost,
}

pub trait GpuTimeline: Send + Sync {
    fn completed(&self) -> FenceValue;

    /// Blocks the calling thread until `fence` completes or `timeout` passes.
    fn wait(&self, fence: FenceValue, timeout: Duration) -> FenceWait;

    fn is_signaled(&self, fence: FenceValue) -> bool {
        self.completed() >= fence
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureUsage {
    /// Destination of back-buffer copies; sampled by the mirror renderer.
    Capture,
    /// CPU-written window overlay pixels.
    Upload,
}

/// Operations that need the render thread's GPU context.
pub trait RenderGpu {
    fn backbuffer_size(&self) -> Option<(u32, u32)>;

    fn create_texture(&mut self, width: u32, height: u32, usage: TextureUsage) -> GpuResult<TextureId>;

    fn release_texture(&mut self, texture: TextureId);

    /// Queues a copy of the current back buffer into `dest` and returns the
    /// fence that completes with it. Does not wait.
    fn copy_backbuffer(&mut self, dest: TextureId) -> GpuResult<FenceValue>;

    fn write_texture(&mut self, texture: TextureId, width: u32, height: u32, bgra: &[u8]) -> GpuResult<()>;

    fn timeline(&self) -> Arc<dyn GpuTimeline>;
}

#[derive(Default)]
pub struct HeadlessTimeline {
    issued: AtomicU64,
    completed: Mutex<u64>,
    signal: Condvar,
    lost: AtomicBool,
}

impl HeadlessTimeline {
    fn issue(&self) -> FenceValue {
        FenceValue(self.issued.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn issued(&self) -> FenceValue {
        FenceValue(self.issued.load(Ordering::Acquire))
    }

    pub fn signal_up_to(&self, fence: FenceValue) {
        let mut completed = self.completed.lock();
        if fence.0 > *completed {
            *completed = fence.0;
        }
        self.signal.notify_all();
    }

    pub fn signal_all(&self) {
        self.signal_up_to(self.issued());
    }

    pub fn lose_device(&self) {
        self.lost.store(true, Ordering::Release);
        self.signal.notify_all();
    }
}

impl GpuTimeline for HeadlessTimeline {
    fn completed(&self) -> FenceValue {
        FenceValue(*self.completed.lock())
    }

    fn wait(&self, fence: FenceValue, timeout: Duration) -> FenceWait {
        let deadline = Instant::now() + timeout;
        let mut completed = self.completed.lock();
        loop {
            if *completed >= fence.0 {
                return FenceWait::Signaled;
            }
            if self.lost.load(Ordering::Acquire) {
                return FenceWait::DeviceLost;
            }
            if self.signal.wait_until(&mut completed, deadline).timed_out() {
                return if *completed >= fence.0 {
                    FenceWait::Signaled
                } else {
                    FenceWait::TimedOut
                };
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessTexture {
    pub width: u32,
    pub height: u32,
    pub usage: TextureUsage,
    pub bgra: Vec<u8>,
}

/// CPU-side stand-in for a GPU context. Fences signal on submission unless
/// built with [`HeadlessGpu::with_manual_fences`].
pub struct HeadlessGpu {
    backbuffer: Option<(u32, u32)>,
    next_texture: u64,
    textures: HashMap<TextureId, HeadlessTexture>,
    timeline: Arc<HeadlessTimeline>,
    auto_signal: bool,
    copies: u64,
}

impl HeadlessGpu {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            backbuffer: Some((width, height)),
            next_texture: 0,
            textures: HashMap::new(),
            timeline: Arc::new(HeadlessTimeline::default()),
            auto_signal: true,
            copies: 0,
        }
    }

    pub fn with_manual_fences(width: u32, height: u32) -> Self {
        Self {
            auto_signal: false,
            ..Self::new(width, height)
        }
    }

    pub fn resize_backbuffer(&mut self, width: u32, height: u32) {
        self.backbuffer = Some((width, height));
    }

    pub fn headless_timeline(&self) -> Arc<HeadlessTimeline> {
        Arc::clone(&self.timeline)
    }

    pub fn texture(&self, id: TextureId) -> Option<&HeadlessTexture> {
        self.textures.get(&id)
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn copies(&self) -> u64 {
        self.copies
    }
}

impl RenderGpu for HeadlessGpu {
    fn backbuffer_size(&self) -> Option<(u32, u32)> {
        self.backbuffer
    }

    fn create_texture(&mut self, width: u32, height: u32, usage: TextureUsage) -> GpuResult<TextureId> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize { width, height });
        }
        self.next_texture += 1;
        let id = TextureId(self.next_texture);
        self.textures.insert(
            id,
            HeadlessTexture {
                width,
                height,
                usage,
                bgra: vec![0; width as usize * height as usize * 4],
            },
        );
        Ok(id)
    }

    fn release_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn copy_backbuffer(&mut self, dest: TextureId) -> GpuResult<FenceValue> {
        let (width, height) = self.backbuffer.ok_or(GpuError::NoSource)?;
        let texture = self.textures.get(&dest).ok_or(GpuError::UnknownTexture(dest.0))?;
        if texture.width != width || texture.height != height {
            return Err(GpuError::InvalidSize { width, height });
        }

        self.copies += 1;
        let fence = self.timeline.issue();
        if self.auto_signal {
            self.timeline.signal_up_to(fence);
        }
        Ok(fence)
    }

    fn write_texture(&mut self, texture: TextureId, width: u32, height: u32, bgra: &[u8]) -> GpuResult<()> {
        let target = self.textures.get_mut(&texture).ok_or(GpuError::UnknownTexture(texture.0))?;
        if target.width != width || target.height != height || bgra.len() != target.bgra.len() {
            return Err(GpuError::InvalidSize { width, height });
        }
        target.bgra.copy_from_slice(bgra);
        Ok(())
    }

    fn timeline(&self) -> Arc<dyn GpuTimeline> {
        self.timeline.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn manual_fence_blocks_until_signaled() {
        let mut gpu = HeadlessGpu::with_manual_fences(64, 32);
        let tex = gpu.create_texture(64, 32, TextureUsage::Capture).unwrap();
        let fence = gpu.copy_backbuffer(tex).unwrap();
        let timeline = gpu.headless_timeline();

        assert_eq!(timeline.wait(fence, Duration::from_millis(5)), FenceWait::TimedOut);

        let signaler = {
            let timeline = Arc::clone(&timeline);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                timeline.signal_all();
            })
        };
        assert_eq!(timeline.wait(fence, Duration::from_secs(5)), FenceWait::Signaled);
        signaler.join().unwrap();
        assert!(timeline.is_signaled(fence));
    }

    #[test]
    fn copy_requires_matching_texture() {
        let mut gpu = HeadlessGpu::new(64, 32);
        let small = gpu.create_texture(32, 32, TextureUsage::Capture).unwrap();
        assert!(matches!(gpu.copy_backbuffer(small), Err(GpuError::InvalidSize { .. })));
        assert!(matches!(gpu.copy_backbuffer(TextureId(999)), Err(GpuError::UnknownTexture(999))));

        let ok = gpu.create_texture(64, 32, TextureUsage::Capture).unwrap();
        let fence = gpu.copy_backbuffer(ok).unwrap();
        assert!(gpu.timeline().is_signaled(fence));
    }

    #[test]
    fn lost_device_releases_waiters() {
        let timeline = HeadlessTimeline::default();
        timeline.lose_device();
        assert_eq!(timeline.wait(FenceValue(3), Duration::from_secs(1)), FenceWait::DeviceLost);
    }
}
