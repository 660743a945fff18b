//! Direct3D 11 backend for the host application's swap chain.
//!
//! Back-buffer copies are fenced with a single `ID3D11Fence` whose values form
//! the timeline, so the mirror-capture thread can wait on a copy without
//! touching the immediate context.

use crate::error::{GpuError, GpuResult};
use crate::gpu::{FenceValue, FenceWait, GpuTimeline, RenderGpu, TextureId, TextureUsage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::IDXGISwapChain;
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject};

fn backend(e: windows::core::Error) -> GpuError {
    GpuError::Backend(format!("{:?}", e))
}

pub struct D3d11Timeline {
    device: ID3D11Device,
    fence: ID3D11Fence,
}

// SAFETY: ID3D11Device and ID3D11Fence are free-threaded; only fence queries
// and device-removed checks are made through this type.
unsafe impl Send for D3d11Timeline {}
unsafe impl Sync for D3d11Timeline {}

impl D3d11Timeline {
    fn device_lost(&self) -> bool {
        unsafe { self.device.GetDeviceRemovedReason().is_err() }
    }
}

impl GpuTimeline for D3d11Timeline {
    fn completed(&self) -> FenceValue {
        FenceValue(unsafe { self.fence.GetCompletedValue() })
    }

    fn wait(&self, fence: FenceValue, timeout: Duration) -> FenceWait {
        if self.completed() >= fence {
            return FenceWait::Signaled;
        }
        if self.device_lost() {
            return FenceWait::DeviceLost;
        }

        unsafe {
            let event = match CreateEventW(None, false, false, None) {
                Ok(event) => event,
                Err(_) => return FenceWait::TimedOut,
            };
            let result = match self.fence.SetEventOnCompletion(fence.0, event) {
                Ok(()) => {
                    let millis = timeout.as_millis().min(u32::MAX as u128) as u32;
                    if WaitForSingleObject(event, millis) == WAIT_OBJECT_0 {
                        FenceWait::Signaled
                    } else if self.device_lost() {
                        FenceWait::DeviceLost
                    } else {
                        FenceWait::TimedOut
                    }
                }
                Err(_) => FenceWait::DeviceLost,
            };
            let _ = CloseHandle(event);
            result
        }
    }
}

/// Render-thread GPU context. Not `Send`: it must stay on the thread that presents.
///
/// Embedders that hook a real swap chain build one from their swap chain,
/// device and immediate context and hand it to `RenderSide::on_swap_buffers`.
pub struct D3d11Gpu {
    swap_chain: IDXGISwapChain,
    device: ID3D11Device,
    context: ID3D11DeviceContext4,
    timeline: Arc<D3d11Timeline>,
    next_fence: AtomicU64,
    next_texture: u64,
    textures: HashMap<TextureId, ID3D11Texture2D>,
}

impl D3d11Gpu {
    pub fn new(swap_chain: IDXGISwapChain, device: ID3D11Device, context: ID3D11DeviceContext) -> GpuResult<Self> {
        unsafe {
            let device5: ID3D11Device5 = device.cast().map_err(backend)?;
            let context: ID3D11DeviceContext4 = context.cast().map_err(backend)?;
            let fence: ID3D11Fence = device5.CreateFence(0, D3D11_FENCE_FLAG_NONE).map_err(backend)?;

            Ok(Self {
                swap_chain,
                device: device.clone(),
                context,
                timeline: Arc::new(D3d11Timeline { device, fence }),
                next_fence: AtomicU64::new(0),
                next_texture: 0,
                textures: HashMap::new(),
            })
        }
    }

    fn backbuffer(&self) -> GpuResult<ID3D11Texture2D> {
        unsafe { self.swap_chain.GetBuffer::<ID3D11Texture2D>(0).map_err(|_| GpuError::NoSource) }
    }

    fn texture(&self, id: TextureId) -> GpuResult<&ID3D11Texture2D> {
        self.textures.get(&id).ok_or(GpuError::UnknownTexture(id.0))
    }
}

impl RenderGpu for D3d11Gpu {
    fn backbuffer_size(&self) -> Option<(u32, u32)> {
        let buffer = self.backbuffer().ok()?;
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { buffer.GetDesc(&mut desc) };
        Some((desc.Width, desc.Height))
    }

    fn create_texture(&mut self, width: u32, height: u32, usage: TextureUsage) -> GpuResult<TextureId> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize { width, height });
        }

        let format = match usage {
            TextureUsage::Capture => {
                let buffer = self.backbuffer()?;
                let mut desc = D3D11_TEXTURE2D_DESC::default();
                unsafe { buffer.GetDesc(&mut desc) };
                desc.Format
            }
            TextureUsage::Upload => DXGI_FORMAT_B8G8R8A8_UNORM,
        };

        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture)) }.map_err(|e| {
            if unsafe { self.device.GetDeviceRemovedReason() }.is_err() {
                GpuError::DeviceLost
            } else {
                backend(e)
            }
        })?;
        let texture = texture.ok_or_else(|| GpuError::Backend("CreateTexture2D returned no texture".into()))?;

        self.next_texture += 1;
        let id = TextureId(self.next_texture);
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn release_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn copy_backbuffer(&mut self, dest: TextureId) -> GpuResult<FenceValue> {
        let source = self.backbuffer()?;
        let target = self.texture(dest)?.clone();
        let value = self.next_fence.fetch_add(1, Ordering::Relaxed) + 1;

        unsafe {
            self.context.CopyResource(&target, &source);
            self.context.Signal(&self.timeline.fence, value).map_err(backend)?;
            self.context.Flush();
        }
        Ok(FenceValue(value))
    }

    fn write_texture(&mut self, texture: TextureId, width: u32, height: u32, bgra: &[u8]) -> GpuResult<()> {
        if bgra.len() < width as usize * height as usize * 4 {
            return Err(GpuError::InvalidSize { width, height });
        }
        let target = self.texture(texture)?.clone();
        unsafe {
            self.context.UpdateSubresource(&target, 0, None, bgra.as_ptr().cast(), width * 4, 0);
        }
        Ok(())
    }

    fn timeline(&self) -> Arc<dyn GpuTimeline> {
        self.timeline.clone()
    }
}
