//! Window-system collaborators used by the capture and logic threads.

use crate::config::{CaptureMethod, ScreenMetrics};
use crate::error::{CaptureError, CaptureResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque native window handle. Zero means "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WindowHandle(pub isize);

impl WindowHandle {
    pub const NONE: WindowHandle = WindowHandle(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// The mirrored application's window, set by whoever hooks it.
#[derive(Debug, Default)]
pub struct GameWindow(AtomicIsize);

impl GameWindow {
    pub fn get(&self) -> WindowHandle {
        WindowHandle(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, handle: WindowHandle) {
        self.0.store(handle.0, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCandidate {
    pub handle: WindowHandle,
    pub title: String,
    pub class: String,
    /// File name of the owning executable, e.g. `obs64.exe`.
    pub executable: String,
    pub pid: u32,
}

pub trait WindowPlatform: Send {
    /// Top-level windows in enumeration (z) order.
    fn enumerate(&mut self) -> Vec<WindowCandidate>;

    fn is_window(&self, handle: WindowHandle) -> bool;

    fn window_process_id(&self, handle: WindowHandle) -> Option<u32>;

    fn current_process_id(&self) -> u32;

    /// Captures the client area as top-down BGRA into `out`, resizing it as needed.
    fn capture(&mut self, handle: WindowHandle, method: CaptureMethod, out: &mut Vec<u8>) -> CaptureResult<(u32, u32)>;
}

pub trait ScreenSource: Send {
    /// Client size of the mirrored application, if it is currently known.
    fn screen_size(&mut self) -> Option<ScreenMetrics>;
}

/// Screen size that tests and the demo binary can change from any thread.
#[derive(Clone, Default)]
pub struct SharedScreen {
    size: Arc<Mutex<Option<ScreenMetrics>>>,
}

impl SharedScreen {
    pub fn new(size: ScreenMetrics) -> Self {
        Self {
            size: Arc::new(Mutex::new(Some(size))),
        }
    }

    pub fn set(&self, size: ScreenMetrics) {
        *self.size.lock() = Some(size);
    }

    pub fn clear(&self) {
        *self.size.lock() = None;
    }
}

impl ScreenSource for SharedScreen {
    fn screen_size(&mut self) -> Option<ScreenMetrics> {
        *self.size.lock()
    }
}

#[derive(Debug, Clone)]
pub struct FakeWindow {
    pub candidate: WindowCandidate,
    pub width: u32,
    pub height: u32,
    /// BGRA fill color.
    pub color: [u8; 4],
    pub fail_with: Option<CaptureError>,
}

#[derive(Default)]
struct FakeDesktopState {
    windows: Vec<FakeWindow>,
    captures: HashMap<WindowHandle, u64>,
}

/// In-memory window system. Clones share state, so a test can keep a handle
/// while the capture thread owns another.
#[derive(Clone)]
pub struct FakeDesktop {
    state: Arc<Mutex<FakeDesktopState>>,
    own_pid: u32,
    total_captures: Arc<AtomicU64>,
}

impl FakeDesktop {
    pub fn new(own_pid: u32) -> Self {
        Self {
            state: Arc::default(),
            own_pid,
            total_captures: Arc::default(),
        }
    }

    pub fn add_window(&self, handle: isize, title: &str, class: &str, executable: &str, pid: u32) {
        self.state.lock().windows.push(FakeWindow {
            candidate: WindowCandidate {
                handle: WindowHandle(handle),
                title: title.to_string(),
                class: class.to_string(),
                executable: executable.to_string(),
                pid,
            },
            width: 64,
            height: 48,
            color: [0x20, 0x40, 0x60, 0xff],
            fail_with: None,
        });
    }

    pub fn update_window(&self, handle: isize, f: impl FnOnce(&mut FakeWindow)) {
        let mut state = self.state.lock();
        if let Some(window) = state.windows.iter_mut().find(|w| w.candidate.handle.0 == handle) {
            f(window);
        }
    }

    pub fn close_window(&self, handle: isize) {
        self.state.lock().windows.retain(|w| w.candidate.handle.0 != handle);
    }

    pub fn captures_of(&self, handle: isize) -> u64 {
        self.state.lock().captures.get(&WindowHandle(handle)).copied().unwrap_or(0)
    }

    pub fn total_captures(&self) -> u64 {
        self.total_captures.load(Ordering::Relaxed)
    }
}

impl WindowPlatform for FakeDesktop {
    fn enumerate(&mut self) -> Vec<WindowCandidate> {
        self.state.lock().windows.iter().map(|w| w.candidate.clone()).collect()
    }

    fn is_window(&self, handle: WindowHandle) -> bool {
        self.state.lock().windows.iter().any(|w| w.candidate.handle == handle)
    }

    fn window_process_id(&self, handle: WindowHandle) -> Option<u32> {
        self.state
            .lock()
            .windows
            .iter()
            .find(|w| w.candidate.handle == handle)
            .map(|w| w.candidate.pid)
    }

    fn current_process_id(&self) -> u32 {
        self.own_pid
    }

    fn capture(&mut self, handle: WindowHandle, _method: CaptureMethod, out: &mut Vec<u8>) -> CaptureResult<(u32, u32)> {
        self.total_captures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        *state.captures.entry(handle).or_default() += 1;

        let window = state
            .windows
            .iter()
            .find(|w| w.candidate.handle == handle)
            .ok_or(CaptureError::WindowGone)?;
        if let Some(err) = &window.fail_with {
            return Err(err.clone());
        }

        let pixels = window.width as usize * window.height as usize;
        out.clear();
        out.reserve(pixels * 4);
        for _ in 0..pixels {
            out.extend_from_slice(&window.color);
        }
        Ok((window.width, window.height))
    }
}
