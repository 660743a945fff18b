//! Per-overlay capture state owned by the window-capture thread.
//!
//! Each entry tracks its target window through `Unbound -> Searching -> Bound`,
//! captures at its own frame rate and hands finished frames to the render side
//! through a triple buffer.

use crate::config::{Crop, MatchPriority, WindowOverlayConfig};
use crate::error::{CaptureError, CaptureResult};
use crate::platform::{WindowCandidate, WindowHandle, WindowPlatform};
use crate::triple_buffer::{triple_buffer, TripleReader, TripleWriter};
use crate::{log_info, log_warn};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const ERROR_FRAME_WIDTH: u32 = 320;
pub const ERROR_FRAME_HEIGHT: u32 = 180;
/// Magenta, BGRA.
pub const ERROR_FRAME_COLOR: [u8; 4] = [0xff, 0x00, 0xff, 0xff];

/// Top-down BGRA pixels ready for upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub sequence: u64,
    pub error: bool,
}

impl FrameBuffer {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn fill_error(&mut self, sequence: u64) {
        let pixels = (ERROR_FRAME_WIDTH * ERROR_FRAME_HEIGHT) as usize;
        self.pixels.clear();
        self.pixels.reserve(pixels * 4);
        for _ in 0..pixels {
            self.pixels.extend_from_slice(&ERROR_FRAME_COLOR);
        }
        self.width = ERROR_FRAME_WIDTH;
        self.height = ERROR_FRAME_HEIGHT;
        self.sequence = sequence;
        self.error = true;
    }

    /// Copies the cropped region of a `width` x `height` client capture.
    pub fn copy_cropped(&mut self, raw: &[u8], width: u32, height: u32, crop: Crop, sequence: u64) -> CaptureResult<()> {
        if width == 0 || height == 0 || raw.len() < width as usize * height as usize * 4 {
            return Err(CaptureError::EmptyClient);
        }
        let out_w = width.checked_sub(crop.left.saturating_add(crop.right)).filter(|&w| w > 0);
        let out_h = height.checked_sub(crop.top.saturating_add(crop.bottom)).filter(|&h| h > 0);
        let (Some(out_w), Some(out_h)) = (out_w, out_h) else {
            return Err(CaptureError::CropTooLarge { width, height });
        };

        let src_stride = width as usize * 4;
        let row_bytes = out_w as usize * 4;
        self.pixels.clear();
        self.pixels.reserve(row_bytes * out_h as usize);
        for row in crop.top..crop.top + out_h {
            let start = row as usize * src_stride + crop.left as usize * 4;
            self.pixels.extend_from_slice(&raw[start..start + row_bytes]);
        }
        self.width = out_w;
        self.height = out_h;
        self.sequence = sequence;
        self.error = false;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Searching { last_attempt: Option<Instant> },
    Bound(WindowHandle),
}

/// Picks the overlay's target among `candidates`.
///
/// Tiers are tried in order: exact title, window class, executable name
/// (case-insensitive). The first enumerated window wins within a tier.
/// Windows of `own_pid` and the game window are never returned.
pub fn resolve_target(
    candidates: &[WindowCandidate],
    config: &WindowOverlayConfig,
    game_window: WindowHandle,
    own_pid: u32,
) -> Option<WindowHandle> {
    let eligible = || {
        candidates
            .iter()
            .filter(move |c| c.pid != own_pid && c.handle != game_window && !c.handle.is_none())
    };

    if !config.window_title.is_empty() {
        if let Some(c) = eligible().find(|c| c.title == config.window_title) {
            return Some(c.handle);
        }
    }
    if config.match_priority == MatchPriority::TitleOnly {
        return None;
    }
    if !config.window_class.is_empty() {
        if let Some(c) = eligible().find(|c| c.class == config.window_class) {
            return Some(c.handle);
        }
    }
    if !config.executable_name.is_empty() {
        if let Some(c) = eligible().find(|c| c.executable.eq_ignore_ascii_case(&config.executable_name)) {
            return Some(c.handle);
        }
    }
    None
}

/// Entry state visible outside the capture thread.
#[derive(Debug, Default)]
pub struct OverlayStatus {
    needs_update: AtomicBool,
    bound: AtomicIsize,
    frames: AtomicU64,
    errors: AtomicU64,
    refusals: AtomicU64,
}

impl OverlayStatus {
    /// Forces a capture on the next step regardless of cadence.
    pub fn request_update(&self) {
        self.needs_update.store(true, Ordering::Release);
    }

    pub fn bound_window(&self) -> WindowHandle {
        WindowHandle(self.bound.load(Ordering::Acquire))
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn refusals(&self) -> u64 {
        self.refusals.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Disabled,
    NotDue,
    Searching,
    Captured,
    /// Self-capture guard tripped; no capture call was made.
    Refused,
    Failed(CaptureError),
}

pub struct WindowOverlayEntry {
    config: WindowOverlayConfig,
    state: BindState,
    /// Owner of the bound window when it was bound; a different owner means the handle was reused.
    bound_pid: Option<u32>,
    status: Arc<OverlayStatus>,
    raw: Vec<u8>,
    writer: TripleWriter<FrameBuffer>,
    last_capture: Option<Instant>,
    sequence: u64,
    search_interval: Duration,
    log_search: bool,
}

impl WindowOverlayEntry {
    pub fn new(config: WindowOverlayConfig, search_interval: Duration) -> (Self, TripleReader<FrameBuffer>) {
        let (writer, reader) = triple_buffer();
        let entry = Self {
            config,
            state: BindState::Unbound,
            bound_pid: None,
            status: Arc::new(OverlayStatus::default()),
            raw: Vec::new(),
            writer,
            last_capture: None,
            sequence: 0,
            search_interval,
            log_search: false,
        };
        (entry, reader)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WindowOverlayConfig {
        &self.config
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    pub fn status(&self) -> &Arc<OverlayStatus> {
        &self.status
    }

    pub fn set_search_interval(&mut self, interval: Duration) {
        self.search_interval = interval;
    }

    pub fn set_log_search(&mut self, enabled: bool) {
        self.log_search = enabled;
    }

    /// Installs a changed configuration. A different target drops the bound window.
    pub fn apply_config(&mut self, config: WindowOverlayConfig) {
        if self.config.target_differs(&config) {
            self.invalidate();
        }
        self.config = config;
        self.status.request_update();
    }

    pub fn invalidate(&mut self) {
        self.state = BindState::Searching { last_attempt: None };
        self.bound_pid = None;
        self.status.bound.store(0, Ordering::Release);
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(1) / self.config.fps.max(1)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        if self.status.needs_update.load(Ordering::Acquire) {
            return true;
        }
        match self.last_capture {
            Some(last) => now.saturating_duration_since(last) >= self.min_interval(),
            None => true,
        }
    }

    fn still_bound(&self, platform: &dyn WindowPlatform, handle: WindowHandle) -> bool {
        platform.is_window(handle) && platform.window_process_id(handle) == self.bound_pid
    }

    /// Liveness check: drops a bound handle whose window is gone or now
    /// belongs to another process. Returns true if the binding survived.
    pub fn revalidate(&mut self, platform: &dyn WindowPlatform) -> bool {
        let BindState::Bound(handle) = self.state else {
            return false;
        };
        if self.still_bound(platform, handle) {
            return true;
        }
        log_info!("Window overlay '{}' lost its window {:#x}", self.config.name, handle.0);
        self.invalidate();
        false
    }

    fn try_bind(&mut self, platform: &mut dyn WindowPlatform, game_window: WindowHandle, now: Instant) -> Option<WindowHandle> {
        if let BindState::Searching { last_attempt: Some(last) } = self.state {
            if now.saturating_duration_since(last) < self.search_interval {
                return None;
            }
        }

        let candidates = platform.enumerate();
        let found = resolve_target(&candidates, &self.config, game_window, platform.current_process_id());
        match found {
            Some(handle) => {
                if self.log_search {
                    log_info!(
                        "Window overlay '{}' bound to {:#x} ({} candidates)",
                        self.config.name, handle.0, candidates.len()
                    );
                }
                self.state = BindState::Bound(handle);
                self.bound_pid = platform.window_process_id(handle);
                self.status.bound.store(handle.0, Ordering::Release);
                Some(handle)
            }
            None => {
                if self.log_search {
                    log_info!(
                        "Window overlay '{}': no match for title '{}' class '{}' exe '{}'",
                        self.config.name, self.config.window_title, self.config.window_class, self.config.executable_name
                    );
                }
                self.state = BindState::Searching { last_attempt: Some(now) };
                None
            }
        }
    }

    fn guard_self_capture(&self, platform: &dyn WindowPlatform, handle: WindowHandle, game_window: WindowHandle) -> CaptureResult<()> {
        if (!game_window.is_none() && handle == game_window)
            || platform.window_process_id(handle) == Some(platform.current_process_id())
        {
            return Err(CaptureError::SelfCapture(handle.0));
        }
        Ok(())
    }

    pub fn step(&mut self, platform: &mut dyn WindowPlatform, game_window: WindowHandle, now: Instant) -> StepOutcome {
        if !self.config.enabled {
            return StepOutcome::Disabled;
        }
        if !self.is_due(now) {
            return StepOutcome::NotDue;
        }

        // A handle can die or be reused between sweeps.
        self.revalidate(platform);
        let handle = match self.state {
            BindState::Bound(handle) => handle,
            BindState::Unbound | BindState::Searching { .. } => match self.try_bind(platform, game_window, now) {
                Some(handle) => handle,
                None => return StepOutcome::Searching,
            },
        };

        if let Err(e) = self.guard_self_capture(platform, handle, game_window) {
            log_warn!("Window overlay '{}': {}", self.config.name, e);
            self.status.refusals.fetch_add(1, Ordering::Relaxed);
            self.invalidate();
            return StepOutcome::Refused;
        }

        self.status.needs_update.store(false, Ordering::Release);
        self.last_capture = Some(now);

        let captured = platform
            .capture(handle, self.config.capture_method, &mut self.raw)
            .and_then(|(width, height)| {
                self.writer
                    .buffer_mut()
                    .copy_cropped(&self.raw, width, height, self.config.crop, self.sequence + 1)
            });

        match captured {
            Ok(()) => {
                self.sequence += 1;
                self.writer.publish();
                self.status.frames.fetch_add(1, Ordering::Relaxed);
                StepOutcome::Captured
            }
            Err(e) => {
                self.on_capture_failure(platform, handle, &e);
                StepOutcome::Failed(e)
            }
        }
    }

    fn on_capture_failure(&mut self, platform: &dyn WindowPlatform, handle: WindowHandle, error: &CaptureError) {
        self.status.errors.fetch_add(1, Ordering::Relaxed);

        if *error == CaptureError::WindowGone || !platform.is_window(handle) {
            self.invalidate();
        }

        if self.config.capture_method.is_fallback_chain() {
            log_warn!("Window overlay '{}' capture failed, keeping last frame: {}", self.config.name, error);
            return;
        }

        log_warn!(
            "Window overlay '{}' capture via {:?} failed: {}",
            self.config.name, self.config.capture_method, error
        );
        self.sequence += 1;
        self.writer.buffer_mut().fill_error(self.sequence);
        self.writer.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureMethod;
    use crate::platform::FakeDesktop;

    const OWN_PID: u32 = 100;
    const GAME: WindowHandle = WindowHandle(1);

    fn overlay(title: &str) -> WindowOverlayConfig {
        WindowOverlayConfig {
            window_title: title.to_string(),
            ..WindowOverlayConfig::new("chat")
        }
    }

    fn candidate(handle: isize, title: &str, class: &str, exe: &str, pid: u32) -> WindowCandidate {
        WindowCandidate {
            handle: WindowHandle(handle),
            title: title.to_string(),
            class: class.to_string(),
            executable: exe.to_string(),
            pid,
        }
    }

    #[test]
    fn resolve_prefers_title_then_class_then_executable() {
        let candidates = vec![
            candidate(10, "Other", "ChatWnd", "x.exe", 5),
            candidate(11, "Chat", "Foo", "y.exe", 5),
            candidate(12, "Chat", "Bar", "z.exe", 5),
            candidate(13, "Nope", "Baz", "Chat.EXE", 5),
        ];
        let mut cfg = overlay("Chat");
        cfg.window_class = "ChatWnd".into();
        cfg.executable_name = "chat.exe".into();
        assert_eq!(resolve_target(&candidates, &cfg, GAME, OWN_PID), Some(WindowHandle(11)));

        cfg.window_title = "Missing".into();
        assert_eq!(resolve_target(&candidates, &cfg, GAME, OWN_PID), Some(WindowHandle(10)));

        cfg.window_class = String::new();
        assert_eq!(resolve_target(&candidates, &cfg, GAME, OWN_PID), Some(WindowHandle(13)));

        cfg.match_priority = MatchPriority::TitleOnly;
        assert_eq!(resolve_target(&candidates, &cfg, GAME, OWN_PID), None);
    }

    #[test]
    fn resolve_skips_own_process_and_game_window() {
        let candidates = vec![
            candidate(1, "Chat", "", "", 5),
            candidate(20, "Chat", "", "", OWN_PID),
            candidate(21, "Chat", "", "", 6),
        ];
        assert_eq!(resolve_target(&candidates, &overlay("Chat"), GAME, OWN_PID), Some(WindowHandle(21)));
    }

    #[test]
    fn crop_extracts_sub_rectangle() {
        let (w, h) = (4u32, 3u32);
        let raw: Vec<u8> = (0..w * h).flat_map(|i| [i as u8; 4]).collect();
        let mut frame = FrameBuffer::default();
        let crop = Crop { left: 1, top: 1, right: 1, bottom: 0 };
        frame.copy_cropped(&raw, w, h, crop, 1).unwrap();
        assert_eq!((frame.width, frame.height), (2, 2));
        let firsts: Vec<u8> = frame.pixels.chunks(4).map(|p| p[0]).collect();
        assert_eq!(firsts, vec![5, 6, 9, 10]);

        let too_much = Crop { left: 2, top: 0, right: 2, bottom: 0 };
        assert_eq!(
            frame.copy_cropped(&raw, w, h, too_much, 2),
            Err(CaptureError::CropTooLarge { width: 4, height: 3 })
        );
    }

    #[test]
    fn binds_captures_and_publishes() {
        let mut desktop = FakeDesktop::new(OWN_PID);
        desktop.add_window(10, "Chat", "ChatWnd", "chat.exe", 5);
        let (mut entry, mut reader) = WindowOverlayEntry::new(overlay("Chat"), Duration::from_secs(1));

        let now = Instant::now();
        assert_eq!(entry.step(&mut desktop, GAME, now), StepOutcome::Captured);
        assert_eq!(entry.state(), BindState::Bound(WindowHandle(10)));
        assert_eq!(entry.status().bound_window(), WindowHandle(10));

        let frame = reader.take().unwrap();
        assert_eq!((frame.width, frame.height), (64, 48));
        assert!(!frame.error);
        assert!(reader.take().is_none());

        // 30 fps cadence: a step 1 ms later is skipped.
        assert_eq!(entry.step(&mut desktop, GAME, now + Duration::from_millis(1)), StepOutcome::NotDue);
        entry.status().request_update();
        assert_eq!(entry.step(&mut desktop, GAME, now + Duration::from_millis(2)), StepOutcome::Captured);
    }

    #[test]
    fn self_capture_guard_refuses_without_calling_capture() {
        let mut desktop = FakeDesktop::new(OWN_PID);
        desktop.add_window(10, "Chat", "", "", 5);
        let (mut entry, _reader) = WindowOverlayEntry::new(overlay("Chat"), Duration::from_secs(1));
        let now = Instant::now();
        entry.step(&mut desktop, GAME, now);
        assert_eq!(desktop.captures_of(10), 1);

        // The tracked game window is now the bound window.
        entry.status().request_update();
        let outcome = entry.step(&mut desktop, WindowHandle(10), now + Duration::from_millis(50));
        assert_eq!(outcome, StepOutcome::Refused);
        assert_eq!(desktop.captures_of(10), 1);
        assert_eq!(entry.state(), BindState::Searching { last_attempt: None });
        assert!(entry.status().bound_window().is_none());
        assert_eq!(entry.status().refusals(), 1);
    }

    #[test]
    fn guard_reports_windows_owned_by_this_process() {
        let desktop = FakeDesktop::new(OWN_PID);
        desktop.add_window(10, "Chat", "", "", 5);
        desktop.add_window(20, "Settings", "", "", OWN_PID);
        let (entry, _reader) = WindowOverlayEntry::new(overlay("Chat"), Duration::from_secs(1));

        assert_eq!(entry.guard_self_capture(&desktop, WindowHandle(10), GAME), Ok(()));
        assert_eq!(
            entry.guard_self_capture(&desktop, WindowHandle(20), GAME),
            Err(CaptureError::SelfCapture(20))
        );
        assert_eq!(
            entry.guard_self_capture(&desktop, GAME, GAME),
            Err(CaptureError::SelfCapture(GAME.0))
        );
    }

    #[test]
    fn explicit_method_failure_publishes_error_frame() {
        let mut desktop = FakeDesktop::new(OWN_PID);
        desktop.add_window(10, "Chat", "", "", 5);
        desktop.update_window(10, |w| w.fail_with = Some(CaptureError::Platform("blit".into())));

        let mut cfg = overlay("Chat");
        cfg.capture_method = CaptureMethod::BitBlt;
        let (mut entry, mut reader) = WindowOverlayEntry::new(cfg, Duration::from_secs(1));

        assert!(matches!(entry.step(&mut desktop, GAME, Instant::now()), StepOutcome::Failed(_)));
        let frame = reader.take().unwrap();
        assert!(frame.error);
        assert_eq!((frame.width, frame.height), (ERROR_FRAME_WIDTH, ERROR_FRAME_HEIGHT));
        assert_eq!(&frame.pixels[..4], &ERROR_FRAME_COLOR);
        // Window still exists, so the handle is kept.
        assert_eq!(entry.state(), BindState::Bound(WindowHandle(10)));
    }

    #[test]
    fn auto_method_failure_keeps_last_frame() {
        let mut desktop = FakeDesktop::new(OWN_PID);
        desktop.add_window(10, "Chat", "", "", 5);
        let (mut entry, mut reader) = WindowOverlayEntry::new(overlay("Chat"), Duration::from_secs(1));
        let now = Instant::now();
        entry.step(&mut desktop, GAME, now);
        assert!(reader.take().is_some());

        desktop.update_window(10, |w| w.fail_with = Some(CaptureError::Platform("print".into())));
        entry.status().request_update();
        let outcome = entry.step(&mut desktop, GAME, now + Duration::from_millis(40));
        assert_eq!(outcome, StepOutcome::Failed(CaptureError::Platform("print".into())));
        assert!(reader.take().is_none());
        assert_eq!(reader.back().width, 64);
        assert_eq!(entry.state(), BindState::Bound(WindowHandle(10)));
        assert_eq!(entry.status().errors(), 1);
    }

    #[test]
    fn closed_window_is_dropped_before_capture() {
        let mut desktop = FakeDesktop::new(OWN_PID);
        desktop.add_window(10, "Chat", "", "", 5);
        let (mut entry, mut reader) = WindowOverlayEntry::new(overlay("Chat"), Duration::from_secs(1));
        let now = Instant::now();
        entry.step(&mut desktop, GAME, now);
        assert!(reader.take().is_some());

        desktop.close_window(10);
        entry.status().request_update();
        let later = now + Duration::from_millis(40);
        assert_eq!(entry.step(&mut desktop, GAME, later), StepOutcome::Searching);
        assert_eq!(desktop.captures_of(10), 1);
        assert_eq!(entry.state(), BindState::Searching { last_attempt: Some(later) });
        assert_eq!(reader.back().width, 64);
    }

    #[test]
    fn reused_handle_is_not_captured_for_the_old_target() {
        let mut desktop = FakeDesktop::new(OWN_PID);
        desktop.add_window(10, "Chat", "", "", 5);
        let (mut entry, _reader) = WindowOverlayEntry::new(overlay("Chat"), Duration::from_secs(1));
        let now = Instant::now();
        assert_eq!(entry.step(&mut desktop, GAME, now), StepOutcome::Captured);

        desktop.close_window(10);
        desktop.add_window(10, "Spreadsheet", "", "", 9);
        entry.status().request_update();
        assert_eq!(entry.step(&mut desktop, GAME, now + Duration::from_millis(40)), StepOutcome::Searching);
        assert_eq!(desktop.captures_of(10), 1);
        assert!(entry.status().bound_window().is_none());

        desktop.add_window(11, "Chat", "", "", 6);
        let rebound = entry.step(&mut desktop, GAME, now + Duration::from_millis(1040));
        assert_eq!(rebound, StepOutcome::Captured);
        assert_eq!(entry.state(), BindState::Bound(WindowHandle(11)));
    }

    #[test]
    fn search_is_rate_limited() {
        let mut desktop = FakeDesktop::new(OWN_PID);
        let (mut entry, _reader) = WindowOverlayEntry::new(overlay("Chat"), Duration::from_millis(1000));
        let t0 = Instant::now();
        assert_eq!(entry.step(&mut desktop, GAME, t0), StepOutcome::Searching);

        desktop.add_window(10, "Chat", "", "", 5);
        assert_eq!(entry.step(&mut desktop, GAME, t0 + Duration::from_millis(100)), StepOutcome::Searching);
        assert_eq!(entry.step(&mut desktop, GAME, t0 + Duration::from_millis(1000)), StepOutcome::Captured);
    }

    #[test]
    fn changed_target_unbinds() {
        let mut desktop = FakeDesktop::new(OWN_PID);
        desktop.add_window(10, "Chat", "", "", 5);
        let (mut entry, _reader) = WindowOverlayEntry::new(overlay("Chat"), Duration::from_secs(1));
        entry.step(&mut desktop, GAME, Instant::now());

        let mut moved = overlay("Chat");
        moved.placement.x = 40;
        entry.apply_config(moved);
        assert_eq!(entry.state(), BindState::Bound(WindowHandle(10)));

        entry.apply_config(overlay("Other"));
        assert_eq!(entry.state(), BindState::Searching { last_attempt: None });
    }
}
