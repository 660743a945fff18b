//! Win32 window enumeration and GDI capture.

use crate::config::{CaptureMethod, ScreenMetrics};
use crate::error::{CaptureError, CaptureResult};
use crate::platform::{GameWindow, ScreenSource, WindowCandidate, WindowHandle, WindowPlatform};
use std::ffi::c_void;
use std::mem::size_of;
use std::sync::Arc;
use windows::core::{BOOL, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HWND, LPARAM, RECT};
use windows::Win32::Graphics::Gdi::{
    BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC, GetDIBits, ReleaseDC,
    SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS, SRCCOPY,
};
use windows::Win32::Storage::Xps::{PrintWindow, PRINT_WINDOW_FLAGS};
use windows::Win32::System::Threading::{
    GetCurrentProcessId, OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetClassNameW, GetClientRect, GetWindowTextLengthW, GetWindowTextW, GetWindowThreadProcessId,
    IsWindow, IsWindowVisible,
};

/// `PW_RENDERFULLCONTENT`, needed for DirectComposition windows.
const PW_RENDER_FULL_CONTENT: PRINT_WINDOW_FLAGS = PRINT_WINDOW_FLAGS(2);
const PW_CLIENT_ONLY: PRINT_WINDOW_FLAGS = PRINT_WINDOW_FLAGS(1);

fn hwnd(handle: WindowHandle) -> HWND {
    HWND(handle.0 as *mut c_void)
}

fn executable_name(pid: u32) -> String {
    unsafe {
        let Ok(process) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) else {
            return String::new();
        };
        let mut buf = [0u16; 1024];
        let mut len = buf.len() as u32;
        let ok = QueryFullProcessImageNameW(process, PROCESS_NAME_WIN32, PWSTR(buf.as_mut_ptr()), &mut len).is_ok();
        let _ = CloseHandle(process);
        if !ok {
            return String::new();
        }
        let path = String::from_utf16_lossy(&buf[..len as usize]);
        path.rsplit(['\\', '/']).next().unwrap_or_default().to_string()
    }
}

unsafe extern "system" fn enum_cb(window: HWND, lparam: LPARAM) -> BOOL {
    let out = &mut *(lparam.0 as *mut Vec<WindowCandidate>);
    if !IsWindowVisible(window).as_bool() {
        return BOOL(1);
    }

    let len = GetWindowTextLengthW(window);
    let title = if len > 0 {
        let mut buf = vec![0u16; len as usize + 1];
        let read = GetWindowTextW(window, &mut buf);
        String::from_utf16_lossy(&buf[..read as usize])
    } else {
        String::new()
    };

    let mut class_buf = [0u16; 256];
    let class_len = GetClassNameW(window, &mut class_buf);
    let class = String::from_utf16_lossy(&class_buf[..class_len.max(0) as usize]);

    let mut pid = 0u32;
    GetWindowThreadProcessId(window, Some(&mut pid));

    out.push(WindowCandidate {
        handle: WindowHandle(window.0 as isize),
        title,
        class,
        executable: executable_name(pid),
        pid,
    });
    BOOL(1)
}

#[derive(Default)]
pub struct Win32Windows;

impl Win32Windows {
    fn client_size(window: HWND) -> CaptureResult<(i32, i32)> {
        let mut rect = RECT::default();
        unsafe { GetClientRect(window, &mut rect) }.map_err(|_| CaptureError::WindowGone)?;
        let (width, height) = (rect.right - rect.left, rect.bottom - rect.top);
        if width <= 0 || height <= 0 {
            return Err(CaptureError::EmptyClient);
        }
        Ok((width, height))
    }

    fn capture_gdi(window: HWND, method: CaptureMethod, out: &mut Vec<u8>) -> CaptureResult<(u32, u32)> {
        let (width, height) = Self::client_size(window)?;

        unsafe {
            let window_dc = GetDC(Some(window));
            if window_dc.0.is_null() {
                return Err(CaptureError::Platform("GetDC returned null".into()));
            }
            let mem_dc = CreateCompatibleDC(Some(window_dc));
            let bitmap = CreateCompatibleBitmap(window_dc, width, height);
            let previous = SelectObject(mem_dc, bitmap.into());

            let print = || PrintWindow(window, mem_dc, PW_CLIENT_ONLY | PW_RENDER_FULL_CONTENT).as_bool();
            let blit = || BitBlt(mem_dc, 0, 0, width, height, Some(window_dc), 0, 0, SRCCOPY).is_ok();
            let rendered = match method {
                CaptureMethod::PrintWindow => print(),
                CaptureMethod::BitBlt => blit(),
                CaptureMethod::Auto => print() || blit(),
            };

            let mut info = BITMAPINFO::default();
            info.bmiHeader.biSize = size_of::<BITMAPINFOHEADER>() as u32;
            info.bmiHeader.biWidth = width;
            info.bmiHeader.biHeight = -height;
            info.bmiHeader.biPlanes = 1;
            info.bmiHeader.biBitCount = 32;
            info.bmiHeader.biCompression = BI_RGB.0;

            out.clear();
            out.resize(width as usize * height as usize * 4, 0);
            let lines = if rendered {
                GetDIBits(
                    mem_dc,
                    bitmap,
                    0,
                    height as u32,
                    Some(out.as_mut_ptr().cast()),
                    &mut info,
                    DIB_RGB_COLORS,
                )
            } else {
                0
            };

            SelectObject(mem_dc, previous);
            let _ = DeleteObject(bitmap.into());
            let _ = DeleteDC(mem_dc);
            ReleaseDC(Some(window), window_dc);

            if !rendered {
                return Err(CaptureError::Platform(format!("{:?} capture failed", method)));
            }
            if lines != height {
                return Err(CaptureError::Platform("GetDIBits copied no rows".into()));
            }
        }
        Ok((width as u32, height as u32))
    }
}

impl WindowPlatform for Win32Windows {
    fn enumerate(&mut self) -> Vec<WindowCandidate> {
        let mut out: Vec<WindowCandidate> = Vec::new();
        unsafe {
            let _ = EnumWindows(Some(enum_cb), LPARAM(&mut out as *mut _ as isize));
        }
        out
    }

    fn is_window(&self, handle: WindowHandle) -> bool {
        !handle.is_none() && unsafe { IsWindow(Some(hwnd(handle))).as_bool() }
    }

    fn window_process_id(&self, handle: WindowHandle) -> Option<u32> {
        if !self.is_window(handle) {
            return None;
        }
        let mut pid = 0u32;
        unsafe { GetWindowThreadProcessId(hwnd(handle), Some(&mut pid)) };
        (pid != 0).then_some(pid)
    }

    fn current_process_id(&self) -> u32 {
        unsafe { GetCurrentProcessId() }
    }

    fn capture(&mut self, handle: WindowHandle, method: CaptureMethod, out: &mut Vec<u8>) -> CaptureResult<(u32, u32)> {
        if !self.is_window(handle) {
            return Err(CaptureError::WindowGone);
        }
        Self::capture_gdi(hwnd(handle), method, out)
    }
}

/// Client size of the hooked game window.
pub struct GameWindowScreen {
    window: Arc<GameWindow>,
}

impl GameWindowScreen {
    pub fn new(window: Arc<GameWindow>) -> Self {
        Self { window }
    }
}

impl ScreenSource for GameWindowScreen {
    fn screen_size(&mut self) -> Option<ScreenMetrics> {
        let handle = self.window.get();
        if handle.is_none() {
            return None;
        }
        let (width, height) = Win32Windows::client_size(hwnd(handle)).ok()?;
        Some(ScreenMetrics::new(width as u32, height as u32))
    }
}
