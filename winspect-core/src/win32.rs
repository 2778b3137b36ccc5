//! Win32 window plumbing: identity readers, show/move/placement commands,
//! cursor queries, and GDI raster capture.
//!
//! All functions take and return plain values (`isize` handles, owned
//! strings, [`Raster`]) -- raw pointers never cross this module's boundary.
//! Window content is captured with `PrintWindow`, which works for windows
//! that are covered by other windows (but not minimised ones); whole-screen
//! rectangles use a `BitBlt` from the screen DC.

#![cfg(windows)]

use std::ffi::OsString;
use std::os::windows::ffi::OsStringExt;
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde::Serialize;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{BOOL, HWND, LPARAM, POINT, RECT, TRUE, WPARAM};
use windows::Win32::Graphics::Dwm::{DwmGetWindowAttribute, DWMWA_CLOAKED};
use windows::Win32::Graphics::Gdi::{
    BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC, GetDIBits,
    GetWindowDC, ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS,
    SRCCOPY,
};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, FindWindowW, GetClassNameW, GetCursorPos, GetForegroundWindow, GetWindow,
    GetWindowLongW, GetWindowPlacement, GetWindowRect, GetWindowTextLengthW, GetWindowTextW,
    GetWindowThreadProcessId, IsIconic, IsWindow, IsWindowVisible, IsZoomed, MoveWindow,
    PostMessageW, PrintWindow, SetForegroundWindow, ShowWindow, WindowFromPoint, GWL_EXSTYLE,
    GWL_STYLE, GW_OWNER, PRINT_WINDOW_FLAGS, SHOW_WINDOW_CMD, SW_HIDE, SW_MAXIMIZE, SW_MINIMIZE,
    SW_RESTORE, SW_SHOW, SW_SHOWMAXIMIZED, SW_SHOWMINIMIZED, SW_SHOWNORMAL, WINDOWPLACEMENT,
    WM_CLOSE, WS_EX_APPWINDOW, WS_EX_NOACTIVATE, WS_EX_TOOLWINDOW, WS_VISIBLE,
};

use crate::errors::{Result, WinspectError};
use crate::geometry::{Point, Rect};
use crate::imaging::Raster;

/// `PrintWindow` flag asking DWM for the full content, including parts
/// rendered off the legacy GDI path.
const PW_RENDERFULLCONTENT: PRINT_WINDOW_FLAGS = PRINT_WINDOW_FLAGS(2);

#[inline]
fn hwnd(handle: isize) -> HWND {
    HWND(handle as *mut core::ffi::c_void)
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

// ---------------------------------------------------------------------------
// Identity readers
// ---------------------------------------------------------------------------

/// Whether the handle still refers to an existing window.
pub fn is_window(handle: isize) -> bool {
    unsafe { IsWindow(hwnd(handle)) }.as_bool()
}

pub fn is_window_visible(handle: isize) -> bool {
    unsafe { IsWindowVisible(hwnd(handle)) }.as_bool()
}

/// Read the window title (empty for untitled windows).
pub fn window_text(handle: isize) -> String {
    let len = unsafe { GetWindowTextLengthW(hwnd(handle)) };
    if len <= 0 {
        return String::new();
    }
    let mut buf = vec![0u16; (len + 1) as usize];
    let copied = unsafe { GetWindowTextW(hwnd(handle), &mut buf) };
    if copied <= 0 {
        return String::new();
    }
    OsString::from_wide(&buf[..copied as usize])
        .to_string_lossy()
        .into_owned()
}

/// Read the window class name (up to 256 chars).
pub fn class_name(handle: isize) -> String {
    let mut buf = [0u16; 256];
    let len = unsafe { GetClassNameW(hwnd(handle), &mut buf) };
    if len <= 0 {
        return String::new();
    }
    OsString::from_wide(&buf[..len as usize])
        .to_string_lossy()
        .into_owned()
}

/// Owning process id of the window.
pub fn process_id(handle: isize) -> u32 {
    let mut pid: u32 = 0;
    unsafe { GetWindowThreadProcessId(hwnd(handle), Some(&mut pid)) };
    pid
}

/// Executable name for a process id, via the shared `sysinfo` snapshot.
pub fn process_name(pid: u32) -> String {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    static SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();
    let mut system = SYSTEM.get_or_init(|| Mutex::new(System::new())).lock();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system
        .process(Pid::from_u32(pid))
        .map(|p| p.name().to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Locate a top-level window by class name and/or title.
pub fn find_window(class: Option<&str>, title: Option<&str>) -> Result<isize> {
    let class_w = class.map(wide);
    let title_w = title.map(wide);
    let found = unsafe {
        FindWindowW(
            class_w
                .as_ref()
                .map_or(PCWSTR::null(), |v| PCWSTR(v.as_ptr())),
            title_w
                .as_ref()
                .map_or(PCWSTR::null(), |v| PCWSTR(v.as_ptr())),
        )
    }
    .map_err(|e| WinspectError::BackendCall(format!("FindWindowW: {e}")))?;
    Ok(found.0 as isize)
}

pub fn foreground_window() -> isize {
    (unsafe { GetForegroundWindow() }).0 as isize
}

/// Current cursor position, if readable.
pub fn cursor_pos() -> Option<Point> {
    let mut p = POINT::default();
    unsafe { GetCursorPos(&mut p) }.ok()?;
    Some(Point::new(p.x, p.y))
}

/// Window under a screen point (0 when none).
pub fn window_from_point(point: Point) -> isize {
    let p = POINT { x: point.x, y: point.y };
    (unsafe { WindowFromPoint(p) }).0 as isize
}

// ---------------------------------------------------------------------------
// Window enumeration
// ---------------------------------------------------------------------------

/// Owned summary of one visible top-level window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowInfo {
    pub hwnd: isize,
    pub title: String,
    pub class_name: String,
    pub pid: u32,
    pub rect: Rect,
    pub is_minimized: bool,
    pub is_maximized: bool,
}

/// A window on another virtual desktop or a suspended UWP app passes
/// `IsWindowVisible` while DWM keeps it invisible ("cloaked").
fn is_cloaked(handle: HWND) -> bool {
    let mut cloaked: u32 = 0;
    let hr = unsafe {
        DwmGetWindowAttribute(
            handle,
            DWMWA_CLOAKED,
            &mut cloaked as *mut u32 as *mut _,
            std::mem::size_of::<u32>() as u32,
        )
    };
    hr.is_ok() && cloaked != 0
}

fn has_visible_owner(handle: HWND) -> bool {
    match unsafe { GetWindow(handle, GW_OWNER) } {
        Ok(owner) if !owner.is_invalid() => unsafe { IsWindowVisible(owner) }.as_bool(),
        _ => false,
    }
}

/// The canonical Alt+Tab filter: visible, not a tool window, not
/// cloaked, and not owned by another visible window (unless explicitly
/// marked as an app window).
fn is_alt_tab_window(handle: HWND) -> bool {
    let style = unsafe { GetWindowLongW(handle, GWL_STYLE) } as u32;
    let ex_style = unsafe { GetWindowLongW(handle, GWL_EXSTYLE) } as u32;
    if style & WS_VISIBLE.0 == 0 {
        return false;
    }
    if ex_style & WS_EX_TOOLWINDOW.0 != 0 || ex_style & WS_EX_NOACTIVATE.0 != 0 {
        return false;
    }
    if is_cloaked(handle) {
        return false;
    }
    if has_visible_owner(handle) && ex_style & WS_EX_APPWINDOW.0 == 0 {
        return false;
    }
    true
}

unsafe extern "system" fn enum_callback(handle: HWND, lparam: LPARAM) -> BOOL {
    let handles = unsafe { &mut *(lparam.0 as *mut Vec<HWND>) };
    if unsafe { IsWindowVisible(handle) }.as_bool()
        && is_alt_tab_window(handle)
        && unsafe { GetWindowTextLengthW(handle) } > 0
    {
        handles.push(handle);
    }
    TRUE
}

/// Handles of the visible, titled, Alt+Tab-able top-level windows.
pub fn enumerate_windows() -> Result<Vec<isize>> {
    let mut handles: Vec<HWND> = Vec::with_capacity(64);
    unsafe {
        EnumWindows(
            Some(enum_callback),
            LPARAM(&mut handles as *mut Vec<HWND> as isize),
        )
    }
    .map_err(|e| WinspectError::BackendCall(format!("EnumWindows failed: {e}")))?;
    Ok(handles.iter().map(|h| h.0 as isize).collect())
}

/// Enumerate and describe every visible top-level window.  Windows that
/// vanish between enumeration and inspection are skipped.
pub fn list_windows() -> Result<Vec<WindowInfo>> {
    let handles = enumerate_windows()?;
    let mut windows = Vec::with_capacity(handles.len());
    for handle in handles {
        let Ok(rect) = window_rect(handle) else {
            continue;
        };
        windows.push(WindowInfo {
            hwnd: handle,
            title: window_text(handle),
            class_name: class_name(handle),
            pid: process_id(handle),
            rect,
            is_minimized: is_minimized(handle),
            is_maximized: is_maximized(handle),
        });
    }
    Ok(windows)
}

// ---------------------------------------------------------------------------
// Geometry and show-state commands
// ---------------------------------------------------------------------------

pub fn window_rect(handle: isize) -> Result<Rect> {
    let mut rect = RECT::default();
    unsafe { GetWindowRect(hwnd(handle), &mut rect) }
        .map_err(|e| WinspectError::BackendCall(format!("GetWindowRect({handle}): {e}")))?;
    Ok(Rect::new(rect.left, rect.top, rect.right, rect.bottom))
}

pub fn show_window(handle: isize, cmd: SHOW_WINDOW_CMD) -> bool {
    unsafe { ShowWindow(hwnd(handle), cmd) }.as_bool()
}

pub fn show(handle: isize) -> bool {
    show_window(handle, SW_SHOW)
}

pub fn hide(handle: isize) -> bool {
    show_window(handle, SW_HIDE)
}

pub fn normal(handle: isize) -> bool {
    show_window(handle, SW_SHOWNORMAL)
}

pub fn maximize(handle: isize) -> bool {
    show_window(handle, SW_MAXIMIZE)
}

pub fn minimize(handle: isize) -> bool {
    show_window(handle, SW_MINIMIZE)
}

pub fn restore(handle: isize) -> bool {
    show_window(handle, SW_RESTORE)
}

pub fn set_foreground(handle: isize) -> bool {
    unsafe { SetForegroundWindow(hwnd(handle)) }.as_bool()
}

/// The window's current show command from `GetWindowPlacement`.
fn placement_cmd(handle: isize) -> u32 {
    let mut wp = WINDOWPLACEMENT {
        length: std::mem::size_of::<WINDOWPLACEMENT>() as u32,
        ..Default::default()
    };
    let _ = unsafe { GetWindowPlacement(hwnd(handle), &mut wp) };
    wp.showCmd
}

pub fn is_minimized(handle: isize) -> bool {
    placement_cmd(handle) == SW_SHOWMINIMIZED.0 as u32 || unsafe { IsIconic(hwnd(handle)) }.as_bool()
}

pub fn is_maximized(handle: isize) -> bool {
    placement_cmd(handle) == SW_SHOWMAXIMIZED.0 as u32 || unsafe { IsZoomed(hwnd(handle)) }.as_bool()
}

pub fn is_normal(handle: isize) -> bool {
    placement_cmd(handle) == SW_SHOWNORMAL.0 as u32
}

/// Move/resize the window; omitted components keep their current value.
pub fn move_window(
    handle: isize,
    x: Option<i32>,
    y: Option<i32>,
    width: Option<i32>,
    height: Option<i32>,
    repaint: bool,
) -> Result<()> {
    let current = window_rect(handle)?;
    let x = x.unwrap_or(current.left);
    let y = y.unwrap_or(current.top);
    let width = width.unwrap_or(current.width());
    let height = height.unwrap_or(current.height());
    unsafe { MoveWindow(hwnd(handle), x, y, width, height, repaint) }
        .map_err(|e| WinspectError::BackendCall(format!("MoveWindow({handle}): {e}")))
}

/// Ask the window to close (`WM_CLOSE`; the application may refuse).
pub fn close_window(handle: isize) -> bool {
    unsafe { PostMessageW(hwnd(handle), WM_CLOSE, WPARAM(0), LPARAM(0)) }.is_ok()
}

// ---------------------------------------------------------------------------
// Raster capture
// ---------------------------------------------------------------------------

/// Convert a 32-bit top-down BGRA DIB buffer into a BGR raster.
fn bgra_to_raster(width: u32, height: u32, bgra: &[u8]) -> Result<Raster> {
    let mut bgr = Vec::with_capacity((width * height * 3) as usize);
    for px in bgra.chunks_exact(4) {
        bgr.extend_from_slice(&px[..3]);
    }
    Raster::from_bgr(width, height, bgr)
}

/// Capture one window's content via `PrintWindow`.
pub fn capture_window(handle: isize) -> Result<Raster> {
    let rect = window_rect(handle)?;
    let (width, height) = (rect.width(), rect.height());
    if width <= 0 || height <= 0 {
        return Err(WinspectError::BackendCall(format!(
            "window {handle} has an empty rectangle"
        )));
    }

    unsafe {
        let window_dc = GetWindowDC(hwnd(handle));
        if window_dc.is_invalid() {
            return Err(WinspectError::BackendCall("GetWindowDC failed".into()));
        }
        let result = (|| -> Result<Raster> {
            let mem_dc = CreateCompatibleDC(window_dc);
            if mem_dc.is_invalid() {
                return Err(WinspectError::BackendCall("CreateCompatibleDC failed".into()));
            }
            let bitmap = CreateCompatibleBitmap(window_dc, width, height);
            if bitmap.is_invalid() {
                let _ = DeleteDC(mem_dc);
                return Err(WinspectError::BackendCall("CreateCompatibleBitmap failed".into()));
            }
            let old = SelectObject(mem_dc, bitmap);

            let printed = PrintWindow(hwnd(handle), mem_dc, PW_RENDERFULLCONTENT).as_bool();
            let pixels = if printed {
                read_dib(mem_dc, bitmap, width as u32, height as u32)
            } else {
                Err(WinspectError::BackendCall(format!(
                    "PrintWindow failed for window {handle}"
                )))
            };

            SelectObject(mem_dc, old);
            let _ = DeleteObject(bitmap);
            let _ = DeleteDC(mem_dc);
            pixels
        })();
        ReleaseDC(hwnd(handle), window_dc);
        result
    }
}

/// Capture a screen-absolute rectangle via `BitBlt` from the screen DC.
pub fn capture_screen_rect(rect: Rect) -> Result<Raster> {
    let (width, height) = (rect.width(), rect.height());
    if width <= 0 || height <= 0 {
        return Err(WinspectError::InvalidArgument(format!(
            "empty capture rectangle {rect:?}"
        )));
    }

    unsafe {
        let screen_dc = GetDC(HWND(std::ptr::null_mut()));
        if screen_dc.is_invalid() {
            return Err(WinspectError::BackendCall("GetDC(NULL) failed".into()));
        }
        let result = (|| -> Result<Raster> {
            let mem_dc = CreateCompatibleDC(screen_dc);
            if mem_dc.is_invalid() {
                return Err(WinspectError::BackendCall("CreateCompatibleDC failed".into()));
            }
            let bitmap = CreateCompatibleBitmap(screen_dc, width, height);
            if bitmap.is_invalid() {
                let _ = DeleteDC(mem_dc);
                return Err(WinspectError::BackendCall("CreateCompatibleBitmap failed".into()));
            }
            let old = SelectObject(mem_dc, bitmap);

            let blitted = BitBlt(
                mem_dc, 0, 0, width, height, screen_dc, rect.left, rect.top, SRCCOPY,
            );
            let pixels = match blitted {
                Ok(()) => read_dib(mem_dc, bitmap, width as u32, height as u32),
                Err(e) => Err(WinspectError::BackendCall(format!("BitBlt failed: {e}"))),
            };

            SelectObject(mem_dc, old);
            let _ = DeleteObject(bitmap);
            let _ = DeleteDC(mem_dc);
            pixels
        })();
        ReleaseDC(HWND(std::ptr::null_mut()), screen_dc);
        result
    }
}

/// Read a selected bitmap out of a memory DC as top-down 32-bit BGRA.
unsafe fn read_dib(
    mem_dc: windows::Win32::Graphics::Gdi::HDC,
    bitmap: windows::Win32::Graphics::Gdi::HBITMAP,
    width: u32,
    height: u32,
) -> Result<Raster> {
    let mut pixels = vec![0u8; (width * height * 4) as usize];
    let bmi = BITMAPINFO {
        bmiHeader: BITMAPINFOHEADER {
            biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
            biWidth: width as i32,
            // negative height = top-down rows
            biHeight: -(height as i32),
            biPlanes: 1,
            biBitCount: 32,
            biCompression: BI_RGB.0,
            ..Default::default()
        },
        bmiColors: [Default::default()],
    };
    let lines = GetDIBits(
        mem_dc,
        bitmap,
        0,
        height,
        Some(pixels.as_mut_ptr() as *mut _),
        &bmi as *const _ as *mut _,
        DIB_RGB_COLORS,
    );
    if lines == 0 {
        return Err(WinspectError::BackendCall("GetDIBits failed".into()));
    }
    bgra_to_raster(width, height, &pixels)
}
