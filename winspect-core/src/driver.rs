//! The per-window driver core: a validated window handle with cached
//! identity, window-level commands, and screenshot capture.
//!
//! Backend drivers (UIA / JAB / CV) wrap a [`WindowHandle`] and add a
//! `root()` that materialises the element tree for their surface.

#![cfg(windows)]

use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::errors::{Result, WinspectError};
use crate::geometry::Rect;
use crate::imaging::Raster;
use crate::template::ScreenSource;
use crate::win32;

/// Settle time after bringing a window to the foreground, letting the OS
/// finish the activation animation before a capture.
const FOREGROUND_SETTLE: Duration = Duration::from_millis(60);

/// A target window with its identity read once at open time.
#[derive(Debug, Clone, Serialize)]
pub struct WindowHandle {
    handle: isize,
    process_id: u32,
    process_name: String,
    window_name: String,
    class_name: String,
}

impl WindowHandle {
    /// Validate the handle and cache the window's identity.
    pub fn open(handle: isize) -> Result<Self> {
        if handle == 0 || !win32::is_window(handle) {
            return Err(WinspectError::BackendCall(format!(
                "invalid window handle: {handle}"
            )));
        }
        let process_id = win32::process_id(handle);
        Ok(Self {
            handle,
            process_id,
            process_name: win32::process_name(process_id),
            window_name: win32::window_text(handle),
            class_name: win32::class_name(handle),
        })
    }

    /// Locate a top-level window by class name and/or title.
    pub fn find(class: Option<&str>, title: Option<&str>) -> Result<Self> {
        let handle = win32::find_window(class, title)?;
        if handle == 0 {
            return Err(WinspectError::TargetNotFound(format!(
                "no window matching class={class:?} title={title:?}"
            )));
        }
        Self::open(handle)
    }

    /// The foreground window.
    pub fn foreground() -> Result<Self> {
        Self::open(win32::foreground_window())
    }

    pub fn handle(&self) -> isize {
        self.handle
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn window_name(&self) -> &str {
        &self.window_name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn rectangle(&self) -> Result<Rect> {
        win32::window_rect(self.handle)
    }

    // -- show-state commands ----------------------------------------------

    /// Show, un-minimise, and activate the window.
    pub fn set_foreground(&self) -> bool {
        win32::show(self.handle);
        win32::normal(self.handle);
        win32::set_foreground(self.handle)
    }

    pub fn show(&self) -> bool {
        win32::show(self.handle)
    }

    pub fn hide(&self) -> bool {
        win32::hide(self.handle)
    }

    pub fn normal(&self) -> bool {
        win32::normal(self.handle)
    }

    pub fn maximize(&self) -> bool {
        win32::maximize(self.handle)
    }

    pub fn minimize(&self) -> bool {
        win32::minimize(self.handle)
    }

    pub fn restore(&self) -> bool {
        win32::restore(self.handle)
    }

    pub fn is_minimized(&self) -> bool {
        win32::is_minimized(self.handle)
    }

    pub fn is_maximized(&self) -> bool {
        win32::is_maximized(self.handle)
    }

    pub fn is_normal(&self) -> bool {
        win32::is_normal(self.handle)
    }

    /// Move/resize; omitted components keep their current value.
    pub fn move_window(
        &self,
        x: Option<i32>,
        y: Option<i32>,
        width: Option<i32>,
        height: Option<i32>,
    ) -> Result<()> {
        win32::move_window(self.handle, x, y, width, height, true)
    }

    pub fn close(&self) -> bool {
        win32::close_window(self.handle)
    }

    // -- capture ------------------------------------------------------------

    /// Bring the window forward, wait for the OS to settle, and capture its
    /// content.  Saves to `path` (format from the extension) when given.
    pub fn screenshot(&self, path: Option<&Path>) -> Result<Raster> {
        self.set_foreground();
        thread::sleep(FOREGROUND_SETTLE);
        let raster = win32::capture_window(self.handle)?;
        if let Some(path) = path {
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)?;
                }
            }
            raster.to_rgb_image().save(path)?;
        }
        Ok(raster)
    }
}

impl ScreenSource for WindowHandle {
    fn capture(&self) -> Result<Raster> {
        self.screenshot(None)
    }
}
