//! The Windows Access Bridge DLL binding: a process-wide singleton that
//! loads the architecture-matched DLL, optionally installs the companion
//! files next to the Java runtime, starts the bridge, and pumps Windows
//! messages on a dedicated thread so JAB callbacks fire.
//!
//! Initialisation happens at most once per process, behind a one-shot
//! guard.  [`Bridge::shutdown`] stops the pump; the DLL stays loaded for
//! the life of the process.

#![cfg(windows)]

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use libloading::Library;
use parking_lot::Mutex;

use super::ffi::{self, AccessibleContext, JObject64, VmId};
use crate::errors::{Result, WinspectError};

/// Message-pump wake granularity.
const PUMP_TIMEOUT_MS: u32 = 200;

/// `"32"` or `"64"`, matching the DLL file names.
fn arch_suffix() -> &'static str {
    if cfg!(target_pointer_width = "64") {
        "64"
    } else {
        "32"
    }
}

fn system_root() -> PathBuf {
    std::env::var_os("SYSTEMROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("C:\\Windows"))
}

/// `JAVA_HOME`, or the `java.home` property of the `java` on PATH.
fn java_home() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os("JAVA_HOME") {
        return Some(PathBuf::from(home));
    }
    let output = std::process::Command::new("java")
        .args(["-XshowSettings:properties", "-version"])
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(if output.stdout.is_empty() {
        &output.stderr
    } else {
        &output.stdout
    })
    .into_owned();
    text.lines()
        .find(|line| line.trim_start().starts_with("java.home"))
        .and_then(|line| line.split_once('='))
        .map(|(_, value)| PathBuf::from(value.trim()))
}

/// The support files and where each belongs.
fn install_plan(java_home: &Path) -> Vec<(String, PathBuf)> {
    let arch = arch_suffix();
    vec![
        (
            format!("WindowsAccessBridge-{arch}.dll"),
            system_root().join("System32"),
        ),
        (format!("JavaAccessBridge-{arch}.dll"), java_home.join("bin")),
        (format!("JAWTAccessBridge-{arch}.dll"), java_home.join("bin")),
        ("accessibility.properties".into(), java_home.join("lib")),
        (
            format!("access-bridge-{arch}.jar"),
            java_home.join("lib").join("ext"),
        ),
        ("jaccess.jar".into(), java_home.join("lib").join("ext")),
    ]
}

/// Copy the bridge support files from `source_dir` to their destinations.
/// Files already present are left untouched.
pub fn install_support_files(source_dir: &Path) -> Result<()> {
    let Some(home) = java_home() else {
        return Err(WinspectError::BackendCall(
            "no Java runtime found (set JAVA_HOME or put java on PATH)".into(),
        ));
    };
    for (file, dst_dir) in install_plan(&home) {
        let dst = dst_dir.join(&file);
        if dst.exists() {
            continue;
        }
        let src = source_dir.join(&file);
        if !src.is_file() {
            return Err(WinspectError::FileNotExist(src.display().to_string()));
        }
        std::fs::create_dir_all(&dst_dir)?;
        std::fs::copy(&src, &dst)?;
        log::info!("installed bridge file {} -> {}", file, dst.display());
    }
    Ok(())
}

fn dll_path() -> PathBuf {
    if let Some(explicit) = std::env::var_os("WINSPECT_JAB_DLL") {
        return PathBuf::from(explicit);
    }
    system_root()
        .join("System32")
        .join(format!("WindowsAccessBridge-{}.dll", arch_suffix()))
}

// ---------------------------------------------------------------------------
// The singleton
// ---------------------------------------------------------------------------

struct Pump {
    stop_event: isize,
    thread: JoinHandle<()>,
}

/// Loaded bridge library plus its message pump.
pub struct Bridge {
    lib: Library,
    pump: Mutex<Option<Pump>>,
}

// the library handle and the raw symbols it yields are plain pointers into
// a DLL that stays loaded for the process lifetime
unsafe impl Send for Bridge {}
unsafe impl Sync for Bridge {}

static INSTANCE: OnceLock<std::result::Result<Arc<Bridge>, String>> = OnceLock::new();

impl Bridge {
    /// The process-wide bridge, initialising it on first use.
    ///
    /// A failed initialisation is sticky: later callers see the same error
    /// without retrying the load.
    pub fn instance() -> Result<Arc<Bridge>> {
        INSTANCE
            .get_or_init(|| Bridge::start().map_err(|e| e.to_string()))
            .clone()
            .map_err(WinspectError::BackendCall)
    }

    fn start() -> Result<Arc<Bridge>> {
        let path = dll_path();
        if !path.is_file() {
            return Err(WinspectError::FileNotExist(format!(
                "WindowsAccessBridge DLL not found at {} (install the JAB \
                 support files or set WINSPECT_JAB_DLL)",
                path.display()
            )));
        }
        let lib = unsafe { Library::new(&path) }.map_err(|e| {
            WinspectError::BackendCall(format!("failed to load {}: {e}", path.display()))
        })?;

        let windows_run: ffi::FnWindowsRun = unsafe {
            *lib.get(b"Windows_run\0").map_err(|e| {
                WinspectError::BackendCall(format!("Windows_run not exported: {e}"))
            })?
        };

        let pump = spawn_pump(windows_run)?;
        let bridge = Arc::new(Bridge { lib, pump: Mutex::new(Some(pump)) });
        log::info!("Java Access Bridge started from {}", path.display());
        Ok(bridge)
    }

    /// Stop the message pump.  Contexts obtained earlier stay valid for
    /// release, but no further callbacks are delivered.
    pub fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().take() {
            unsafe {
                use windows::Win32::Foundation::HANDLE;
                use windows::Win32::System::Threading::SetEvent;
                let _ = SetEvent(HANDLE(pump.stop_event as *mut core::ffi::c_void));
            }
            let _ = pump.thread.join();
        }
    }

    fn sym<T: Copy>(&self, name: &[u8]) -> Result<T> {
        unsafe {
            self.lib.get::<T>(name).map(|s| *s).map_err(|e| {
                WinspectError::BackendCall(format!(
                    "symbol {} missing: {e}",
                    String::from_utf8_lossy(&name[..name.len() - 1])
                ))
            })
        }
    }

    // -- typed wrappers ----------------------------------------------------

    pub fn is_java_window(&self, hwnd: isize) -> bool {
        self.sym::<ffi::FnIsJavaWindow>(b"isJavaWindow\0")
            .map(|f| unsafe { f(hwnd) } != 0)
            .unwrap_or(false)
    }

    pub fn accessible_context_from_hwnd(&self, hwnd: isize) -> Result<(VmId, AccessibleContext)> {
        let f = self.sym::<ffi::FnGetAccessibleContextFromHwnd>(b"getAccessibleContextFromHWND\0")?;
        let mut vmid: VmId = 0;
        let mut ctx: AccessibleContext = 0;
        if unsafe { f(hwnd, &mut vmid, &mut ctx) } == 0 || ctx == 0 {
            return Err(WinspectError::BackendCall(format!(
                "getAccessibleContextFromHWND failed for window {hwnd}"
            )));
        }
        Ok((vmid, ctx))
    }

    pub fn release_java_object(&self, vmid: VmId, object: JObject64) {
        if let Ok(f) = self.sym::<ffi::FnReleaseJavaObject>(b"releaseJavaObject\0") {
            unsafe { f(vmid, object) };
        }
    }

    pub fn is_same_object(&self, vmid: VmId, a: JObject64, b: JObject64) -> bool {
        self.sym::<ffi::FnIsSameObject>(b"isSameObject\0")
            .map(|f| unsafe { f(vmid, a, b) } != 0)
            .unwrap_or(false)
    }

    pub fn version_info(&self, vmid: VmId) -> Result<ffi::AccessBridgeVersionInfo> {
        let f = self.sym::<ffi::FnGetVersionInfo>(b"getVersionInfo\0")?;
        let mut info = ffi::AccessBridgeVersionInfo::zeroed();
        if unsafe { f(vmid, &mut info) } == 0 {
            return Err(WinspectError::BackendCall("getVersionInfo failed".into()));
        }
        Ok(info)
    }

    pub fn context_info(&self, vmid: VmId, ctx: AccessibleContext) -> Result<ffi::AccessibleContextInfo> {
        let f = self.sym::<ffi::FnGetAccessibleContextInfo>(b"getAccessibleContextInfo\0")?;
        let mut info = ffi::AccessibleContextInfo::zeroed();
        if unsafe { f(vmid, ctx, &mut info) } == 0 {
            return Err(WinspectError::BackendCall(format!(
                "getAccessibleContextInfo failed for context {ctx}"
            )));
        }
        Ok(info)
    }

    /// Child context by index; 0 when absent.
    pub fn child_from_context(&self, vmid: VmId, ctx: AccessibleContext, index: i32) -> AccessibleContext {
        self.sym::<ffi::FnGetAccessibleChildFromContext>(b"getAccessibleChildFromContext\0")
            .map(|f| unsafe { f(vmid, ctx, index) })
            .unwrap_or(0)
    }

    /// Parent context; 0 at the root.
    pub fn parent_from_context(&self, vmid: VmId, ctx: AccessibleContext) -> AccessibleContext {
        self.sym::<ffi::FnGetAccessibleParentFromContext>(b"getAccessibleParentFromContext\0")
            .map(|f| unsafe { f(vmid, ctx) })
            .unwrap_or(0)
    }

    pub fn context_at(&self, vmid: VmId, parent: AccessibleContext, x: i32, y: i32) -> Option<AccessibleContext> {
        let f = self
            .sym::<ffi::FnGetAccessibleContextAt>(b"getAccessibleContextAt\0")
            .ok()?;
        let mut ctx: AccessibleContext = 0;
        (unsafe { f(vmid, parent, x, y, &mut ctx) } != 0 && ctx != 0).then_some(ctx)
    }

    pub fn top_level_object(&self, vmid: VmId, ctx: AccessibleContext) -> AccessibleContext {
        self.sym::<ffi::FnGetTopLevelObject>(b"getTopLevelObject\0")
            .map(|f| unsafe { f(vmid, ctx) })
            .unwrap_or(0)
    }

    pub fn object_depth(&self, vmid: VmId, ctx: AccessibleContext) -> i32 {
        self.sym::<ffi::FnGetObjectDepth>(b"getObjectDepth\0")
            .map(|f| unsafe { f(vmid, ctx) })
            .unwrap_or(-1)
    }

    pub fn text_info(&self, vmid: VmId, ctx: AccessibleContext) -> Option<ffi::AccessibleTextInfo> {
        let f = self
            .sym::<ffi::FnGetAccessibleTextInfo>(b"getAccessibleTextInfo\0")
            .ok()?;
        let mut info = ffi::AccessibleTextInfo::zeroed();
        (unsafe { f(vmid, ctx, &mut info, 0, 0) } != 0).then_some(info)
    }

    /// Read `[start, end]` (inclusive) characters of the context's text.
    pub fn text_range(&self, vmid: VmId, ctx: AccessibleContext, start: i32, end: i32) -> Option<String> {
        let f = self
            .sym::<ffi::FnGetAccessibleTextRange>(b"getAccessibleTextRange\0")
            .ok()?;
        let len = (end - start + 1).max(0) as usize;
        if len == 0 {
            return Some(String::new());
        }
        let mut buf = vec![0u16; len + 1];
        let ok = unsafe { f(vmid, ctx, start, end, buf.as_mut_ptr(), buf.len() as i16) } != 0;
        ok.then(|| ffi::wide_to_string(&buf))
    }

    pub fn actions(&self, vmid: VmId, ctx: AccessibleContext) -> Option<Box<ffi::AccessibleActions>> {
        let f = self
            .sym::<ffi::FnGetAccessibleActions>(b"getAccessibleActions\0")
            .ok()?;
        // the actions table is ~128 KiB; keep it off the stack
        let mut actions = Box::new(ffi::AccessibleActions::zeroed());
        (unsafe { f(vmid, ctx, actions.as_mut()) } != 0).then_some(actions)
    }

    /// Execute one named action; true when the bridge reports success.
    pub fn do_action(&self, vmid: VmId, ctx: AccessibleContext, name: &[u16]) -> bool {
        let Ok(f) = self.sym::<ffi::FnDoAccessibleActions>(b"doAccessibleActions\0") else {
            return false;
        };
        let mut todo = Box::new(ffi::AccessibleActionsToDo::zeroed());
        todo.actions_count = 1;
        let n = name.len().min(ffi::SHORT_STRING_SIZE - 1);
        todo.actions[0].name[..n].copy_from_slice(&name[..n]);
        let mut failure_index: i32 = 0;
        let ok = unsafe { f(vmid, ctx, todo.as_ref(), &mut failure_index) } != 0;
        ok && failure_index == -1
    }

    pub fn set_text_contents(&self, vmid: VmId, ctx: AccessibleContext, text: &str) -> bool {
        let Ok(f) = self.sym::<ffi::FnSetTextContents>(b"setTextContents\0") else {
            return false;
        };
        let wide: Vec<u16> = text.encode_utf16().chain(std::iter::once(0)).collect();
        unsafe { f(vmid, ctx, wide.as_ptr()) != 0 }
    }

    pub fn request_focus(&self, vmid: VmId, ctx: AccessibleContext) -> bool {
        self.sym::<ffi::FnRequestFocus>(b"requestFocus\0")
            .map(|f| unsafe { f(vmid, ctx) } != 0)
            .unwrap_or(false)
    }

    /// The accessible value (sliders, progress bars) as a string.
    pub fn current_value(&self, vmid: VmId, ctx: AccessibleContext) -> Option<String> {
        let f = self
            .sym::<ffi::FnGetCurrentAccessibleValueFromContext>(
                b"getCurrentAccessibleValueFromContext\0",
            )
            .ok()?;
        let mut buf = [0u16; ffi::SHORT_STRING_SIZE];
        let ok = unsafe { f(vmid, ctx, buf.as_mut_ptr(), buf.len() as i16) } != 0;
        ok.then(|| ffi::wide_to_string(&buf))
    }

    pub fn add_selection(&self, vmid: VmId, ctx: AccessibleContext, index: i32) {
        if let Ok(f) = self.sym::<ffi::FnAddAccessibleSelectionFromContext>(
            b"addAccessibleSelectionFromContext\0",
        ) {
            unsafe { f(vmid, ctx, index) };
        }
    }

    pub fn clear_selection(&self, vmid: VmId, ctx: AccessibleContext) {
        if let Ok(f) = self.sym::<ffi::FnClearAccessibleSelectionFromContext>(
            b"clearAccessibleSelectionFromContext\0",
        ) {
            unsafe { f(vmid, ctx) };
        }
    }

    pub fn selection_count(&self, vmid: VmId, ctx: AccessibleContext) -> i32 {
        self.sym::<ffi::FnGetAccessibleSelectionCountFromContext>(
            b"getAccessibleSelectionCountFromContext\0",
        )
        .map(|f| unsafe { f(vmid, ctx) })
        .unwrap_or(0)
    }

    pub fn is_child_selected(&self, vmid: VmId, ctx: AccessibleContext, index: i32) -> bool {
        self.sym::<ffi::FnIsAccessibleChildSelectedFromContext>(
            b"isAccessibleChildSelectedFromContext\0",
        )
        .map(|f| unsafe { f(vmid, ctx, index) } != 0)
        .unwrap_or(false)
    }

    pub fn visible_children_count(&self, vmid: VmId, ctx: AccessibleContext) -> i32 {
        self.sym::<ffi::FnGetVisibleChildrenCount>(b"getVisibleChildrenCount\0")
            .map(|f| unsafe { f(vmid, ctx) })
            .unwrap_or(-1)
    }

    /// Visible child contexts starting at `start_index`, or `None` when the
    /// call is unsupported.
    pub fn visible_children(
        &self,
        vmid: VmId,
        ctx: AccessibleContext,
        start_index: i32,
    ) -> Option<Vec<AccessibleContext>> {
        let f = self
            .sym::<ffi::FnGetVisibleChildren>(b"getVisibleChildren\0")
            .ok()?;
        let mut info = Box::new(ffi::VisibleChildrenInfo::zeroed());
        if unsafe { f(vmid, ctx, start_index, info.as_mut()) } == 0 {
            return None;
        }
        let count = info.returned_children_count.clamp(0, ffi::MAX_VISIBLE_CHILDREN as i32);
        Some(
            info.children[..count as usize]
                .iter()
                .copied()
                .filter(|&c| c != 0)
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Message pump
// ---------------------------------------------------------------------------

/// Start the bridge on a dedicated thread and pump messages until the stop
/// event fires.  `Windows_run` must execute on the pumping thread, so the
/// startup handshake waits for the thread to report in.
fn spawn_pump(windows_run: ffi::FnWindowsRun) -> Result<Pump> {
    use windows::Win32::Foundation::{HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows::Win32::System::Threading::CreateEventW;
    use windows::Win32::UI::WindowsAndMessaging::{
        DispatchMessageW, MsgWaitForMultipleObjects, PeekMessageW, TranslateMessage, MSG,
        PM_REMOVE, QS_ALLINPUT,
    };

    let stop_event = unsafe { CreateEventW(None, false, false, None) }
        .map_err(|e| WinspectError::BackendCall(format!("CreateEventW: {e}")))?;
    let stop_raw = stop_event.0 as isize;

    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    let thread = std::thread::Builder::new()
        .name("winspect-jab-pump".into())
        .spawn(move || {
            unsafe { windows_run() };
            let _ = ready_tx.send(());
            let stop = HANDLE(stop_raw as *mut core::ffi::c_void);
            loop {
                let wait = unsafe {
                    MsgWaitForMultipleObjects(Some(&[stop]), false, PUMP_TIMEOUT_MS, QS_ALLINPUT)
                };
                if wait == WAIT_OBJECT_0 {
                    break;
                }
                if wait == WAIT_TIMEOUT {
                    continue;
                }
                // drain whatever queued; this is what lets JAB callbacks run
                let mut msg = MSG::default();
                while unsafe { PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE) }.as_bool() {
                    unsafe {
                        let _ = TranslateMessage(&msg);
                        DispatchMessageW(&msg);
                    }
                }
            }
        })
        .map_err(|e| WinspectError::BackendCall(format!("failed to spawn pump thread: {e}")))?;

    ready_rx
        .recv_timeout(std::time::Duration::from_secs(10))
        .map_err(|_| WinspectError::BackendCall("bridge startup timed out".into()))?;
    Ok(Pump { stop_event: stop_raw, thread })
}
