//! Java Access Bridge 2.0.2 C ABI: structure layouts, constants, and the
//! typed symbol table.
//!
//! The structure layouts are fixed by the native API and must match
//! byte-for-byte: wide strings are fixed-size UTF-16 buffers, `JOBJECT64`
//! handles are 64-bit integers, booleans are 32-bit.  Field order follows
//! the published headers exactly -- do not reorder.

#![cfg(windows)]

/// 32-bit BOOL of the C ABI.
pub type JBool = i32;
/// 64-bit Java object handle.
pub type JObject64 = i64;
/// An accessible context handle.
pub type AccessibleContext = JObject64;
/// Java VM identifier (`long` in the C headers, 32-bit on Windows).
pub type VmId = i32;

pub const MAX_STRING_SIZE: usize = 1024;
pub const SHORT_STRING_SIZE: usize = 256;
pub const MAX_ACTION_INFO: usize = 256;
pub const MAX_ACTIONS_TO_DO: usize = 32;
pub const MAX_VISIBLE_CHILDREN: usize = 256;

/// Versions of the four bridge components, as reported by the DLL.
#[repr(C)]
pub struct AccessBridgeVersionInfo {
    pub vm_version: [u16; SHORT_STRING_SIZE],
    pub bridge_java_class_version: [u16; SHORT_STRING_SIZE],
    pub bridge_java_dll_version: [u16; SHORT_STRING_SIZE],
    pub bridge_win_dll_version: [u16; SHORT_STRING_SIZE],
}

/// The core per-context record.  Roles and state sets arrive as localized
/// and en-US strings; the en-US forms are the stable vocabulary.
#[repr(C)]
pub struct AccessibleContextInfo {
    pub name: [u16; MAX_STRING_SIZE],
    pub description: [u16; MAX_STRING_SIZE],
    pub role: [u16; SHORT_STRING_SIZE],
    pub role_en_us: [u16; SHORT_STRING_SIZE],
    pub states: [u16; SHORT_STRING_SIZE],
    pub states_en_us: [u16; SHORT_STRING_SIZE],
    pub index_in_parent: i32,
    pub children_count: i32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub accessible_component: JBool,
    pub accessible_action: JBool,
    pub accessible_selection: JBool,
    pub accessible_text: JBool,
    pub accessible_interfaces: JBool,
}

#[repr(C)]
pub struct AccessibleTextInfo {
    pub char_count: i32,
    pub caret_index: i32,
    pub index_at_point: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct AccessibleActionInfo {
    pub name: [u16; SHORT_STRING_SIZE],
}

#[repr(C)]
pub struct AccessibleActions {
    pub actions_count: i32,
    pub action_info: [AccessibleActionInfo; MAX_ACTION_INFO],
}

#[repr(C)]
pub struct AccessibleActionsToDo {
    pub actions_count: i32,
    pub actions: [AccessibleActionInfo; MAX_ACTIONS_TO_DO],
}

#[repr(C)]
pub struct VisibleChildrenInfo {
    pub returned_children_count: i32,
    pub children: [AccessibleContext; MAX_VISIBLE_CHILDREN],
}

macro_rules! zeroed_ctor {
    ($($ty:ty),+ $(,)?) => {
        $(impl $ty {
            /// All-zero out-parameter buffer.  Every field is plain old
            /// data, so the zero pattern is a valid value.
            pub fn zeroed() -> Self {
                unsafe { std::mem::zeroed() }
            }
        })+
    };
}

zeroed_ctor!(
    AccessBridgeVersionInfo,
    AccessibleContextInfo,
    AccessibleTextInfo,
    AccessibleActions,
    AccessibleActionsToDo,
    VisibleChildrenInfo,
);

/// Decode a fixed-size UTF-16 buffer, stopping at the first NUL; invalid
/// sequences decode with replacement.
pub fn wide_to_string(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

// ---------------------------------------------------------------------------
// Symbol signatures
// ---------------------------------------------------------------------------
//
// Window handles travel as pointer-sized integers; the C side declares the
// API `extern "C"` (cdecl), which coincides with the only convention on
// x64 and matches the 32-bit DLL as shipped.

pub type FnWindowsRun = unsafe extern "C" fn();
pub type FnIsJavaWindow = unsafe extern "C" fn(hwnd: isize) -> JBool;
pub type FnGetAccessibleContextFromHwnd =
    unsafe extern "C" fn(hwnd: isize, vmid: *mut VmId, ctx: *mut AccessibleContext) -> JBool;
pub type FnGetHwndFromAccessibleContext =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext) -> isize;
pub type FnReleaseJavaObject = unsafe extern "C" fn(vmid: VmId, object: JObject64);
pub type FnIsSameObject =
    unsafe extern "C" fn(vmid: VmId, a: JObject64, b: JObject64) -> JBool;
pub type FnGetVersionInfo =
    unsafe extern "C" fn(vmid: VmId, info: *mut AccessBridgeVersionInfo) -> JBool;
pub type FnGetAccessibleContextInfo =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext, info: *mut AccessibleContextInfo) -> JBool;
pub type FnGetAccessibleChildFromContext =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext, index: i32) -> AccessibleContext;
pub type FnGetAccessibleParentFromContext =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext) -> AccessibleContext;
pub type FnGetAccessibleContextAt = unsafe extern "C" fn(
    vmid: VmId,
    parent: AccessibleContext,
    x: i32,
    y: i32,
    ctx: *mut AccessibleContext,
) -> JBool;
pub type FnGetTopLevelObject =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext) -> AccessibleContext;
pub type FnGetObjectDepth = unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext) -> i32;
pub type FnGetAccessibleTextInfo = unsafe extern "C" fn(
    vmid: VmId,
    ctx: AccessibleContext,
    info: *mut AccessibleTextInfo,
    x: i32,
    y: i32,
) -> JBool;
pub type FnGetAccessibleTextRange = unsafe extern "C" fn(
    vmid: VmId,
    ctx: AccessibleContext,
    start: i32,
    end: i32,
    text: *mut u16,
    len: i16,
) -> JBool;
pub type FnGetAccessibleActions =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext, actions: *mut AccessibleActions) -> JBool;
pub type FnDoAccessibleActions = unsafe extern "C" fn(
    vmid: VmId,
    ctx: AccessibleContext,
    todo: *const AccessibleActionsToDo,
    failure_index: *mut i32,
) -> JBool;
pub type FnSetTextContents =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext, text: *const u16) -> JBool;
pub type FnRequestFocus = unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext) -> JBool;
pub type FnGetVisibleChildrenCount =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext) -> i32;
pub type FnGetVisibleChildren = unsafe extern "C" fn(
    vmid: VmId,
    ctx: AccessibleContext,
    start_index: i32,
    children: *mut VisibleChildrenInfo,
) -> JBool;
pub type FnGetCurrentAccessibleValueFromContext = unsafe extern "C" fn(
    vmid: VmId,
    ctx: AccessibleContext,
    value: *mut u16,
    len: i16,
) -> JBool;
pub type FnAddAccessibleSelectionFromContext =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext, index: i32);
pub type FnClearAccessibleSelectionFromContext =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext);
pub type FnGetAccessibleSelectionCountFromContext =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext) -> i32;
pub type FnIsAccessibleChildSelectedFromContext =
    unsafe extern "C" fn(vmid: VmId, ctx: AccessibleContext, index: i32) -> JBool;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
