//! UI Automation backend: the OS accessibility tree mapped onto the
//! element model.
//!
//! Property reads use the live `Current*` accessors.  Depth is tracked
//! virtually (parent depth + 1) because UIA does not expose it uniformly.
//! Role-specific behaviour (checked / selected / text / click / input)
//! goes through the UIA patterns; an element that does not support the
//! requested pattern reports `false` instead of failing.
//!
//! # COM apartment model
//!
//! The driver initialises an MTA apartment for its thread and keeps it
//! alive for as long as it exists.  Elements hold COM interface pointers
//! and are not `Send`.

#![cfg(windows)]

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use windows::core::Interface;
use windows::Win32::Foundation::HWND;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED,
};
use windows::Win32::Foundation::POINT;
use windows::Win32::UI::Accessibility::{
    CUIAutomation, IUIAutomation, IUIAutomationElement, IUIAutomationExpandCollapsePattern,
    IUIAutomationInvokePattern, IUIAutomationSelectionItemPattern, IUIAutomationTogglePattern,
    IUIAutomationTreeWalker, IUIAutomationValuePattern, TreeScope_Children,
    UIA_ExpandCollapsePatternId, UIA_InvokePatternId, UIA_SelectionItemPatternId,
    UIA_TogglePatternId, UIA_ValuePatternId, UIA_CONTROLTYPE_ID,
};

use crate::driver::WindowHandle;
use crate::element::Snapshot;
use crate::errors::{Result, WinspectError};
use crate::geometry::Rect;
use crate::imaging::Raster;
use crate::input::{self, MouseButton};
use crate::query::{self, rule, Kind, Query, Rule, TreeNode};

// ---------------------------------------------------------------------------
// Role vocabulary
// ---------------------------------------------------------------------------

/// Control-type id -> role tag.
fn role_name(id: UIA_CONTROLTYPE_ID) -> &'static str {
    use windows::Win32::UI::Accessibility::*;
    match id {
        x if x == UIA_AppBarControlTypeId => "AppBar",
        x if x == UIA_ButtonControlTypeId => "Button",
        x if x == UIA_CalendarControlTypeId => "Calendar",
        x if x == UIA_CheckBoxControlTypeId => "CheckBox",
        x if x == UIA_ComboBoxControlTypeId => "ComboBox",
        x if x == UIA_CustomControlTypeId => "Custom",
        x if x == UIA_DataGridControlTypeId => "DataGrid",
        x if x == UIA_DataItemControlTypeId => "DataItem",
        x if x == UIA_DocumentControlTypeId => "Document",
        x if x == UIA_EditControlTypeId => "Edit",
        x if x == UIA_GroupControlTypeId => "Group",
        x if x == UIA_HeaderControlTypeId => "Header",
        x if x == UIA_HeaderItemControlTypeId => "HeaderItem",
        x if x == UIA_HyperlinkControlTypeId => "Hyperlink",
        x if x == UIA_ImageControlTypeId => "Image",
        x if x == UIA_ListControlTypeId => "List",
        x if x == UIA_ListItemControlTypeId => "ListItem",
        x if x == UIA_MenuBarControlTypeId => "MenuBar",
        x if x == UIA_MenuControlTypeId => "Menu",
        x if x == UIA_MenuItemControlTypeId => "MenuItem",
        x if x == UIA_PaneControlTypeId => "Pane",
        x if x == UIA_ProgressBarControlTypeId => "ProgressBar",
        x if x == UIA_RadioButtonControlTypeId => "RadioButton",
        x if x == UIA_ScrollBarControlTypeId => "ScrollBar",
        x if x == UIA_SemanticZoomControlTypeId => "SemanticZoom",
        x if x == UIA_SeparatorControlTypeId => "Separator",
        x if x == UIA_SliderControlTypeId => "Slider",
        x if x == UIA_SpinnerControlTypeId => "Spinner",
        x if x == UIA_SplitButtonControlTypeId => "SplitButton",
        x if x == UIA_StatusBarControlTypeId => "StatusBar",
        x if x == UIA_TabControlTypeId => "Tab",
        x if x == UIA_TabItemControlTypeId => "TabItem",
        x if x == UIA_TableControlTypeId => "Table",
        x if x == UIA_TextControlTypeId => "Text",
        x if x == UIA_ThumbControlTypeId => "Thumb",
        x if x == UIA_TitleBarControlTypeId => "TitleBar",
        x if x == UIA_ToolBarControlTypeId => "ToolBar",
        x if x == UIA_ToolTipControlTypeId => "ToolTip",
        x if x == UIA_TreeControlTypeId => "Tree",
        x if x == UIA_TreeItemControlTypeId => "TreeItem",
        x if x == UIA_WindowControlTypeId => "Window",
        _ => "Unknown",
    }
}

/// Queryable properties of the UIA surface.
pub const UIA_RULES: &[Rule] = &[
    rule("role", Kind::Str),
    rule("name", Kind::Str),
    rule("description", Kind::Str),
    rule("text", Kind::Str),
    rule("automation_id", Kind::Str),
    rule("class_name", Kind::Str),
    rule("x", Kind::Num),
    rule("y", Kind::Num),
    rule("width", Kind::Num),
    rule("height", Kind::Num),
    rule("visible", Kind::Bool),
    rule("checked", Kind::Bool),
    rule("selected", Kind::Bool),
    rule("enabled", Kind::Bool),
];

// ---------------------------------------------------------------------------
// COM apartment guard
// ---------------------------------------------------------------------------

/// Keeps the thread's MTA apartment alive; balanced on drop.  `!Send` so it
/// cannot leave the thread it initialised.
struct ComApartment {
    should_uninit: bool,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ComApartment {
    fn init() -> Result<Self> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        match hr.0 as u32 {
            // S_OK (new apartment) or S_FALSE (joined an existing one)
            0x0 | 0x1 => Ok(Self {
                should_uninit: true,
                _not_send: std::marker::PhantomData,
            }),
            // RPC_E_CHANGED_MODE: the thread already runs STA; usable, but
            // not ours to uninitialise
            0x8001_0106 => Ok(Self {
                should_uninit: false,
                _not_send: std::marker::PhantomData,
            }),
            code => Err(WinspectError::BackendCall(format!(
                "CoInitializeEx failed: HRESULT 0x{code:08X}"
            ))),
        }
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        if self.should_uninit {
            unsafe { CoUninitialize() };
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Per-window UIA driver.
pub struct UiaDriver {
    window: WindowHandle,
    automation: IUIAutomation,
    walker: IUIAutomationTreeWalker,
    _com: ComApartment,
}

impl UiaDriver {
    pub fn new(handle: isize) -> Result<Self> {
        let window = WindowHandle::open(handle)?;
        let com = ComApartment::init()?;
        let automation: IUIAutomation =
            unsafe { CoCreateInstance(&CUIAutomation, None, CLSCTX_INPROC_SERVER) }
                .map_err(|e| WinspectError::BackendCall(format!("CoCreateInstance: {e}")))?;
        let walker = unsafe { automation.ControlViewWalker() }
            .map_err(|e| WinspectError::BackendCall(format!("ControlViewWalker: {e}")))?;
        Ok(Self { window, automation, walker, _com: com })
    }

    pub fn window(&self) -> &WindowHandle {
        &self.window
    }

    /// The window's top-level element.
    pub fn root(&self) -> Result<UiaElement> {
        let hwnd = HWND(self.window.handle() as *mut core::ffi::c_void);
        let element = unsafe { self.automation.ElementFromHandle(hwnd) }
            .map_err(|e| WinspectError::BackendCall(format!("ElementFromHandle: {e}")))?;
        Ok(UiaElement::attach(
            element,
            self.automation.clone(),
            self.walker.clone(),
            0,
        ))
    }

    pub fn find_elements(&self, query: &Query) -> Result<Vec<UiaElement>> {
        query::find_elements(&self.root()?, query, true)
    }

    pub fn find_element(&self, query: &Query) -> Result<Option<UiaElement>> {
        query::find_element(&self.root()?, query, true)
    }

    /// The element under a screen point, at its hit-test depth.
    ///
    /// The virtual depth cannot be recovered from a point hit, so it is
    /// reported as 0; lineage navigation still works from here.
    pub fn element_from_point(&self, point: crate::geometry::Point) -> Result<UiaElement> {
        let p = POINT { x: point.x, y: point.y };
        let element = unsafe { self.automation.ElementFromPoint(p) }
            .map_err(|e| WinspectError::BackendCall(format!("ElementFromPoint: {e}")))?;
        Ok(UiaElement::attach(
            element,
            self.automation.clone(),
            self.walker.clone(),
            0,
        ))
    }

    /// Capture the whole subtree as owned snapshots (depth-limited).
    pub fn capture_tree(&self, max_depth: usize) -> Result<Snapshot> {
        fn walk(element: &UiaElement, depth: usize, max_depth: usize) -> Result<Snapshot> {
            let mut snap = element.snapshot()?;
            if depth < max_depth {
                for child in element.children()? {
                    snap.children.push(walk(&child, depth + 1, max_depth)?);
                    child.release();
                }
            }
            Ok(snap)
        }
        walk(&self.root()?, 0, max_depth)
    }

    pub fn screenshot(&self, path: Option<&Path>) -> Result<Raster> {
        self.window.screenshot(path)
    }

    pub fn close(&self) {
        // COM interfaces release on drop; nothing else to tear down
    }
}

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

/// The configured delay after a mutating UI operation.
fn settle_after_op() {
    std::thread::sleep(crate::config::Settings::snapshot().op_delay);
}

struct UiaInner {
    element: RefCell<Option<IUIAutomationElement>>,
    automation: IUIAutomation,
    walker: IUIAutomationTreeWalker,
    depth: i64,
    released: Cell<bool>,
}

/// One node of the UIA tree.  Clones share the same native reference.
#[derive(Clone)]
pub struct UiaElement(Rc<UiaInner>);

macro_rules! bstr_or_none {
    ($expr:expr) => {
        unsafe { $expr }
            .ok()
            .map(|b: windows::core::BSTR| b.to_string())
            .filter(|s| !s.is_empty())
    };
}

impl UiaElement {
    fn attach(
        element: IUIAutomationElement,
        automation: IUIAutomation,
        walker: IUIAutomationTreeWalker,
        depth: i64,
    ) -> Self {
        Self(Rc::new(UiaInner {
            element: RefCell::new(Some(element)),
            automation,
            walker,
            depth,
            released: Cell::new(false),
        }))
    }

    fn native(&self) -> Result<IUIAutomationElement> {
        self.0
            .element
            .borrow()
            .clone()
            .ok_or_else(|| WinspectError::BackendCall("element already released".into()))
    }

    pub fn depth(&self) -> i64 {
        self.0.depth
    }

    pub fn is_released(&self) -> bool {
        self.0.released.get()
    }

    fn pattern<P: Interface>(&self, id: windows::Win32::UI::Accessibility::UIA_PATTERN_ID) -> Option<P> {
        let element = self.native().ok()?;
        unsafe { element.GetCurrentPattern(id) }
            .ok()
            .and_then(|p| p.cast::<P>().ok())
    }

    fn role(&self) -> Result<String> {
        let element = self.native()?;
        Ok(unsafe { element.CurrentControlType() }
            .map(|id| role_name(id).to_owned())
            .unwrap_or_else(|_| "Unknown".to_owned()))
    }

    /// Rectangle straight from the backend.
    pub fn rectangle(&self) -> Result<Rect> {
        let element = self.native()?;
        let r = unsafe { element.CurrentBoundingRectangle() }
            .map_err(|e| WinspectError::BackendCall(format!("CurrentBoundingRectangle: {e}")))?;
        Ok(Rect::new(r.left, r.top, r.right.max(r.left), r.bottom.max(r.top)))
    }

    /// Parent element, or `None` at the tree root.
    ///
    /// The parent's virtual depth is this element's depth - 1 (floored at
    /// the root).
    pub fn parent(&self) -> Result<Option<UiaElement>> {
        if self.0.depth == 0 {
            return Ok(None);
        }
        let element = self.native()?;
        match unsafe { self.0.walker.GetParentElement(&element) } {
            Ok(parent) => Ok(Some(UiaElement::attach(
                parent,
                self.0.automation.clone(),
                self.0.walker.clone(),
                (self.0.depth - 1).max(0),
            ))),
            Err(_) => Ok(None),
        }
    }

    /// Previous sibling in control-view order.
    pub fn previous(&self) -> Result<Option<UiaElement>> {
        let element = self.native()?;
        Ok(unsafe { self.0.walker.GetPreviousSiblingElement(&element) }
            .ok()
            .map(|e| {
                UiaElement::attach(e, self.0.automation.clone(), self.0.walker.clone(), self.0.depth)
            }))
    }

    /// Next sibling in control-view order.
    pub fn next(&self) -> Result<Option<UiaElement>> {
        let element = self.native()?;
        Ok(unsafe { self.0.walker.GetNextSiblingElement(&element) }
            .ok()
            .map(|e| {
                UiaElement::attach(e, self.0.automation.clone(), self.0.walker.clone(), self.0.depth)
            }))
    }

    pub fn child(&self, index: usize) -> Result<Option<UiaElement>> {
        let mut children = self.children()?;
        if index >= children.len() {
            for extra in children {
                extra.release();
            }
            return Ok(None);
        }
        let picked = children.swap_remove(index);
        for extra in children {
            extra.release();
        }
        Ok(Some(picked))
    }

    // -- actions -----------------------------------------------------------

    /// Role-aware click: Invoke for buttons, Toggle for check boxes,
    /// Select for radio buttons; synthetic mouse input otherwise.
    pub fn click(&self) -> Result<bool> {
        let role = self.role()?;
        let handled = match role.as_str() {
            "Button" => self
                .pattern::<IUIAutomationInvokePattern>(UIA_InvokePatternId)
                .map(|p| unsafe { p.Invoke() }.is_ok()),
            "CheckBox" => self
                .pattern::<IUIAutomationTogglePattern>(UIA_TogglePatternId)
                .map(|p| unsafe { p.Toggle() }.is_ok()),
            "RadioButton" => self
                .pattern::<IUIAutomationSelectionItemPattern>(UIA_SelectionItemPatternId)
                .map(|p| unsafe { p.Select() }.is_ok()),
            _ => None,
        };
        if let Some(true) = handled {
            settle_after_op();
            return Ok(true);
        }
        // fallback: focus and click the centre
        let _ = self.set_focus();
        let rect = self.rectangle()?;
        input::click_at(rect.center(), MouseButton::Left);
        settle_after_op();
        Ok(true)
    }

    /// Set the text value (Edit elements only).
    pub fn input(&self, text: &str) -> Result<bool> {
        if self.role()? != "Edit" {
            return Ok(false);
        }
        match self.pattern::<IUIAutomationValuePattern>(UIA_ValuePatternId) {
            Some(p) => {
                let bstr = windows::core::BSTR::from(text);
                let ok = unsafe { p.SetValue(&bstr) }.is_ok();
                if ok {
                    settle_after_op();
                }
                Ok(ok)
            }
            None => Ok(false),
        }
    }

    pub fn set_focus(&self) -> Result<bool> {
        let element = self.native()?;
        Ok(unsafe { element.SetFocus() }.is_ok())
    }

    /// Expand a collapsible element (combo boxes, tree items).  `false`
    /// when the element does not expose the pattern.
    pub fn expand(&self) -> Result<bool> {
        self.guard_released()?;
        Ok(self
            .pattern::<IUIAutomationExpandCollapsePattern>(UIA_ExpandCollapsePatternId)
            .map(|p| unsafe { p.Expand() }.is_ok())
            .unwrap_or(false))
    }

    /// Collapse a collapsible element.
    pub fn collapse(&self) -> Result<bool> {
        self.guard_released()?;
        Ok(self
            .pattern::<IUIAutomationExpandCollapsePattern>(UIA_ExpandCollapsePatternId)
            .map(|p| unsafe { p.Collapse() }.is_ok())
            .unwrap_or(false))
    }

    fn guard_released(&self) -> Result<()> {
        if self.0.released.get() {
            return Err(WinspectError::BackendCall("element already released".into()));
        }
        Ok(())
    }
}

impl TreeNode for UiaElement {
    fn snapshot(&self) -> Result<Snapshot> {
        let element = self.native()?;
        let role = self.role()?;

        let text = if role == "Edit" {
            self.pattern::<IUIAutomationValuePattern>(UIA_ValuePatternId)
                .and_then(|p| bstr_or_none!(p.CurrentValue()))
        } else {
            None
        };
        let checked = matches!(role.as_str(), "CheckBox" | "ListItem" | "TreeItem")
            .then(|| {
                self.pattern::<IUIAutomationTogglePattern>(UIA_TogglePatternId)
                    .map(|p| unsafe { p.CurrentToggleState() }.map(|s| s.0 == 1).unwrap_or(false))
            })
            .flatten();
        let selected = self
            .pattern::<IUIAutomationSelectionItemPattern>(UIA_SelectionItemPatternId)
            .map(|p| unsafe { p.CurrentIsSelected() }.map(|b| b.as_bool()).unwrap_or(false));

        let rectangle = self.rectangle().ok();
        let children_count = self.children().map(|c| {
            let n = c.len() as i64;
            for child in c {
                child.release();
            }
            n
        });

        Ok(Snapshot {
            backend: Some(crate::element::BackendKind::Uia),
            role: Some(role),
            name: bstr_or_none!(element.CurrentName()),
            description: bstr_or_none!(element.CurrentHelpText()),
            automation_id: bstr_or_none!(element.CurrentAutomationId()),
            class_name: bstr_or_none!(element.CurrentClassName()),
            text,
            rectangle,
            visible: Some(
                !unsafe { element.CurrentIsOffscreen() }
                    .map(|b| b.as_bool())
                    .unwrap_or(false),
            ),
            enabled: Some(
                unsafe { element.CurrentIsEnabled() }
                    .map(|b| b.as_bool())
                    .unwrap_or(false),
            ),
            selected,
            checked,
            children_count: children_count.ok(),
            depth: Some(self.0.depth),
            ..Snapshot::default()
        })
    }

    fn children(&self) -> Result<Vec<UiaElement>> {
        let element = self.native()?;
        let condition = unsafe { self.0.automation.CreateTrueCondition() }
            .map_err(|e| WinspectError::BackendCall(format!("CreateTrueCondition: {e}")))?;
        let array = unsafe { element.FindAll(TreeScope_Children, &condition) }
            .map_err(|e| WinspectError::BackendCall(format!("FindAll(children): {e}")))?;
        let len = unsafe { array.Length() }.unwrap_or(0);
        let mut children = Vec::with_capacity(len.max(0) as usize);
        for i in 0..len {
            if let Ok(child) = unsafe { array.GetElement(i) } {
                children.push(UiaElement::attach(
                    child,
                    self.0.automation.clone(),
                    self.0.walker.clone(),
                    self.0.depth + 1,
                ));
            }
        }
        Ok(children)
    }

    fn release(&self) {
        if !self.0.released.replace(true) {
            // dropping the COM pointer releases the native reference
            self.0.element.borrow_mut().take();
        }
    }

    fn rules(&self) -> &'static [Rule] {
        UIA_RULES
    }
}
