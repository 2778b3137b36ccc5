//! Java Access Bridge backend: Swing/AWT accessibility trees mapped onto
//! the element model.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`ffi`] | byte-exact Access Bridge 2.0.2 layouts and symbol types |
//! | [`bridge`] | DLL singleton, support-file install, message pump |
//!
//! Every context handle obtained from the bridge is owned by exactly one
//! element and released exactly once -- explicitly by the query engine for
//! visited non-matches, or on drop otherwise.

#![cfg(windows)]

pub mod bridge;
pub mod ffi;

use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use bridge::Bridge;
use ffi::{wide_to_string, AccessibleContext, VmId};

use crate::driver::WindowHandle;
use crate::element::Snapshot;
use crate::errors::{Result, WinspectError};
use crate::geometry::Rect;
use crate::imaging::Raster;
use crate::input::{self, MouseButton};
use crate::query::{self, rule, Kind, Query, Rule, TreeNode};

/// Action names tried for a native click, in order.  Swing applications
/// localise action names, so the CJK form ships alongside the English one.
const CLICK_ACTION_NAMES: &[&str] = &["单击", "click"];

/// Queryable properties of the JAB surface.
pub const JAB_RULES: &[Rule] = &[
    rule("role", Kind::Str),
    rule("name", Kind::Str),
    rule("description", Kind::Str),
    rule("text", Kind::Str),
    rule("x", Kind::Num),
    rule("y", Kind::Num),
    rule("width", Kind::Num),
    rule("height", Kind::Num),
    rule("index_in_parent", Kind::Num),
    rule("children_count", Kind::Num),
    rule("depth", Kind::Num),
    rule("editable", Kind::Bool),
    rule("focusable", Kind::Bool),
    rule("resizable", Kind::Bool),
    rule("visible", Kind::Bool),
    rule("selectable", Kind::Bool),
    rule("multiselectable", Kind::Bool),
    rule("collapsed", Kind::Bool),
    rule("checked", Kind::Bool),
    rule("enabled", Kind::Bool),
    rule("focused", Kind::Bool),
    rule("selected", Kind::Bool),
    rule("showing", Kind::Bool),
];

/// The configured delay after a mutating UI operation.
fn settle_after_op() {
    std::thread::sleep(crate::config::Settings::snapshot().op_delay);
}

/// The comma-separated en-US state set, parsed once per snapshot.
fn parse_states(states: &str) -> Vec<String> {
    states
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Per-window JAB driver.
pub struct JabDriver {
    window: WindowHandle,
    bridge: Arc<Bridge>,
}

impl JabDriver {
    /// Open the window and make sure the bridge singleton is running.
    pub fn new(handle: isize) -> Result<Self> {
        let window = WindowHandle::open(handle)?;
        let bridge = Bridge::instance()?;
        Ok(Self { window, bridge })
    }

    pub fn window(&self) -> &WindowHandle {
        &self.window
    }

    /// Whether the target window hosts a Java accessible tree at all.
    pub fn is_java_window(&self) -> bool {
        self.bridge.is_java_window(self.window.handle())
    }

    /// The root element, or `None` for a non-Java window.
    pub fn root(&self) -> Result<Option<JabElement>> {
        if !self.is_java_window() {
            return Ok(None);
        }
        let (vmid, ctx) = self
            .bridge
            .accessible_context_from_hwnd(self.window.handle())?;
        Ok(Some(JabElement::attach(self.bridge.clone(), vmid, ctx)))
    }

    pub fn find_elements(&self, query: &Query) -> Result<Vec<JabElement>> {
        match self.root()? {
            Some(root) => query::find_elements(&root, query, true),
            None => Ok(Vec::new()),
        }
    }

    pub fn find_element(&self, query: &Query) -> Result<Option<JabElement>> {
        match self.root()? {
            Some(root) => query::find_element(&root, query, true),
            None => Ok(None),
        }
    }

    /// The deepest accessible context under a screen point.
    pub fn element_at(&self, point: crate::geometry::Point) -> Result<Option<JabElement>> {
        let Some(root) = self.root()? else {
            return Ok(None);
        };
        let hit = self
            .bridge
            .context_at(root.vmid(), root.context(), point.x, point.y)
            .map(|ctx| JabElement::attach(self.bridge.clone(), root.vmid(), ctx));
        root.release();
        Ok(hit)
    }

    /// Capture the whole subtree as owned snapshots (depth-limited).
    pub fn capture_tree(&self, max_depth: usize) -> Result<Option<Snapshot>> {
        fn walk(element: &JabElement, depth: usize, max_depth: usize) -> Result<Snapshot> {
            let mut snap = element.snapshot()?;
            if depth < max_depth {
                for child in element.children()? {
                    snap.children.push(walk(&child, depth + 1, max_depth)?);
                    child.release();
                }
            }
            Ok(snap)
        }
        match self.root()? {
            Some(root) => Ok(Some(walk(&root, 0, max_depth)?)),
            None => Ok(None),
        }
    }

    pub fn screenshot(&self, path: Option<&Path>) -> Result<Raster> {
        self.window.screenshot(path)
    }

    /// Stop delivering JAB callbacks for this process.
    pub fn close(&self) {
        self.bridge.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

struct JabInner {
    bridge: Arc<Bridge>,
    vmid: VmId,
    ctx: AccessibleContext,
    released: Cell<bool>,
}

impl JabInner {
    fn release_once(&self) {
        if !self.released.replace(true) {
            self.bridge.release_java_object(self.vmid, self.ctx);
        }
    }
}

impl Drop for JabInner {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// One node of a Java accessible tree.  Clones share one `(vmid, ctx)`
/// handle; the handle is released exactly once.
#[derive(Clone)]
pub struct JabElement(Rc<JabInner>);

impl JabElement {
    fn attach(bridge: Arc<Bridge>, vmid: VmId, ctx: AccessibleContext) -> Self {
        Self(Rc::new(JabInner { bridge, vmid, ctx, released: Cell::new(false) }))
    }

    pub fn vmid(&self) -> VmId {
        self.0.vmid
    }

    pub fn context(&self) -> AccessibleContext {
        self.0.ctx
    }

    pub fn is_released(&self) -> bool {
        self.0.released.get()
    }

    fn guard(&self) -> Result<()> {
        if self.0.released.get() {
            return Err(WinspectError::BackendCall("element already released".into()));
        }
        Ok(())
    }

    fn info(&self) -> Result<ffi::AccessibleContextInfo> {
        self.guard()?;
        self.0.bridge.context_info(self.0.vmid, self.0.ctx)
    }

    /// Full text of the context, when the accessible-text interface is
    /// present.
    pub fn text(&self) -> Result<Option<String>> {
        let info = self.info()?;
        if info.accessible_text == 0 {
            return Ok(None);
        }
        let Some(text_info) = self.0.bridge.text_info(self.0.vmid, self.0.ctx) else {
            return Ok(None);
        };
        if text_info.char_count <= 0 {
            return Ok(Some(String::new()));
        }
        Ok(self
            .0
            .bridge
            .text_range(self.0.vmid, self.0.ctx, 0, text_info.char_count - 1))
    }

    /// Backend-computed depth (0 at the top-level object).
    pub fn depth(&self) -> Result<i64> {
        self.guard()?;
        let depth = self.0.bridge.object_depth(self.0.vmid, self.0.ctx);
        if depth < 0 {
            return Err(WinspectError::BackendCall("getObjectDepth failed".into()));
        }
        Ok(depth as i64)
    }

    pub fn rectangle(&self) -> Result<Rect> {
        let info = self.info()?;
        Ok(Rect::from_origin_size(
            info.x,
            info.y,
            info.width.max(0),
            info.height.max(0),
        ))
    }

    /// Parent element; `None` at the top-level object.
    pub fn parent(&self) -> Result<Option<JabElement>> {
        self.guard()?;
        if self.depth()? == 0 {
            return Ok(None);
        }
        let ctx = self.0.bridge.parent_from_context(self.0.vmid, self.0.ctx);
        Ok((ctx != 0).then(|| JabElement::attach(self.0.bridge.clone(), self.0.vmid, ctx)))
    }

    /// Child by index; contexts the bridge reports as 0 are absent.
    pub fn child(&self, index: i32) -> Result<Option<JabElement>> {
        self.guard()?;
        if index < 0 {
            return Ok(None);
        }
        let ctx = self.0.bridge.child_from_context(self.0.vmid, self.0.ctx, index);
        Ok((ctx != 0).then(|| JabElement::attach(self.0.bridge.clone(), self.0.vmid, ctx)))
    }

    pub fn previous(&self) -> Result<Option<JabElement>> {
        let index = self.info()?.index_in_parent;
        match self.parent()? {
            Some(parent) => {
                let sibling = parent.child(index - 1)?;
                parent.release();
                Ok(sibling)
            }
            None => Ok(None),
        }
    }

    pub fn next(&self) -> Result<Option<JabElement>> {
        let index = self.info()?.index_in_parent;
        match self.parent()? {
            Some(parent) => {
                let sibling = parent.child(index + 1)?;
                parent.release();
                Ok(sibling)
            }
            None => Ok(None),
        }
    }

    // -- actions -----------------------------------------------------------

    /// Fire the first accessible action whose name is in the configured
    /// click list; falls back to synthetic mouse input at the centre.
    pub fn click(&self) -> Result<bool> {
        self.guard()?;
        if let Some(actions) = self.0.bridge.actions(self.0.vmid, self.0.ctx) {
            let count = (actions.actions_count.max(0) as usize).min(ffi::MAX_ACTION_INFO);
            for action in &actions.action_info[..count] {
                let name = wide_to_string(&action.name);
                if CLICK_ACTION_NAMES.contains(&name.as_str())
                    && self.0.bridge.do_action(self.0.vmid, self.0.ctx, &action.name)
                {
                    settle_after_op();
                    return Ok(true);
                }
            }
        }
        // no matching action fired; click the centre instead
        let rect = self.rectangle()?;
        input::click_at(rect.center(), MouseButton::Left);
        settle_after_op();
        Ok(true)
    }

    pub fn input(&self, text: &str) -> Result<bool> {
        self.guard()?;
        let ok = self.0.bridge.set_text_contents(self.0.vmid, self.0.ctx, text);
        if ok {
            settle_after_op();
        }
        Ok(ok)
    }

    pub fn set_focus(&self) -> Result<bool> {
        self.guard()?;
        Ok(self.0.bridge.request_focus(self.0.vmid, self.0.ctx))
    }

    /// The accessible value string (sliders, spinners, progress bars).
    pub fn value(&self) -> Result<Option<String>> {
        self.guard()?;
        Ok(self
            .0
            .bridge
            .current_value(self.0.vmid, self.0.ctx)
            .filter(|v| !v.is_empty()))
    }

    /// Add the child at `index` to this container's selection.
    pub fn select_child(&self, index: i32) -> Result<()> {
        self.guard()?;
        self.0.bridge.add_selection(self.0.vmid, self.0.ctx, index);
        Ok(())
    }

    pub fn clear_selection(&self) -> Result<()> {
        self.guard()?;
        self.0.bridge.clear_selection(self.0.vmid, self.0.ctx);
        Ok(())
    }

    pub fn selection_count(&self) -> Result<i32> {
        self.guard()?;
        Ok(self.0.bridge.selection_count(self.0.vmid, self.0.ctx))
    }

    pub fn is_child_selected(&self, index: i32) -> Result<bool> {
        self.guard()?;
        Ok(self.0.bridge.is_child_selected(self.0.vmid, self.0.ctx, index))
    }
}

impl TreeNode for JabElement {
    fn snapshot(&self) -> Result<Snapshot> {
        let info = self.info()?;
        let states = parse_states(&wide_to_string(&info.states_en_us));
        let has = |state: &str| Some(states.iter().any(|s| s == state));

        Ok(Snapshot {
            backend: Some(crate::element::BackendKind::Jab),
            role: Some(wide_to_string(&info.role_en_us)),
            name: Some(wide_to_string(&info.name)).filter(|s| !s.is_empty()),
            description: Some(wide_to_string(&info.description)).filter(|s| !s.is_empty()),
            text: self.text()?,
            rectangle: Some(Rect::from_origin_size(
                info.x,
                info.y,
                info.width.max(0),
                info.height.max(0),
            )),
            visible: has("visible"),
            enabled: has("enabled"),
            focused: has("focused"),
            focusable: has("focusable"),
            selected: has("selected"),
            selectable: has("selectable"),
            checked: has("checked"),
            editable: has("editable"),
            resizable: has("resizable"),
            collapsed: has("collapsed"),
            multiselectable: has("multiselectable"),
            showing: has("showing"),
            index_in_parent: Some(info.index_in_parent as i64),
            children_count: Some(info.children_count as i64),
            depth: self.depth().ok(),
            ..Snapshot::default()
        })
    }

    /// Children via `getVisibleChildren` where available, the indexed
    /// fallback otherwise.  Zero contexts are skipped either way.
    fn children(&self) -> Result<Vec<JabElement>> {
        self.guard()?;
        let bridge = &self.0.bridge;
        let visible_count = bridge.visible_children_count(self.0.vmid, self.0.ctx);
        if visible_count > 0 {
            let mut contexts = Vec::with_capacity(visible_count as usize);
            while contexts.len() < visible_count as usize {
                match bridge.visible_children(self.0.vmid, self.0.ctx, contexts.len() as i32) {
                    Some(batch) if !batch.is_empty() => contexts.extend(batch),
                    _ => break,
                }
            }
            if !contexts.is_empty() {
                return Ok(contexts
                    .into_iter()
                    .map(|ctx| JabElement::attach(bridge.clone(), self.0.vmid, ctx))
                    .collect());
            }
        }
        // indexed fallback
        let count = self.info()?.children_count.max(0);
        let mut children = Vec::with_capacity(count as usize);
        for index in 0..count {
            let ctx = bridge.child_from_context(self.0.vmid, self.0.ctx, index);
            if ctx != 0 {
                children.push(JabElement::attach(bridge.clone(), self.0.vmid, ctx));
            }
        }
        Ok(children)
    }

    fn release(&self) {
        self.0.release_once();
    }

    fn rules(&self) -> &'static [Rule] {
        JAB_RULES
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_states() {
        let states = parse_states("enabled,focusable, visible ,showing");
        assert_eq!(states, ["enabled", "focusable", "visible", "showing"]);
        assert!(parse_states("").is_empty());
        assert_eq!(parse_states("checked"), ["checked"]);
    }

    #[test]
    fn test_jab_rules_cover_capability_matrix() {
        for key in [
            "role", "name", "description", "text", "x", "y", "width", "height",
            "index_in_parent", "children_count", "depth", "editable", "focusable",
            "resizable", "visible", "selectable", "multiselectable", "collapsed",
            "checked", "enabled", "focused", "selected", "showing",
        ] {
            assert!(
                JAB_RULES.iter().any(|r| r.key == key),
                "missing JAB rule for {key}"
            );
        }
        // UIA-only properties must stay out
        for key in ["automation_id", "class_name", "confidence"] {
            assert!(!JAB_RULES.iter().any(|r| r.key == key));
        }
    }
}
