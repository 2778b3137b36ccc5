//! Computer-vision backend: locating sub-regions of a window by pixels.
//!
//! The tree degenerates to a single root covering the window rectangle at
//! confidence 1.0; hits from the match orchestrator become leaf elements
//! carrying the matched rectangle and confidence.  There is no navigation
//! past the root.

use std::cell::Cell;
use std::rc::Rc;

use crate::element::Snapshot;
use crate::errors::Result;
use crate::geometry::Rect;
use crate::query::{rule, Kind, Rule, TreeNode};

/// Queryable properties of the CV surface: geometry and match confidence.
pub const CV_RULES: &[Rule] = &[
    rule("x", Kind::Num),
    rule("y", Kind::Num),
    rule("width", Kind::Num),
    rule("height", Kind::Num),
    rule("confidence", Kind::Num),
];

struct CvInner {
    rect: Rect,
    confidence: f64,
    released: Cell<bool>,
}

/// A matched screen region.  Carries no native handle; release only flips
/// the flag so the common lifetime discipline still holds.
#[derive(Clone)]
pub struct CvElement(Rc<CvInner>);

impl CvElement {
    pub fn new(rect: Rect, confidence: f64) -> Self {
        Self(Rc::new(CvInner { rect, confidence, released: Cell::new(false) }))
    }

    pub fn rectangle(&self) -> Rect {
        self.0.rect
    }

    pub fn confidence(&self) -> f64 {
        self.0.confidence
    }

    pub fn is_released(&self) -> bool {
        self.0.released.get()
    }

    /// Click the element centre with synthetic mouse input.
    #[cfg(windows)]
    pub fn click(&self) -> Result<bool> {
        crate::input::click_at(self.0.rect.center(), crate::input::MouseButton::Left);
        Ok(true)
    }

    /// Type into the element: click to focus, then send the text.
    #[cfg(windows)]
    pub fn input(&self, text: &str) -> Result<bool> {
        self.click()?;
        crate::input::type_text(text);
        Ok(true)
    }
}

impl TreeNode for CvElement {
    fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            backend: Some(crate::element::BackendKind::Cv),
            rectangle: Some(self.0.rect),
            confidence: Some(self.0.confidence),
            depth: Some(0),
            ..Snapshot::default()
        })
    }

    fn children(&self) -> Result<Vec<CvElement>> {
        Ok(Vec::new())
    }

    fn release(&self) {
        self.0.released.set(true);
    }

    fn rules(&self) -> &'static [Rule] {
        CV_RULES
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[cfg(windows)]
pub use driver::CvDriver;

#[cfg(windows)]
mod driver {
    use std::path::Path;

    use super::CvElement;
    use crate::driver::WindowHandle;
    use crate::errors::Result;
    use crate::imaging::Raster;
    use crate::template::Template;

    /// Per-window CV driver: a window handle plus the match orchestrator.
    pub struct CvDriver {
        window: WindowHandle,
    }

    impl CvDriver {
        pub fn new(handle: isize) -> Result<Self> {
            Ok(Self { window: WindowHandle::open(handle)? })
        }

        pub fn window(&self) -> &WindowHandle {
            &self.window
        }

        /// The root element: the whole window at confidence 1.0.
        pub fn root(&self) -> Result<CvElement> {
            Ok(CvElement::new(self.window.rectangle()?, 1.0))
        }

        /// Match a reference image against a fresh window screenshot.
        ///
        /// The hit rectangle is window-relative capture space translated
        /// into screen coordinates via the window origin.
        pub fn find_element(&self, template: &Template) -> Result<Option<CvElement>> {
            let window_rect = self.window.rectangle()?;
            let screen = self.window.screenshot(None)?;
            Ok(template.match_rect_in(&screen)?.map(|hit| {
                CvElement::new(
                    hit.rectangle.translate(window_rect.left, window_rect.top),
                    hit.confidence as f64,
                )
            }))
        }

        pub fn screenshot(&self, path: Option<&Path>) -> Result<Raster> {
            self.window.screenshot(path)
        }

        pub fn close(&self) {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
