//! Data model for a single captured UI element.
//!
//! [`Snapshot`] is an owned copy of every queryable attribute of one
//! element at one instant.  It is fully `Send` and `Serialize` -- no native
//! handles are held.  Attributes are capability sets: a backend that does
//! not populate an attribute leaves it `None`, and the query engine's
//! `null` operator can test exactly that.

use serde::Serialize;

use crate::geometry::Rect;

/// Which surface an element came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Uia,
    Jab,
    Cv,
}

/// One attribute value as seen by the query engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// An owned, handle-free snapshot of one element.
///
/// `x/y/width/height` are derived from `rectangle`; `children` is only
/// populated by whole-tree capture (the CLI dump), never by the query
/// engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    /// Which surface produced this element.
    pub backend: Option<BackendKind>,
    pub role: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub automation_id: Option<String>,
    pub class_name: Option<String>,
    pub text: Option<String>,
    pub rectangle: Option<Rect>,
    pub visible: Option<bool>,
    pub enabled: Option<bool>,
    pub focused: Option<bool>,
    pub focusable: Option<bool>,
    pub selected: Option<bool>,
    pub selectable: Option<bool>,
    pub checked: Option<bool>,
    pub editable: Option<bool>,
    pub resizable: Option<bool>,
    pub collapsed: Option<bool>,
    pub multiselectable: Option<bool>,
    pub showing: Option<bool>,
    pub index_in_parent: Option<i64>,
    pub children_count: Option<i64>,
    pub depth: Option<i64>,
    pub confidence: Option<f64>,
    /// Lineage link for dotted rule paths; populated on demand.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<Snapshot>>,
    /// Subtree, populated only by whole-tree capture.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<Snapshot>,
}

impl Snapshot {
    /// Read one flat attribute by name.
    ///
    /// Returns `None` both for unknown names and for capabilities the
    /// element's backend does not populate; the rule tables keep the two
    /// apart (unknown names never reach here).
    pub fn field(&self, name: &str) -> Option<PropertyValue> {
        use PropertyValue as V;
        match name {
            "role" => self.role.clone().map(V::Str),
            "name" => self.name.clone().map(V::Str),
            "description" => self.description.clone().map(V::Str),
            "automation_id" => self.automation_id.clone().map(V::Str),
            "class_name" => self.class_name.clone().map(V::Str),
            "text" => self.text.clone().map(V::Str),
            "x" => self.rectangle.map(|r| V::Int(r.left as i64)),
            "y" => self.rectangle.map(|r| V::Int(r.top as i64)),
            "width" => self.rectangle.map(|r| V::Int(r.width() as i64)),
            "height" => self.rectangle.map(|r| V::Int(r.height() as i64)),
            "visible" => self.visible.map(V::Bool),
            "enabled" => self.enabled.map(V::Bool),
            "focused" => self.focused.map(V::Bool),
            "focusable" => self.focusable.map(V::Bool),
            "selected" => self.selected.map(V::Bool),
            "selectable" => self.selectable.map(V::Bool),
            "checked" => self.checked.map(V::Bool),
            "editable" => self.editable.map(V::Bool),
            "resizable" => self.resizable.map(V::Bool),
            "collapsed" => self.collapsed.map(V::Bool),
            "multiselectable" => self.multiselectable.map(V::Bool),
            "showing" => self.showing.map(V::Bool),
            "index_in_parent" => self.index_in_parent.map(V::Int),
            "children_count" => self.children_count.map(V::Int),
            "depth" => self.depth.map(V::Int),
            "confidence" => self.confidence.map(V::Float),
            _ => None,
        }
    }

    /// Read an attribute by (possibly dotted) path.
    ///
    /// Dot segments descend through lineage links (`parent.…`); a missing
    /// intermediate yields `None`, which the query engine treats as null
    /// on the left-hand side.
    pub fn lookup(&self, path: &str) -> Option<PropertyValue> {
        match path.split_once('.') {
            None => self.field(path),
            Some(("parent", rest)) => self.parent.as_deref()?.lookup(rest),
            Some(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        Snapshot {
            role: Some("button".into()),
            name: Some("OK".into()),
            rectangle: Some(Rect::new(10, 20, 110, 60)),
            enabled: Some(true),
            depth: Some(2),
            confidence: Some(0.93),
            ..Snapshot::default()
        }
    }

    #[test]
    fn test_field_kinds() {
        let s = sample();
        assert_eq!(s.field("role"), Some(PropertyValue::Str("button".into())));
        assert_eq!(s.field("x"), Some(PropertyValue::Int(10)));
        assert_eq!(s.field("width"), Some(PropertyValue::Int(100)));
        assert_eq!(s.field("height"), Some(PropertyValue::Int(40)));
        assert_eq!(s.field("enabled"), Some(PropertyValue::Bool(true)));
        assert_eq!(s.field("confidence"), Some(PropertyValue::Float(0.93)));
        assert_eq!(s.field("text"), None);
        assert_eq!(s.field("no_such_field"), None);
    }

    #[test]
    fn test_lookup_dotted_parent() {
        let mut child = sample();
        child.parent = Some(Box::new(Snapshot {
            name: Some("dialog".into()),
            ..Snapshot::default()
        }));
        assert_eq!(
            child.lookup("parent.name"),
            Some(PropertyValue::Str("dialog".into()))
        );
        assert_eq!(child.lookup("parent.parent.name"), None);
        assert_eq!(child.lookup("sibling.name"), None);
    }

    #[test]
    fn test_serializes_without_handles() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"role\":\"button\""));
        assert!(json.contains("\"rectangle\""));
        // lineage links are omitted when absent
        assert!(!json.contains("\"parent\""));
    }
}
