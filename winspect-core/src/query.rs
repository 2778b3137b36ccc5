//! The query engine: a typed predicate algebra over element properties,
//! combined with caller filter callbacks and tree-walk operations.
//!
//! Criteria are `(key, value)` pairs whose operator is encoded in the key
//! suffix (`name_like` applies `like` to `name`; a bare `name` means
//! equality).  Keys resolve against the backend's rule table; an
//! unrecognised key or a value of the wrong shape is a programmer error
//! (`InvalidArgument`), never a silent non-match.
//!
//! Traversals own their release discipline: every element they visit and
//! do not return is released exactly once, so native handles cannot leak
//! out of a query.

use regex::Regex;

use crate::element::{PropertyValue, Snapshot};
use crate::errors::{Result, WinspectError};

// ---------------------------------------------------------------------------
// Operator alphabet and rule tables
// ---------------------------------------------------------------------------

/// The operator alphabet.  Which operators a property admits depends on
/// its [`Kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expr {
    Eq,
    Not,
    Like,
    In,
    InLike,
    Regex,
    Gt,
    Gte,
    Lt,
    Lte,
    Null,
}

impl Expr {
    fn suffix(&self) -> &'static str {
        match self {
            Expr::Eq => "",
            Expr::Not => "not",
            Expr::Like => "like",
            Expr::In => "in",
            Expr::InLike => "in_like",
            Expr::Regex => "regex",
            Expr::Gt => "gt",
            Expr::Gte => "gte",
            Expr::Lt => "lt",
            Expr::Lte => "lte",
            Expr::Null => "null",
        }
    }
}

/// Property category, deciding the admissible operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Str,
    Num,
    Bool,
}

impl Kind {
    fn exprs(&self) -> &'static [Expr] {
        match self {
            Kind::Str => &[
                Expr::Eq,
                Expr::Not,
                Expr::Like,
                Expr::In,
                Expr::InLike,
                Expr::Regex,
                Expr::Null,
            ],
            Kind::Num => &[
                Expr::Eq,
                Expr::Not,
                Expr::Gt,
                Expr::Gte,
                Expr::Lt,
                Expr::Lte,
                Expr::Null,
            ],
            Kind::Bool => &[Expr::Eq, Expr::Not, Expr::Null],
        }
    }
}

/// One queryable property of a backend: the criteria key, the snapshot
/// path it reads (possibly dotted), and its kind.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub key: &'static str,
    pub path: &'static str,
    pub kind: Kind,
}

/// A rule whose key and path coincide (the common case).
pub const fn rule(key: &'static str, kind: Kind) -> Rule {
    Rule { key, path: key, kind }
}

// ---------------------------------------------------------------------------
// Criteria values and the query
// ---------------------------------------------------------------------------

/// The value side of one criterion -- the statically-typed stand-in for a
/// dynamic named-argument bag.
#[derive(Debug, Clone, PartialEq)]
pub enum CriterionValue {
    Str(String),
    StrList(Vec<String>),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for CriterionValue {
    fn from(v: &str) -> Self {
        CriterionValue::Str(v.to_owned())
    }
}

impl From<String> for CriterionValue {
    fn from(v: String) -> Self {
        CriterionValue::Str(v)
    }
}

impl From<Vec<&str>> for CriterionValue {
    fn from(v: Vec<&str>) -> Self {
        CriterionValue::StrList(v.into_iter().map(str::to_owned).collect())
    }
}

impl From<Vec<String>> for CriterionValue {
    fn from(v: Vec<String>) -> Self {
        CriterionValue::StrList(v)
    }
}

impl From<i64> for CriterionValue {
    fn from(v: i64) -> Self {
        CriterionValue::Int(v)
    }
}

impl From<i32> for CriterionValue {
    fn from(v: i32) -> Self {
        CriterionValue::Int(v as i64)
    }
}

impl From<f64> for CriterionValue {
    fn from(v: f64) -> Self {
        CriterionValue::Float(v)
    }
}

impl From<bool> for CriterionValue {
    fn from(v: bool) -> Self {
        CriterionValue::Bool(v)
    }
}

/// A caller-supplied predicate over the element snapshot.
pub type Filter = Box<dyn Fn(&Snapshot) -> bool>;

/// A structural query: suffix-keyed criteria (conjunctive) plus filter
/// callbacks (evaluated first, in order), with query-wide case folding.
#[derive(Default)]
pub struct Query {
    criteria: Vec<(String, CriterionValue)>,
    filters: Vec<Filter>,
    ignore_case: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one criterion, e.g. `.criterion("name_like", "OK")`.
    pub fn criterion(mut self, key: &str, value: impl Into<CriterionValue>) -> Self {
        self.criteria.push((key.to_owned(), value.into()));
        self
    }

    /// Add a filter callback.
    pub fn filter(mut self, f: impl Fn(&Snapshot) -> bool + 'static) -> Self {
        self.filters.push(Box::new(f));
        self
    }

    /// Fold all strings on both sides before comparison.
    pub fn ignore_case(mut self, yes: bool) -> Self {
        self.ignore_case = yes;
        self
    }

    /// An empty query never matches anything.
    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty() && self.filters.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Criteria resolution
// ---------------------------------------------------------------------------

struct Resolved<'q> {
    path: &'static str,
    expr: Expr,
    value: &'q CriterionValue,
}

fn value_shape_ok(kind: Kind, expr: Expr, value: &CriterionValue) -> bool {
    use CriterionValue as C;
    match expr {
        Expr::Null => matches!(value, C::Bool(_)),
        Expr::In | Expr::InLike => matches!(value, C::StrList(_)),
        Expr::Like | Expr::Regex => matches!(value, C::Str(_)),
        Expr::Gt | Expr::Gte | Expr::Lt | Expr::Lte => matches!(value, C::Int(_) | C::Float(_)),
        Expr::Eq | Expr::Not => match kind {
            Kind::Str => matches!(value, C::Str(_)),
            Kind::Num => matches!(value, C::Int(_) | C::Float(_)),
            Kind::Bool => matches!(value, C::Bool(_)),
        },
    }
}

fn resolve<'q>(
    criteria: &'q [(String, CriterionValue)],
    rules: &'static [Rule],
) -> Result<Vec<Resolved<'q>>> {
    let mut resolved = Vec::with_capacity(criteria.len());
    let mut unknown = Vec::new();
    'next: for (key, value) in criteria {
        for rule in rules {
            for &expr in rule.kind.exprs() {
                let matches_key = if expr == Expr::Eq {
                    key == rule.key
                } else {
                    key.strip_prefix(rule.key)
                        .and_then(|rest| rest.strip_prefix('_'))
                        .is_some_and(|suffix| suffix == expr.suffix())
                };
                if matches_key {
                    if !value_shape_ok(rule.kind, expr, value) {
                        return Err(WinspectError::InvalidArgument(format!(
                            "criterion '{key}' has an incompatible value shape: {value:?}"
                        )));
                    }
                    resolved.push(Resolved { path: rule.path, expr, value });
                    continue 'next;
                }
            }
        }
        unknown.push(key.as_str());
    }
    if !unknown.is_empty() {
        return Err(WinspectError::InvalidArgument(format!(
            "unsupported key(s): {}",
            unknown.join(", ")
        )));
    }
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Operator evaluation
// ---------------------------------------------------------------------------

fn as_number(v: &PropertyValue) -> Option<f64> {
    match v {
        PropertyValue::Int(n) => Some(*n as f64),
        PropertyValue::Float(n) => Some(*n),
        _ => None,
    }
}

fn criterion_number(v: &CriterionValue) -> Option<f64> {
    match v {
        CriterionValue::Int(n) => Some(*n as f64),
        CriterionValue::Float(n) => Some(*n),
        _ => None,
    }
}

/// Null semantics: an absent or empty value counts as null.
fn is_null(lhs: &Option<PropertyValue>) -> bool {
    match lhs {
        None => true,
        Some(PropertyValue::Str(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn equals(lhs: &PropertyValue, value: &CriterionValue) -> bool {
    match (lhs, value) {
        (PropertyValue::Str(a), CriterionValue::Str(b)) => a == b,
        (PropertyValue::Bool(a), CriterionValue::Bool(b)) => a == b,
        _ => match (as_number(lhs), criterion_number(value)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn eval(expr: Expr, lhs: Option<PropertyValue>, value: &CriterionValue, ignore_case: bool) -> Result<bool> {
    // null tests run before the absence short-circuit
    if expr == Expr::Null {
        let CriterionValue::Bool(want_null) = value else {
            unreachable!("shape validated at resolution");
        };
        return Ok(is_null(&lhs) == *want_null);
    }
    let Some(mut lhs) = lhs else {
        return Ok(false);
    };

    // query-wide case folding, applied recursively on both sides
    let value = if ignore_case {
        if let PropertyValue::Str(s) = &lhs {
            lhs = PropertyValue::Str(s.to_lowercase());
        }
        match value {
            CriterionValue::Str(s) => CriterionValue::Str(s.to_lowercase()),
            CriterionValue::StrList(v) => {
                CriterionValue::StrList(v.iter().map(|s| s.to_lowercase()).collect())
            }
            other => other.clone(),
        }
    } else {
        value.clone()
    };

    Ok(match expr {
        Expr::Eq => equals(&lhs, &value),
        Expr::Not => !equals(&lhs, &value),
        Expr::Like => match (&lhs, &value) {
            (PropertyValue::Str(a), CriterionValue::Str(b)) => a.contains(b.as_str()),
            _ => false,
        },
        Expr::In => match (&lhs, &value) {
            (PropertyValue::Str(a), CriterionValue::StrList(list)) => list.contains(a),
            _ => false,
        },
        Expr::InLike => match (&lhs, &value) {
            (PropertyValue::Str(a), CriterionValue::StrList(list)) => {
                list.iter().any(|v| a.contains(v.as_str()))
            }
            _ => false,
        },
        Expr::Regex => match (&lhs, &value) {
            (PropertyValue::Str(a), CriterionValue::Str(pattern)) => {
                let re = Regex::new(pattern).map_err(|e| {
                    WinspectError::InvalidArgument(format!("bad regex '{pattern}': {e}"))
                })?;
                // anchored at the start, like a prefix match
                re.find(a).is_some_and(|m| m.start() == 0)
            }
            _ => false,
        },
        Expr::Gt | Expr::Gte | Expr::Lt | Expr::Lte => {
            match (as_number(&lhs), criterion_number(&value)) {
                (Some(a), Some(b)) => match expr {
                    Expr::Gt => a > b,
                    Expr::Gte => a >= b,
                    Expr::Lt => a < b,
                    _ => a <= b,
                },
                _ => false,
            }
        }
        Expr::Null => unreachable!("handled above"),
    })
}

// ---------------------------------------------------------------------------
// The tree abstraction
// ---------------------------------------------------------------------------

/// A queryable element.  Implementations are cheap clones of a shared
/// inner handle; `release` must be idempotent.
pub trait TreeNode: Sized + Clone {
    /// Capture the element's attributes.  May call into the backend.
    fn snapshot(&self) -> Result<Snapshot>;

    /// Materialise the children, in `index_in_parent` order.
    fn children(&self) -> Result<Vec<Self>>;

    /// Release the native handle.  Safe to call more than once.
    fn release(&self);

    /// The backend's rule table.
    fn rules(&self) -> &'static [Rule];
}

/// Evaluate a query against one element.
///
/// An empty query is explicitly `false`.  Filters run first, in order,
/// short-circuiting; criteria are conjunctive.
pub fn matches<N: TreeNode>(node: &N, query: &Query) -> Result<bool> {
    if query.is_empty() {
        return Ok(false);
    }
    let resolved = resolve(&query.criteria, node.rules())?;
    let snap = node.snapshot()?;
    for filter in &query.filters {
        if !filter(&snap) {
            return Ok(false);
        }
    }
    for c in &resolved {
        if !eval(c.expr, snap.lookup(c.path), c.value, query.ignore_case)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// `matches`, downgraded for traversal: a backend failure on one element
/// is logged and treated as a non-match; programmer errors still abort.
fn matches_lenient<N: TreeNode>(node: &N, query: &Query) -> Result<bool> {
    match matches(node, query) {
        Ok(hit) => Ok(hit),
        Err(err @ WinspectError::InvalidArgument(_)) => Err(err),
        Err(err) => {
            log::warn!("element read failed during traversal, treating as non-match: {err}");
            Ok(false)
        }
    }
}

/// Children, downgraded the same way: a failing element contributes an
/// empty branch instead of aborting the walk.
fn children_lenient<N: TreeNode>(node: &N) -> Vec<N> {
    match node.children() {
        Ok(children) => children,
        Err(err) => {
            log::warn!("child enumeration failed during traversal: {err}");
            Vec::new()
        }
    }
}

/// Pre-order traversal of the whole subtree, including the argument.
/// Nothing is released; the caller owns every returned element.
pub fn find_all_elements<N: TreeNode>(node: &N) -> Result<Vec<N>> {
    let mut found = vec![node.clone()];
    for child in children_lenient(node) {
        found.extend(find_all_elements(&child)?);
    }
    Ok(found)
}

/// All matching descendants (and the argument itself when `include_self`),
/// in pre-order.  Visited non-matching elements are released; matches are
/// handed to the caller unreleased.
pub fn find_elements<N: TreeNode>(node: &N, query: &Query, include_self: bool) -> Result<Vec<N>> {
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    if include_self && matches_lenient(node, query)? {
        found.push(node.clone());
    }
    collect_matches(node, query, &mut found)?;
    Ok(found)
}

fn collect_matches<N: TreeNode>(node: &N, query: &Query, found: &mut Vec<N>) -> Result<()> {
    for child in children_lenient(node) {
        let hit = matches_lenient(&child, query)?;
        if hit {
            found.push(child.clone());
        }
        collect_matches(&child, query, found)?;
        if !hit {
            child.release();
        }
    }
    Ok(())
}

/// First match in depth-first pre-order, or `None`.
///
/// Every materialised element that is not returned -- mismatches, explored
/// branches, and siblings made moot by an earlier hit -- is released.
pub fn find_element<N: TreeNode>(node: &N, query: &Query, include_self: bool) -> Result<Option<N>> {
    if query.is_empty() {
        return Ok(None);
    }
    if include_self && matches_lenient(node, query)? {
        return Ok(Some(node.clone()));
    }
    first_match(node, query)
}

fn first_match<N: TreeNode>(node: &N, query: &Query) -> Result<Option<N>> {
    let mut pending = children_lenient(node).into_iter();
    while let Some(child) = pending.next() {
        if matches_lenient(&child, query)? {
            for rest in pending {
                rest.release();
            }
            return Ok(Some(child));
        }
        let deep = first_match(&child, query)?;
        child.release();
        if deep.is_some() {
            for rest in pending {
                rest.release();
            }
            return Ok(deep);
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    // -- a counting mock backend ------------------------------------------

    const MOCK_RULES: &[Rule] = &[
        rule("role", Kind::Str),
        rule("name", Kind::Str),
        rule("text", Kind::Str),
        rule("x", Kind::Num),
        rule("width", Kind::Num),
        rule("depth", Kind::Num),
        rule("enabled", Kind::Bool),
        rule("visible", Kind::Bool),
        Rule { key: "parent_name", path: "parent.name", kind: Kind::Str },
    ];

    struct Inner {
        snap: Snapshot,
        children: Vec<Mock>,
        release_calls: Cell<u32>,
        fail_snapshot: bool,
    }

    #[derive(Clone)]
    struct Mock(Rc<Inner>);

    impl Mock {
        fn leaf(role: &str, name: &str, depth: i64) -> Mock {
            Mock::branch(role, name, depth, vec![])
        }

        fn branch(role: &str, name: &str, depth: i64, children: Vec<Mock>) -> Mock {
            Mock(Rc::new(Inner {
                snap: Snapshot {
                    role: Some(role.into()),
                    name: Some(name.into()),
                    depth: Some(depth),
                    rectangle: Some(crate::geometry::Rect::new(0, 0, 50, 20)),
                    enabled: Some(true),
                    ..Snapshot::default()
                },
                children,
                release_calls: Cell::new(0),
                fail_snapshot: false,
            }))
        }

        fn failing() -> Mock {
            Mock(Rc::new(Inner {
                snap: Snapshot::default(),
                children: vec![],
                release_calls: Cell::new(0),
                fail_snapshot: true,
            }))
        }

        fn releases(&self) -> u32 {
            self.0.release_calls.get()
        }

        fn name(&self) -> &str {
            self.0.snap.name.as_deref().unwrap_or("")
        }
    }

    impl TreeNode for Mock {
        fn snapshot(&self) -> Result<Snapshot> {
            if self.0.fail_snapshot {
                return Err(WinspectError::BackendCall("mock snapshot failure".into()));
            }
            Ok(self.0.snap.clone())
        }

        fn children(&self) -> Result<Vec<Mock>> {
            Ok(self.0.children.clone())
        }

        fn release(&self) {
            self.0.release_calls.set(self.0.release_calls.get() + 1);
        }

        fn rules(&self) -> &'static [Rule] {
            MOCK_RULES
        }
    }

    /// root -> { button "OK", button "Cancel", text "title" }
    fn s4_tree() -> (Mock, Mock, Mock, Mock) {
        let ok = Mock::leaf("button", "OK", 1);
        let cancel = Mock::leaf("button", "Cancel", 1);
        let title = Mock::leaf("text", "title", 1);
        let root = Mock::branch("window", "root", 0, vec![ok.clone(), cancel.clone(), title.clone()]);
        (root, ok, cancel, title)
    }

    fn check(key: &str, value: impl Into<CriterionValue>, snap: Snapshot) -> Result<bool> {
        let node = Mock(Rc::new(Inner {
            snap,
            children: vec![],
            release_calls: Cell::new(0),
            fail_snapshot: false,
        }));
        matches(&node, &Query::new().criterion(key, value))
    }

    fn named(name: Option<&str>) -> Snapshot {
        Snapshot { name: name.map(str::to_owned), ..Snapshot::default() }
    }

    // -- emptiness ---------------------------------------------------------

    #[test]
    fn test_empty_query_never_matches() {
        let (root, ok, ..) = s4_tree();
        assert!(!matches(&root, &Query::new()).unwrap());
        assert!(find_elements(&root, &Query::new(), true).unwrap().is_empty());
        assert!(find_element(&root, &Query::new(), true).unwrap().is_none());
        assert_eq!(ok.releases(), 0, "empty queries must not touch the tree");
    }

    // -- operator truth tables --------------------------------------------

    #[test]
    fn test_str_operators() {
        let v = || named(Some("value"));
        // eq
        assert!(check("name", "value", v()).unwrap());
        assert!(!check("name", "other", v()).unwrap());
        assert!(!check("name", "value", named(None)).unwrap());
        // not
        assert!(!check("name_not", "value", v()).unwrap());
        assert!(check("name_not", "other", v()).unwrap());
        assert!(!check("name_not", "other", named(None)).unwrap());
        // like
        assert!(check("name_like", "alu", v()).unwrap());
        assert!(!check("name_like", "zzz", v()).unwrap());
        assert!(!check("name_like", "alu", named(None)).unwrap());
        // in
        assert!(check("name_in", vec!["value", "x"], v()).unwrap());
        assert!(!check("name_in", vec!["a", "b"], v()).unwrap());
        // in_like
        assert!(check("name_in_like", vec!["zzz", "alu"], v()).unwrap());
        assert!(!check("name_in_like", vec!["zzz", "yyy"], v()).unwrap());
        // regex (anchored at the start)
        assert!(check("name_regex", "va.ue", v()).unwrap());
        assert!(check("name_regex", "val", v()).unwrap());
        assert!(!check("name_regex", "alue", v()).unwrap());
        // null
        assert!(check("name_null", true, named(None)).unwrap());
        assert!(check("name_null", true, named(Some(""))).unwrap());
        assert!(!check("name_null", true, v()).unwrap());
        assert!(check("name_null", false, v()).unwrap());
        assert!(!check("name_null", false, named(None)).unwrap());
    }

    #[test]
    fn test_num_operators() {
        let snap = || Snapshot {
            rectangle: Some(crate::geometry::Rect::new(30, 0, 80, 20)),
            ..Snapshot::default()
        };
        assert!(check("x", 30, snap()).unwrap());
        assert!(!check("x", 31, snap()).unwrap());
        assert!(check("x_not", 31, snap()).unwrap());
        assert!(check("x_gt", 29, snap()).unwrap());
        assert!(!check("x_gt", 30, snap()).unwrap());
        assert!(check("x_gte", 30, snap()).unwrap());
        assert!(check("x_lt", 31, snap()).unwrap());
        assert!(!check("x_lt", 30, snap()).unwrap());
        assert!(check("x_lte", 30, snap()).unwrap());
        assert!(check("width", 50, snap()).unwrap());
        // absent number: all comparisons false, null true
        assert!(!check("x_gt", 0, Snapshot::default()).unwrap());
        assert!(check("x_null", true, Snapshot::default()).unwrap());
        assert!(!check("x_null", true, snap()).unwrap());
    }

    #[test]
    fn test_bool_operators() {
        let snap = || Snapshot { enabled: Some(true), ..Snapshot::default() };
        assert!(check("enabled", true, snap()).unwrap());
        assert!(!check("enabled", false, snap()).unwrap());
        assert!(check("enabled_not", false, snap()).unwrap());
        assert!(!check("enabled", true, Snapshot::default()).unwrap());
        assert!(check("enabled_null", true, Snapshot::default()).unwrap());
        assert!(check("enabled_null", false, snap()).unwrap());
    }

    // -- conjunction and filters ------------------------------------------

    #[test]
    fn test_criteria_are_conjunctive() {
        let (_, _, cancel, _) = s4_tree();
        let both = Query::new().criterion("role", "button").criterion("name", "Cancel");
        assert!(matches(&cancel, &both).unwrap());
        let conflicting = Query::new().criterion("role", "button").criterion("name", "OK");
        assert!(!matches(&cancel, &conflicting).unwrap());
    }

    #[test]
    fn test_filters_run_before_criteria() {
        let (_, ok, ..) = s4_tree();
        let q = Query::new()
            .filter(|s| s.role.as_deref() == Some("button"))
            .criterion("name", "OK");
        assert!(matches(&ok, &q).unwrap());
        let rejecting = Query::new()
            .filter(|_| false)
            .criterion("name", "OK");
        assert!(!matches(&ok, &rejecting).unwrap());
        // a filter alone is a non-empty query
        let filter_only = Query::new().filter(|s| s.name.as_deref() == Some("OK"));
        assert!(matches(&ok, &filter_only).unwrap());
    }

    // -- case folding ------------------------------------------------------

    #[test]
    fn test_ignore_case_folds_both_sides_recursively() {
        let foo = named(Some("Foo"));
        let q = |key: &str, v: CriterionValue| {
            let node = Mock(Rc::new(Inner {
                snap: foo.clone(),
                children: vec![],
                release_calls: Cell::new(0),
                fail_snapshot: false,
            }));
            matches(&node, &Query::new().ignore_case(true).criterion(key, v)).unwrap()
        };
        assert!(q("name", "foo".into()));
        assert!(q("name_like", "OO".into()));
        assert!(q("name_in", vec!["foo", "bar"].into()));
        assert!(q("name_in_like", vec!["ZZ", "fO"].into()));
        // without the flag none of these match
        assert!(!check("name", "foo", foo.clone()).unwrap());
    }

    // -- programmer errors -------------------------------------------------

    #[test]
    fn test_unknown_key_is_invalid_argument() {
        let (root, ..) = s4_tree();
        let q = Query::new().criterion("colour", "red");
        assert!(matches!(
            matches(&root, &q),
            Err(WinspectError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_shape_mismatch_is_invalid_argument() {
        let (root, ..) = s4_tree();
        for q in [
            Query::new().criterion("name", 7),
            Query::new().criterion("name_in", "not-a-list"),
            Query::new().criterion("x_gt", "nine"),
            Query::new().criterion("enabled", "yes"),
            Query::new().criterion("name_null", "absent"),
        ] {
            assert!(matches!(
                matches(&root, &q),
                Err(WinspectError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_bad_regex_is_invalid_argument() {
        let (_, ok, ..) = s4_tree();
        let q = Query::new().criterion("name_regex", "(unclosed");
        assert!(matches!(
            matches(&ok, &q),
            Err(WinspectError::InvalidArgument(_))
        ));
    }

    // -- dotted rule paths -------------------------------------------------

    #[test]
    fn test_dotted_rule_path() {
        let mut snap = named(Some("child"));
        snap.parent = Some(Box::new(named(Some("dialog"))));
        assert!(check("parent_name", "dialog", snap).unwrap());
        // a missing intermediate yields null on the left: eq is false,
        // null=true is true
        assert!(!check("parent_name", "dialog", named(Some("orphan"))).unwrap());
        assert!(check("parent_name_null", true, named(Some("orphan"))).unwrap());
    }

    // -- traversal order and scenarios ------------------------------------

    #[test]
    fn test_find_all_elements_is_preorder() {
        let c = Mock::leaf("text", "c", 2);
        let b = Mock::branch("pane", "b", 1, vec![c.clone()]);
        let d = Mock::leaf("text", "d", 1);
        let root = Mock::branch("window", "a", 0, vec![b.clone(), d.clone()]);
        let all = find_all_elements(&root).unwrap();
        let names: Vec<_> = all.iter().map(|n| n.name().to_owned()).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
        // find_all_elements releases nothing
        for node in [&root, &b, &c, &d] {
            assert_eq!(node.releases(), 0);
        }
    }

    #[test]
    fn test_depth_invariant() {
        let c = Mock::leaf("text", "c", 2);
        let b = Mock::branch("pane", "b", 1, vec![c]);
        let root = Mock::branch("window", "a", 0, vec![b]);
        fn walk(node: &Mock) {
            let d = node.snapshot().unwrap().depth.unwrap();
            for child in node.children().unwrap() {
                assert_eq!(child.snapshot().unwrap().depth.unwrap(), d + 1);
                walk(&child);
            }
        }
        walk(&root);
    }

    #[test]
    fn test_find_elements_by_role_in_order() {
        let (root, ok, cancel, title) = s4_tree();
        let q = Query::new().criterion("role", "button");
        let found = find_elements(&root, &q, false).unwrap();
        let names: Vec<_> = found.iter().map(|n| n.name().to_owned()).collect();
        assert_eq!(names, ["OK", "Cancel"]);
        // matches kept, the mismatch released exactly once, argument kept
        assert_eq!(ok.releases(), 0);
        assert_eq!(cancel.releases(), 0);
        assert_eq!(title.releases(), 1);
        assert_eq!(root.releases(), 0);
    }

    #[test]
    fn test_find_element_first_match_and_release_discipline() {
        let (root, ok, cancel, title) = s4_tree();
        let q = Query::new().criterion("role", "button").criterion("name", "Cancel");
        let found = find_element(&root, &q, false).unwrap().expect("Cancel exists");
        assert_eq!(found.name(), "Cancel");
        // OK was visited and mismatched: released once; the title sibling
        // was materialised but obsoleted by the hit: released once
        assert_eq!(ok.releases(), 1);
        assert_eq!(cancel.releases(), 0);
        assert_eq!(title.releases(), 1);
        assert_eq!(root.releases(), 0);
    }

    #[test]
    fn test_find_element_is_depth_first() {
        // root -> { a { target }, target2 } : the nested target wins
        let nested = Mock::leaf("button", "target", 2);
        let a = Mock::branch("pane", "a", 1, vec![nested.clone()]);
        let later = Mock::leaf("button", "late", 1);
        let root = Mock::branch("window", "root", 0, vec![a.clone(), later.clone()]);
        let q = Query::new().criterion("role", "button");
        let found = find_element(&root, &q, false).unwrap().unwrap();
        assert_eq!(found.name(), "target");
        // the intermediate pane was explored and released; the later
        // sibling was never needed yet must not leak
        assert_eq!(a.releases(), 1);
        assert_eq!(later.releases(), 1);
        assert_eq!(nested.releases(), 0);
    }

    #[test]
    fn test_find_elements_releases_explored_branches() {
        // root -> a -> b -> match : only the match survives
        let hit = Mock::leaf("button", "deep", 3);
        let b = Mock::branch("pane", "b", 2, vec![hit.clone()]);
        let a = Mock::branch("pane", "a", 1, vec![b.clone()]);
        let root = Mock::branch("window", "root", 0, vec![a.clone()]);
        let q = Query::new().criterion("role", "button");
        let found = find_elements(&root, &q, false).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(a.releases(), 1);
        assert_eq!(b.releases(), 1);
        assert_eq!(hit.releases(), 0);
    }

    #[test]
    fn test_include_self_is_explicit() {
        let (root, ..) = s4_tree();
        let q = Query::new().criterion("role", "window");
        assert!(find_element(&root, &q, false).unwrap().is_none());
        let with_self = find_element(&root, &q, true).unwrap().unwrap();
        assert_eq!(with_self.name(), "root");
        let listed = find_elements(&root, &q, true).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_ignore_case_substring_scenario() {
        // spec scenario S5: ignore_case + name_like "ok" finds the OK button
        let (root, ..) = s4_tree();
        let q = Query::new().ignore_case(true).criterion("name_like", "ok");
        let found = find_elements(&root, &q, false).unwrap();
        let names: Vec<_> = found.iter().map(|n| n.name().to_owned()).collect();
        assert_eq!(names, ["OK"]);
    }

    #[test]
    fn test_backend_failure_is_tolerated_and_released() {
        let broken = Mock::failing();
        let good = Mock::leaf("button", "fine", 1);
        let root = Mock::branch("window", "root", 0, vec![broken.clone(), good.clone()]);
        let q = Query::new().criterion("role", "button");
        let found = find_elements(&root, &q, false).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name(), "fine");
        // the failing element was treated as a non-match and released
        assert_eq!(broken.releases(), 1);
    }
}
