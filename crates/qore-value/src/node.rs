//! The reference-counted heap entity (component F) backing `Value`'s
//! `Node` tag.
//!
//! A flat variant enum with a dispatch `match`, not a trait-object
//! hierarchy over a base class — per spec.md §9's design note preferring
//! this over "classical deep inheritance for Nodes", and grounded on how
//! the teacher's `StackItem` enum (`examples/r3e-network-neo-rs/crates/vm/
//! src/stack_item/stack_item.rs`) represents its own heap-ish variants the
//! same way. Reference counting rides on `Arc`'s own strong count rather
//! than a hand-rolled atomic counter: `ref()` is `Arc::clone`, `deref`
//! inspects `Arc::strong_count` to detect "about to become unreachable"
//! before letting the `Arc` itself drop.

use crate::encoding::Encoding;
use crate::value::Value;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use qore_sink::ExceptionSink;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type Sink = ExceptionSink<Value>;

/// One absolute instant or relative duration, per spec.md §3's Date row
/// ("Epoch-relative or interval + timezone"). Absolute instants carry a
/// `chrono_tz::Tz` rather than a bare zone-name string so that `Display`
/// and arithmetic both go through `chrono`'s own calendar math instead of
/// a hand-rolled millisecond offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QoreDate {
    Absolute { instant: DateTime<Utc>, tz: Tz },
    Relative { duration: ChronoDuration },
}

impl QoreDate {
    pub fn absolute(instant: DateTime<Utc>, tz: Tz) -> Self {
        QoreDate::Absolute { instant, tz }
    }

    pub fn relative_millis(millis: i64) -> Self {
        QoreDate::Relative {
            duration: ChronoDuration::milliseconds(millis),
        }
    }

    /// `Date + Integer -> Date`: absolute + relative -> absolute, relative
    /// + relative -> relative (spec.md §4.H).
    pub fn add(&self, other: &QoreDate) -> QoreDate {
        match (self, other) {
            (QoreDate::Absolute { instant, tz }, QoreDate::Relative { duration })
            | (QoreDate::Relative { duration }, QoreDate::Absolute { instant, tz }) => {
                QoreDate::Absolute {
                    instant: *instant + *duration,
                    tz: *tz,
                }
            }
            (QoreDate::Relative { duration: a }, QoreDate::Relative { duration: b }) => {
                QoreDate::Relative { duration: *a + *b }
            }
            (QoreDate::Absolute { instant: a, tz }, QoreDate::Absolute { instant: b, .. }) => {
                // absolute + absolute has no natural calendar meaning; the
                // runtime treats the right side's offset from the epoch as
                // a relative duration added to the left.
                let offset = ChronoDuration::milliseconds(b.timestamp_millis());
                QoreDate::Absolute {
                    instant: *a + offset,
                    tz: *tz,
                }
            }
        }
    }
}

impl fmt::Display for QoreDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QoreDate::Absolute { instant, tz } => write!(f, "{}", instant.with_timezone(tz)),
            QoreDate::Relative { duration } => {
                write!(f, "PT{:.3}S", duration.num_milliseconds() as f64 / 1000.0)
            }
        }
    }
}

/// Per-class private-data slot and member hash for an Object node.
/// The user-defined destructor (if any) is invoked at most once, the
/// first time this object's last reference is released — either through
/// an explicit `deref(sink)` that observes uniqueness, or, failing that,
/// through the `Drop` fallback net below (logged rather than raised,
/// since `Drop` cannot accept a sink; see DESIGN.md).
pub struct ObjectData {
    pub class_name: String,
    pub members: indexmap::IndexMap<String, Value>,
    pub destructor: Option<Arc<dyn Fn(&indexmap::IndexMap<String, Value>, &mut Sink) + Send + Sync>>,
    closed: AtomicBool,
}

impl ObjectData {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            members: indexmap::IndexMap::new(),
            destructor: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn run_destructor_once(&self, sink: &mut Sink) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(destructor) = &self.destructor {
            destructor(&self.members, sink);
        }
    }
}

impl Clone for ObjectData {
    fn clone(&self) -> Self {
        Self {
            class_name: self.class_name.clone(),
            members: self.members.clone(),
            destructor: self.destructor.clone(),
            closed: AtomicBool::new(self.closed.load(Ordering::SeqCst)),
        }
    }
}

impl fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectData")
            .field("class_name", &self.class_name)
            .field("members", &self.members)
            .finish()
    }
}

impl Drop for ObjectData {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Some(destructor) = &self.destructor {
                let mut fallback: Sink = ExceptionSink::new();
                destructor(&self.members, &mut fallback);
                if fallback.is_exception() {
                    log::error!(
                        "destructor of object of class {} raised during implicit drop (no sink reachable here)",
                        self.class_name
                    );
                }
                fallback.clear();
            }
        }
    }
}

/// A captured callable plus its environment, per spec.md §3's
/// CallReference row ("Closure over callable + capture environment").
/// The environment is itself reference-counted, as a `Value`.
#[derive(Debug, Clone)]
pub struct CallRefData {
    pub function_name: String,
    pub captured_env: Option<Value>,
}

/// A not-yet-evaluated operator application, only alive during the parse
/// phase (`needs_eval = true`, `is_value = false`).
#[derive(Debug, Clone)]
pub struct ParseNodeData {
    pub operator: String,
    pub operands: Vec<Value>,
}

#[derive(Debug, Clone)]
pub enum NodeData {
    String { bytes: Vec<u8>, encoding: Encoding },
    Integer(i64),
    Float(f64),
    Number(rust_decimal::Decimal),
    Boolean(bool),
    Date(QoreDate),
    Binary(bytes::Bytes),
    List(Vec<Value>),
    Hash(indexmap::IndexMap<String, Value>),
    Object(ObjectData),
    CallReference(CallRefData),
    ParseNode(ParseNodeData),
}

/// Whether a variant's realCopy is a ref-bump (immutable) or a spine copy
/// (mutable-via-copy-on-unique), per spec.md §3's Immutability column.
fn is_immutable(data: &NodeData) -> bool {
    matches!(
        data,
        NodeData::Integer(_)
            | NodeData::Float(_)
            | NodeData::Number(_)
            | NodeData::Boolean(_)
            | NodeData::Date(_)
            | NodeData::CallReference(_)
            | NodeData::ParseNode(_)
    )
}

struct NodeInner {
    data: NodeData,
    is_value: bool,
    needs_eval: bool,
}

/// A reference-counted heap handle. Cloning is a ref-bump (`Arc::clone`);
/// there is no implicit deep copy anywhere in this type.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

impl Node {
    pub fn new(data: NodeData) -> Self {
        let needs_eval = matches!(data, NodeData::ParseNode(_))
            || matches!(data, NodeData::List(ref items) if items.iter().any(Value::needs_eval))
            || matches!(data, NodeData::Hash(ref items) if items.values().any(Value::needs_eval));
        let is_value = !matches!(data, NodeData::ParseNode(_));
        Self(Arc::new(NodeInner {
            data,
            is_value,
            needs_eval,
        }))
    }

    pub fn data(&self) -> &NodeData {
        &self.0.data
    }

    pub fn is_value(&self) -> bool {
        self.0.is_value
    }

    pub fn needs_eval(&self) -> bool {
        self.0.needs_eval
    }

    /// Atomic increment: a ref-bumped handle to the same heap entity.
    pub fn node_ref(&self) -> Node {
        self.clone()
    }

    /// Atomic decrement. If this was the last reference, runs the
    /// variant's destructor (which may append to `sink`) before the
    /// backing allocation is actually freed.
    ///
    /// `Arc::try_unwrap` only succeeds when this handle is the sole owner,
    /// and on success it hands back the payload *by value*: a container's
    /// children are moved out of the `Vec`/`IndexMap` rather than cloned,
    /// so each child's own `Arc` strong count drops to what it would be
    /// without this handle's container around it, and the recursive
    /// `deref` call below sees a true uniqueness count instead of one
    /// inflated by a throwaway ref-bump.
    pub fn deref(self, sink: &mut Sink) {
        let inner = match Arc::try_unwrap(self.0) {
            Ok(inner) => inner,
            Err(_still_shared) => return,
        };
        match inner.data {
            NodeData::Object(obj) => obj.run_destructor_once(sink),
            NodeData::List(items) => {
                for item in items {
                    if let Value::Node(n) = item {
                        n.deref(sink);
                    }
                }
            }
            NodeData::Hash(items) => {
                for (_, item) in items {
                    if let Value::Node(n) = item {
                        n.deref(sink);
                    }
                }
            }
            _ => {}
        }
    }

    /// `realCopy()`: for immutable variants, a ref-bump; for containers
    /// and other mutable-via-copy-on-unique variants, a fresh spine copy
    /// sharing child references.
    pub fn real_copy(&self) -> Node {
        if is_immutable(&self.0.data) {
            self.clone()
        } else {
            Node::new(self.0.data.clone())
        }
    }

    /// Gives mutable access to this node's payload iff this handle is the
    /// sole owner (`Arc::strong_count == 1`). Callers implementing
    /// copy-on-unique call `real_copy()` first when this returns `None`.
    pub fn data_mut(&mut self) -> Option<&mut NodeData> {
        Arc::get_mut(&mut self.0).map(|inner| &mut inner.data)
    }

    pub fn is_equal_hard(&self, other: &Node) -> bool {
        use NodeData::*;
        match (&self.0.data, &other.0.data) {
            (String { bytes: a, encoding: ea }, String { bytes: b, encoding: eb }) => a == b && ea == eb,
            (Integer(a), Integer(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (Boolean(a), Boolean(b)) => a == b,
            (Date(a), Date(b)) => a == b,
            (Binary(a), Binary(b)) => a == b,
            (List(a), List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_equal_hard(y))
            }
            (Hash(a), Hash(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|bv| v.is_equal_hard(bv)))
            }
            (Object(a), Object(b)) => std::ptr::eq(a, b),
            (CallReference(a), CallReference(b)) => a.function_name == b.function_name,
            _ => false,
        }
    }

    pub fn is_equal_soft(&self, other: &Node) -> bool {
        use NodeData::*;
        match (&self.0.data, &other.0.data) {
            (String { .. }, _) | (_, String { .. }) => {
                self.coerce_string_lossy() == other.coerce_string_lossy()
            }
            (Integer(_) | Float(_) | Number(_) | Boolean(_), Integer(_) | Float(_) | Number(_) | Boolean(_)) => {
                self.coerce_float() == other.coerce_float()
            }
            (List(a), List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_equal_soft(y))
            }
            (Hash(a), Hash(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|bv| v.is_equal_soft(bv)))
            }
            _ => self.is_equal_hard(other),
        }
    }

    fn coerce_string_lossy(&self) -> String {
        match &self.0.data {
            NodeData::String { bytes, .. } => String::from_utf8_lossy(bytes).into_owned(),
            NodeData::Integer(i) => i.to_string(),
            NodeData::Float(f) => f.to_string(),
            NodeData::Number(n) => n.to_string(),
            NodeData::Boolean(b) => b.to_string(),
            _ => String::new(),
        }
    }

    fn coerce_float(&self) -> f64 {
        match &self.0.data {
            NodeData::Integer(i) => *i as f64,
            NodeData::Float(f) => *f,
            NodeData::Number(n) => {
                use rust_decimal::prelude::ToPrimitive;
                n.to_f64().unwrap_or(0.0)
            }
            NodeData::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            NodeData::String { bytes, .. } => String::from_utf8_lossy(bytes).trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Node").field(&self.0.data).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_and_deref_is_a_no_op_through_the_sink() {
        let node = Node::new(NodeData::Integer(42));
        let mut sink: Sink = ExceptionSink::new();
        let bumped = node.node_ref();
        bumped.deref(&mut sink);
        assert!(!sink.is_exception());
        node.deref(&mut sink);
        assert!(!sink.is_exception());
    }

    #[test]
    fn real_copy_of_scalar_is_a_ref_bump() {
        let node = Node::new(NodeData::Integer(7));
        let copy = node.real_copy();
        assert_eq!(Arc::strong_count(&node.0), 2);
        assert_eq!(Arc::strong_count(&copy.0), 2);
    }

    #[test]
    fn real_copy_of_list_is_a_spine_copy() {
        let node = Node::new(NodeData::List(vec![Value::from_int(1)]));
        let copy = node.real_copy();
        assert_eq!(Arc::strong_count(&node.0), 1);
        assert_eq!(Arc::strong_count(&copy.0), 1);
    }

    #[test]
    fn is_equal_hard_implies_is_equal_soft() {
        let a = Node::new(NodeData::Integer(5));
        let b = Node::new(NodeData::Integer(5));
        assert!(a.is_equal_hard(&b));
        assert!(a.is_equal_soft(&b));
    }

    #[test]
    fn object_destructor_runs_on_last_deref() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let mut obj = ObjectData::new("Thing");
        obj.destructor = Some(Arc::new(move |_, _sink| {
            ran2.store(true, Ordering::SeqCst);
        }));
        let node = Node::new(NodeData::Object(obj));
        let mut sink: Sink = ExceptionSink::new();
        node.deref(&mut sink);
        assert!(ran.load(Ordering::SeqCst));
    }

    /// spec.md §4.F's worked example: a hash uniquely owning an object
    /// whose `destructor()` raises must surface that exception on the
    /// sink passed to the hash's own `deref`, not swallow it through the
    /// `Drop` fallback.
    #[test]
    fn hash_deref_propagates_nested_destructor_exception() {
        use qore_sink::RaiseSink;
        let mut obj = ObjectData::new("Widget");
        obj.destructor = Some(Arc::new(|_, sink| {
            sink.raise_tagged(
                qore_sink::ExceptionKind::User,
                "WIDGET-ERROR",
                "destructor raised".to_string(),
            );
        }));
        let object_node = Node::new(NodeData::Object(obj));

        let mut members = indexmap::IndexMap::new();
        members.insert("widget".to_string(), Value::Node(object_node));
        let hash_node = Node::new(NodeData::Hash(members));

        let mut sink: Sink = ExceptionSink::new();
        hash_node.deref(&mut sink);
        assert!(
            sink.is_exception(),
            "destructor exception must propagate through the owning hash's deref"
        );
    }
}
