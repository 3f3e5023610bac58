//! The tagged carrier (component E) that is the primary currency between
//! the evaluator and its callers.

use crate::encoding::Encoding;
use crate::node::{Node, NodeData, Sink};
use qore_sink::ExceptionSink;

/// A tagged value: an unboxed primitive, or a reference to a heap `Node`.
///
/// Cloning is cheap in every case: for the unboxed tags it's a `Copy`,
/// for `Node` it's a ref-bump. There is no implicit deep-copy path on
/// `Value` itself — deep-ish copying is `Node::real_copy`, called
/// explicitly by operators that need copy-on-write.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Node(Node),
}

impl Value {
    pub fn from_bool(b: bool) -> Self {
        Value::Bool(b)
    }

    pub fn from_int(i: i64) -> Self {
        Value::Int64(i)
    }

    pub fn from_float(f: f64) -> Self {
        Value::Float64(f)
    }

    // "Nothing" has no dedicated tag in this model, since spec.md's Value
    // tag set is exactly {Bool, Int64, Float64, Node}; callers represent
    // the absence of a value as `Option<Value>` at whatever boundary
    // needs it (e.g. the `+` operator's fallthrough case), not as a Value
    // variant of its own.

    pub fn from_string(s: impl Into<String>, encoding: Encoding) -> Self {
        Value::Node(Node::new(NodeData::String {
            bytes: s.into().into_bytes(),
            encoding,
        }))
    }

    pub fn from_binary(bytes: impl Into<bytes::Bytes>) -> Self {
        Value::Node(Node::new(NodeData::Binary(bytes.into())))
    }

    pub fn from_list(items: Vec<Value>) -> Self {
        Value::Node(Node::new(NodeData::List(items)))
    }

    pub fn from_hash(items: indexmap::IndexMap<String, Value>) -> Self {
        Value::Node(Node::new(NodeData::Hash(items)))
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn needs_eval(&self) -> bool {
        matches!(self, Value::Node(n) if n.needs_eval())
    }

    // ---- total coercions (spec.md §4.E) ----

    pub fn get_as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int64(i) => *i != 0,
            Value::Float64(f) => *f != 0.0,
            Value::Node(n) => match n.data() {
                NodeData::Integer(i) => *i != 0,
                NodeData::Float(f) => *f != 0.0,
                NodeData::Boolean(b) => *b,
                NodeData::Number(d) => !d.is_zero(),
                NodeData::String { bytes, .. } => !bytes.is_empty(),
                NodeData::Binary(b) => !b.is_empty(),
                NodeData::List(items) => !items.is_empty(),
                NodeData::Hash(items) => !items.is_empty(),
                _ => true,
            },
        }
    }

    pub fn get_as_int64(&self) -> i64 {
        match self {
            Value::Bool(b) => *b as i64,
            Value::Int64(i) => *i,
            Value::Float64(f) => *f as i64,
            Value::Node(n) => match n.data() {
                NodeData::Integer(i) => *i,
                NodeData::Float(f) => *f as i64,
                NodeData::Boolean(b) => *b as i64,
                NodeData::Number(d) => {
                    use rust_decimal::prelude::ToPrimitive;
                    d.to_i64().unwrap_or(0)
                }
                NodeData::String { bytes, .. } => parse_leading_int(&String::from_utf8_lossy(bytes)),
                _ => 0,
            },
        }
    }

    pub fn get_as_float(&self) -> f64 {
        match self {
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Int64(i) => *i as f64,
            Value::Float64(f) => *f,
            Value::Node(n) => match n.data() {
                NodeData::Integer(i) => *i as f64,
                NodeData::Float(f) => *f,
                NodeData::Boolean(b) => {
                    if *b {
                        1.0
                    } else {
                        0.0
                    }
                }
                NodeData::Number(d) => {
                    use rust_decimal::prelude::ToPrimitive;
                    d.to_f64().unwrap_or(0.0)
                }
                NodeData::String { bytes, .. } => {
                    String::from_utf8_lossy(bytes).trim().parse().unwrap_or(0.0)
                }
                _ => 0.0,
            },
        }
    }

    pub fn get_as_string(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Int64(i) => i.to_string(),
            Value::Float64(f) => f.to_string(),
            Value::Node(n) => match n.data() {
                NodeData::String { bytes, .. } => String::from_utf8_lossy(bytes).into_owned(),
                NodeData::Integer(i) => i.to_string(),
                NodeData::Float(f) => f.to_string(),
                NodeData::Boolean(b) => b.to_string(),
                NodeData::Number(d) => d.to_string(),
                NodeData::Date(d) => d.to_string(),
                _ => String::new(),
            },
        }
    }

    /// Encoding of this value if it is a string node, used by the `+`
    /// operator to decide the result encoding.
    pub fn string_encoding(&self) -> Option<Encoding> {
        match self {
            Value::Node(n) => match n.data() {
                NodeData::String { encoding, .. } => Some(*encoding),
                _ => None,
            },
            _ => None,
        }
    }

    /// If tagged `Node` but the payload is actually a boxed primitive
    /// (`IntegerNode`/`FloatNode`/`BooleanNode`), unpack it into the
    /// unboxed tag and drop the Node reference. Idempotent.
    pub fn sanitize(self, sink: &mut Sink) -> Value {
        if let Value::Node(n) = &self {
            let unpacked = match n.data() {
                NodeData::Integer(i) => Some(Value::Int64(*i)),
                NodeData::Float(f) => Some(Value::Float64(*f)),
                NodeData::Boolean(b) => Some(Value::Bool(*b)),
                _ => None,
            };
            if let Some(v) = unpacked {
                let Value::Node(n) = self else { unreachable!() };
                n.deref(sink);
                return v;
            }
        }
        self
    }

    /// Discards any held reference and sets `self` to `x`, returning the
    /// displaced value so the caller can `deref` it with a sink it knows
    /// is appropriate (a plain sink, or one tied to the thread currently
    /// unwinding an exception).
    pub fn assign(&mut self, x: Value) -> Value {
        std::mem::replace(self, x)
    }

    pub fn is_equal_hard(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a == b,
            (Value::Node(a), Value::Node(b)) => a.is_equal_hard(b),
            _ => false,
        }
    }

    pub fn is_equal_soft(&self, other: &Value) -> bool {
        if self.is_equal_hard(other) {
            return true;
        }
        match (self, other) {
            (Value::Node(a), Value::Node(b)) => a.is_equal_soft(b),
            (Value::Node(a), _) if matches!(a.data(), NodeData::String { .. }) => {
                self.get_as_string() == other.get_as_string()
            }
            (_, Value::Node(b)) if matches!(b.data(), NodeData::String { .. }) => {
                self.get_as_string() == other.get_as_string()
            }
            _ => self.get_as_float() == other.get_as_float(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.get_as_string())
    }
}

fn parse_leading_int(s: &str) -> i64 {
    let s = s.trim();
    let mut end = 0;
    let bytes = s.as_bytes();
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return 0;
    }
    s[..end].parse().unwrap_or(0)
}

/// Eager vs. optional-deref evaluation (spec.md §4.E, §9's "small return
/// bundle {value, needs_deref}"). `Borrowed` is used when the evaluator
/// can hand back a reference to an already-existing object (e.g. a
/// variable read) without a ref-bump/ref-drop round trip.
pub enum EvalResult<'a> {
    Owned(Value),
    Borrowed(&'a Value),
}

impl<'a> EvalResult<'a> {
    pub fn as_value(&self) -> &Value {
        match self {
            EvalResult::Owned(v) => v,
            EvalResult::Borrowed(v) => v,
        }
    }

    /// Converts to an owned value, ref-bumping only if this was borrowed.
    pub fn into_owned(self) -> Value {
        match self {
            EvalResult::Owned(v) => v,
            EvalResult::Borrowed(v) => v.clone(),
        }
    }

    pub fn needs_deref(&self) -> bool {
        matches!(self, EvalResult::Owned(_))
    }
}

/// Eager entry point: always returns an owning value that must be
/// released. Parse nodes dispatch to operator evaluation; every other
/// variant evaluates to a ref-bumped self, per spec.md §4.F.
pub fn eval(value: &Value, sink: &mut Sink) -> Value {
    if let Value::Node(n) = value {
        if let NodeData::ParseNode(pn) = n.data() {
            return crate::operators::eval_parse_node(pn, sink);
        }
    }
    value.clone()
}

/// Optional-deref entry point: borrows when the value is already a
/// realized (non-parse-node) value, avoiding a ref-bump/ref-drop pair.
pub fn eval_optional<'a>(value: &'a Value, sink: &mut Sink) -> EvalResult<'a> {
    if value.needs_eval() {
        EvalResult::Owned(eval(value, sink))
    } else {
        EvalResult::Borrowed(value)
    }
}
