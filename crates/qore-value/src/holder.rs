//! Scoped owners (component G) that release a `Value`/`Node` on every
//! exit path — the normal return, an early `return`, and a panic unwind
//! all run the same `Drop` — wired to the sink that the eventual destructor
//! call (which may itself raise, per spec.md §9's "may-throw in
//! destructor" design note) appends to.

use crate::node::{Node, Sink};
use crate::value::Value;

/// Holds a `Value` and releases it (via `Node::deref` if it is a `Node`)
/// when dropped, unless released early.
pub struct ValueHolder<'a> {
    value: Option<Value>,
    sink: &'a mut Sink,
}

impl<'a> ValueHolder<'a> {
    pub fn new(value: Value, sink: &'a mut Sink) -> Self {
        Self {
            value: Some(value),
            sink,
        }
    }

    pub fn as_value(&self) -> &Value {
        self.value.as_ref().expect("ValueHolder used after release")
    }

    /// Hands ownership back to the caller without releasing, nulling out
    /// this holder's state so its `Drop` becomes a no-op.
    pub fn release(mut self) -> Value {
        self.value.take().expect("ValueHolder used after release")
    }
}

impl Drop for ValueHolder<'_> {
    fn drop(&mut self) {
        if let Some(Value::Node(n)) = self.value.take() {
            n.deref(self.sink);
        }
    }
}

/// As [`ValueHolder`] but over a bare `Node` handle, for call sites that
/// already unwrapped the `Value` tag (e.g. a constructor that always
/// returns a heap node).
pub struct NodeHolder<'a> {
    node: Option<Node>,
    sink: &'a mut Sink,
}

impl<'a> NodeHolder<'a> {
    pub fn new(node: Node, sink: &'a mut Sink) -> Self {
        Self {
            node: Some(node),
            sink,
        }
    }

    pub fn as_node(&self) -> &Node {
        self.node.as_ref().expect("NodeHolder used after release")
    }

    pub fn release(mut self) -> Node {
        self.node.take().expect("NodeHolder used after release")
    }
}

impl Drop for NodeHolder<'_> {
    fn drop(&mut self) {
        if let Some(n) = self.node.take() {
            n.deref(self.sink);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeData;
    use qore_sink::ExceptionSink;

    #[test]
    fn holder_releases_on_scope_exit() {
        let mut sink: Sink = ExceptionSink::new();
        {
            let _holder = ValueHolder::new(Value::Int64(3), &mut sink);
        }
        assert!(!sink.is_exception());
    }

    #[test]
    fn released_holder_does_not_double_release() {
        let mut sink: Sink = ExceptionSink::new();
        let node = Node::new(NodeData::Integer(1));
        let value = Value::Node(node.clone());
        let holder = ValueHolder::new(value, &mut sink);
        let released = holder.release();
        // Holder's Drop already ran as a no-op (state nulled); the caller
        // now owns the single remaining reference.
        assert!(matches!(released, Value::Node(_)));
        drop(released);
    }

    #[test]
    fn node_holder_runs_object_destructor_on_drop() {
        use crate::node::ObjectData;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let mut obj = ObjectData::new("Thing");
        obj.destructor = Some(Arc::new(move |_, _| ran2.store(true, Ordering::SeqCst)));
        let node = Node::new(NodeData::Object(obj));

        let mut sink: Sink = ExceptionSink::new();
        {
            let _holder = NodeHolder::new(node, &mut sink);
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
