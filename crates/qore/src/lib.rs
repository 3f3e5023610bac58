//! Embedding API surface for the Qore runtime core (spec.md §6): the
//! constructor/refcount/eval entry points a host binds its FFI layer to,
//! plus the parse-option bitset those entry points and the parser consult.
//!
//! This crate does no work of its own beyond thin wrapping: the tagged
//! value model lives in `qore-value`, locking and thread context in
//! `qore-sync`, resource pooling in `qore-resource`, and the worker pool
//! in `qore-threadpool`. What lives here is the shape a host embeds
//! against, grounded on how `neo-vm`'s `lib.rs` re-exports its engine's
//! public surface as one flat, documented API rather than scattering it
//! across the crates that implement it.

pub mod options;

pub use qore_resource::{
    ManagedResource, PoolAction, PoolCommand, RawResource, ResourceError, ResourcePool,
};
pub use qore_sync::{
    AcquireResult, DeadlockGraph, DeadlockInfo, LockId, LockKind, QoreCondvar, QoreMutex, RwLock,
    RwPolicy, Tid, ThreadContext, WaitResult,
};
pub use qore_threadpool::{ThreadPool, ThreadPoolConfig, ThreadPoolConfigError};
pub use qore_value::{
    both_are_values, new_call_reference, new_object, plus, CallRefData, Encoding, EncodingRegistry,
    Exception, ExceptionSink, Node, NodeData, NodeHolder, ObjectData, ParseNodeData, QoreDate,
    Value, ValueHolder,
};
pub use options::ParseOptions;

use qore_sink::{ExceptionKind, SourceLocation};
use qore_sync::ResourceHandle;

/// Allocation-free `bool` constructor (spec.md §6).
pub fn create_value_bool(b: bool) -> Value {
    Value::from_bool(b)
}

/// Allocation-free `int64` constructor.
pub fn create_value_int(i: i64) -> Value {
    Value::from_int(i)
}

/// Allocation-free `double` constructor.
pub fn create_value_float(f: f64) -> Value {
    Value::from_float(f)
}

/// Builds a reference-owned string node from raw `bytes`, tagged with
/// `encoding`. `length` is accepted for parity with the C-ABI shape
/// callers bind against (a host handing over a raw buffer knows its
/// length before it knows whether `bytes` is even UTF-8-valid) and is
/// asserted against the slice it is paired with.
pub fn create_string(bytes: &[u8], length: usize, encoding: Encoding) -> Value {
    debug_assert_eq!(bytes.len(), length);
    let text = match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Ascii | Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
    };
    Value::from_string(text, encoding)
}

/// Builds a reference-owned binary node from raw `bytes`.
pub fn create_binary(bytes: &[u8], length: usize) -> Value {
    debug_assert_eq!(bytes.len(), length);
    Value::from_binary(bytes.to_vec())
}

/// Builds an empty reference-owned list node.
pub fn create_list() -> Value {
    Value::from_list(Vec::new())
}

/// Builds an empty reference-owned hash node.
pub fn create_hash() -> Value {
    Value::from_hash(indexmap::IndexMap::new())
}

/// Manual ref-bump, for embedding layers that hold a `Value` across an
/// FFI boundary with its own lifetime rules instead of Rust's borrow
/// checker.
pub fn value_ref(v: &Value) -> Value {
    v.clone()
}

/// Manual ref-drop, releasing `v`'s heap node (if any) through `sink`.
pub fn value_deref(v: Value, sink: &mut ExceptionSink) {
    if let Value::Node(n) = v {
        n.deref(sink);
    }
}

/// Evaluates a parsed expression against the calling thread's current
/// [`ThreadContext`], per spec.md §4.F/§9. Parse-node evaluation is the
/// only variant that does real work; every other tag evaluates to a
/// ref-bumped copy of itself.
pub fn eval(expr: &Value, sink: &mut ExceptionSink) -> Value {
    qore_value::eval(expr, sink)
}

/// Registers a cleanup callable the current thread runs (LIFO, alongside
/// any open `ManagedResource` transactions) on thread exit, under the
/// caller-minted `handle`.
pub fn register_thread_resource(
    handle: ResourceHandle,
    cleanup: impl FnOnce(&mut dyn qore_sink::RaiseSink) + Send + 'static,
) {
    ThreadContext::register_thread_resource(handle, cleanup);
}

/// Cancels a thread-resource registration made with
/// [`register_thread_resource`] before it would otherwise run.
pub fn remove_thread_resource(handle: ResourceHandle) {
    ThreadContext::remove_thread_resource(handle);
}

/// Raises a Qore-language exception onto `sink`, the single path every
/// boundary error (locking, pooling, evaluation, user `throw`) funnels
/// through.
pub fn exception_raise(
    sink: &mut ExceptionSink,
    kind: ExceptionKind,
    tag: &str,
    description: Value,
    arg: Option<Value>,
) {
    sink.raise(kind, tag, description, arg, SourceLocation::unknown());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_constructors_round_trip() {
        assert!(create_value_bool(true).get_as_bool());
        assert_eq!(create_value_int(42).get_as_int64(), 42);
        assert_eq!(create_value_float(1.5).get_as_float(), 1.5);
    }

    #[test]
    fn string_and_binary_constructors_preserve_bytes() {
        let s = create_string(b"hello", 5, Encoding::Utf8);
        assert_eq!(s.get_as_string(), "hello");
        let b = create_binary(&[1, 2, 3], 3);
        assert!(matches!(b, Value::Node(_)));
    }

    #[test]
    fn value_ref_bumps_and_deref_releases() {
        let mut sink = ExceptionSink::new();
        let v = create_string(b"x", 1, Encoding::Utf8);
        let v2 = value_ref(&v);
        value_deref(v, &mut sink);
        value_deref(v2, &mut sink);
        assert!(!sink.is_exception());
    }

    #[test]
    fn exception_raise_appends_to_sink() {
        let mut sink = ExceptionSink::new();
        exception_raise(
            &mut sink,
            ExceptionKind::User,
            "TEST-ERROR",
            Value::from_string("boom", Encoding::Utf8),
            None,
        );
        assert!(sink.is_exception());
    }

    #[test]
    fn thread_resource_registration_runs_on_removal_is_noop() {
        // remove_thread_resource before exit cancels the cleanup; this
        // just checks the call doesn't panic when nothing has run yet.
        let handle = ResourceHandle(1);
        register_thread_resource(handle, |_sink| {});
        remove_thread_resource(handle);
    }
}
