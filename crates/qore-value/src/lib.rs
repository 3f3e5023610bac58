//! The tagged value model, reference-counted node types and operator
//! dispatch for the Qore runtime core (components E, F, G, H).

pub mod encoding;
pub mod error;
pub mod holder;
pub mod node;
pub mod operators;
pub mod value;

#[cfg(test)]
mod proptests;

pub use encoding::{Encoding, EncodingRegistry};
pub use error::ValueError;
pub use holder::{NodeHolder, ValueHolder};
pub use node::{CallRefData, Node, NodeData, ObjectData, ParseNodeData, QoreDate};
pub use operators::{both_are_values, new_call_reference, new_object, plus};
pub use value::{eval, eval_optional, EvalResult, Value};

/// Specialized over `Value`, since the generic `qore-sink` crate cannot
/// depend on this crate's concrete payload type.
pub type ExceptionSink = qore_sink::ExceptionSink<Value>;
pub type Exception = qore_sink::Exception<Value>;

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::from_string(s, Encoding::Utf8)
    }
}
