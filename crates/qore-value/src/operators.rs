//! Binary/unary operator dispatch over `Value` (component H).
//!
//! Runtime dispatch promotes through the lattice `Bool < Int64 < Float <
//! Number < String` plus the container-specific rules spec.md §4.H lists
//! (`Date + Integer -> Date`, `List + x -> List`, `String + x -> String`,
//! `Hash + Hash -> Hash`, `Hash + Object -> Hash`, `Object + Hash -> Hash`,
//! `Binary + Binary -> Binary`). The `+` operator's exact type-priority
//! order below (List, String, Date, Number, Float, Int64, Hash/Object,
//! Binary) mirrors `original_source/lib/QorePlusOperatorNode.cpp`'s
//! `evalValueImpl` check order verbatim, since later rules would
//! otherwise silently shadow earlier ones (e.g. a `Date + Number`
//! expression must hit the Date rule because Date is checked first).

use crate::node::{CallRefData, Node, NodeData, ObjectData, ParseNodeData, QoreDate, Sink};
use crate::value::{eval, Value};
use qore_sink::{tags, ExceptionKind};

/// Evaluates a not-yet-reduced operator application. Only binary `+` is
/// implemented as a full worked example (spec.md §4.H); other operator
/// symbols fall back to a generic "not yet wired" marker rather than a
/// panic, since the parser that would produce richer `ParseNode` operator
/// tags is out of this core's scope.
pub fn eval_parse_node(node: &ParseNodeData, sink: &mut Sink) -> Value {
    match node.operator.as_str() {
        "+" if node.operands.len() == 2 => {
            let lhs = eval(&node.operands[0], sink);
            if sink.is_exception() {
                return Value::Bool(false);
            }
            let rhs = eval(&node.operands[1], sink);
            if sink.is_exception() {
                return Value::Bool(false);
            }
            plus(&lhs, &rhs, sink)
        }
        other => {
            sink.raise_simple(
                ExceptionKind::System,
                "OPERATOR-ERROR",
                Value::from_string(format!("unsupported parse-time operator {other:?}"), crate::encoding::Encoding::Utf8),
            );
            Value::Bool(false)
        }
    }
}

/// The `+` operator, worked through exactly as spec.md §4.H lists it.
pub fn plus(lhs: &Value, rhs: &Value, sink: &mut Sink) -> Value {
    let l_node = lhs.as_node().map(Node::data);
    let r_node = rhs.as_node().map(Node::data);

    // 1. Either side a List: result length is L.size + (R is List ?
    //    R.size : 1).
    if let Some(NodeData::List(l)) = l_node {
        let mut items = l.clone();
        match r_node {
            Some(NodeData::List(r)) => items.extend(r.iter().cloned()),
            _ => items.push(rhs.clone()),
        }
        return Value::from_list(items);
    }
    if let Some(NodeData::List(r)) = r_node {
        let mut items = Vec::with_capacity(r.len() + 1);
        items.push(lhs.clone());
        items.extend(r.iter().cloned());
        return Value::from_list(items);
    }

    // 2. Either side a String: result in the left's encoding (or the
    //    right's if the left is not a string); the non-string side is
    //    coerced via getAsString.
    if let Some(NodeData::String { bytes, encoding }) = l_node {
        let mut combined = String::from_utf8_lossy(bytes).into_owned();
        combined.push_str(&rhs.get_as_string());
        return Value::from_string(combined, *encoding);
    }
    if let Some(NodeData::String { encoding, .. }) = r_node {
        let mut combined = lhs.get_as_string();
        combined.push_str(&rhs.get_as_string());
        return Value::from_string(combined, *encoding);
    }

    // 3. Either side a Date: both reduced to Date and added; absolute +
    //    relative -> absolute, relative + relative -> relative.
    if matches!(l_node, Some(NodeData::Date(_))) || matches!(r_node, Some(NodeData::Date(_))) {
        let l_date = as_date(lhs);
        let r_date = as_date(rhs);
        return Value::Node(Node::new(NodeData::Date(l_date.add(&r_date))));
    }

    // 4. Either side a Number: both promoted and added with decimal
    //    semantics.
    if matches!(l_node, Some(NodeData::Number(_))) || matches!(r_node, Some(NodeData::Number(_))) {
        let l_num = as_number(lhs);
        let r_num = as_number(rhs);
        return Value::Node(Node::new(NodeData::Number(l_num + r_num)));
    }

    // 5. Either side a Float: lhs.getAsFloat() + rhs.getAsFloat().
    if matches!(lhs, Value::Float64(_))
        || matches!(rhs, Value::Float64(_))
        || matches!(l_node, Some(NodeData::Float(_)))
        || matches!(r_node, Some(NodeData::Float(_)))
    {
        return Value::Float64(lhs.get_as_float() + rhs.get_as_float());
    }

    // 6. Either side an Int64: wrapping two's-complement add, no overflow
    //    exception.
    if matches!(lhs, Value::Int64(_))
        || matches!(rhs, Value::Int64(_))
        || matches!(l_node, Some(NodeData::Integer(_)))
        || matches!(r_node, Some(NodeData::Integer(_)))
    {
        return Value::Int64(lhs.get_as_int64().wrapping_add(rhs.get_as_int64()));
    }

    // Hash/Object rules: right-wins merge.
    if let Some(NodeData::Hash(l)) = l_node {
        let mut merged = l.clone();
        match r_node {
            Some(NodeData::Hash(r)) => {
                for (k, v) in r {
                    merged.insert(k.clone(), v.clone());
                }
            }
            Some(NodeData::Object(obj)) => {
                for (k, v) in &obj.members {
                    merged.insert(k.clone(), v.clone());
                }
            }
            _ => {}
        }
        return Value::from_hash(merged);
    }
    if let Some(NodeData::Object(obj)) = l_node {
        if let Some(NodeData::Hash(r)) = r_node {
            let mut merged = obj.members.clone();
            for (k, v) in r {
                merged.insert(k.clone(), v.clone());
            }
            return Value::from_hash(merged);
        }
        return lhs.clone();
    }
    if matches!(r_node, Some(NodeData::Hash(_)) | Some(NodeData::Object(_))) {
        return rhs.clone();
    }

    // Binary + Binary -> Binary (concatenate).
    if let Some(NodeData::Binary(l)) = l_node {
        if let Some(NodeData::Binary(r)) = r_node {
            let mut combined = Vec::with_capacity(l.len() + r.len());
            combined.extend_from_slice(l);
            combined.extend_from_slice(r);
            return Value::from_binary(combined);
        }
        return lhs.clone();
    }
    if matches!(r_node, Some(NodeData::Binary(_))) {
        return rhs.clone();
    }

    // Otherwise: Nothing. There is no dedicated Nothing tag on Value
    // (see value.rs); callers of `plus` that need to distinguish this
    // fallthrough from a real zero should check operand types themselves.
    Value::Bool(false)
}

fn as_date(v: &Value) -> QoreDate {
    match v {
        Value::Node(n) => match n.data() {
            NodeData::Date(d) => d.clone(),
            _ => QoreDate::relative_millis(v.get_as_int64() * 1000),
        },
        _ => QoreDate::relative_millis(v.get_as_int64() * 1000),
    }
}

fn as_number(v: &Value) -> rust_decimal::Decimal {
    match v {
        Value::Node(n) => match n.data() {
            NodeData::Number(d) => *d,
            _ => rust_decimal::Decimal::try_from(v.get_as_float()).unwrap_or_default(),
        },
        _ => rust_decimal::Decimal::try_from(v.get_as_float()).unwrap_or_default(),
    }
}

/// Constructs a parse-time operator node. Folding ("if both operands are
/// pure literals, evaluate at parse time and replace the subtree", per
/// spec.md §4.H and §9) is the caller's responsibility: a parser builds a
/// `ParseNode`, checks both operands' `is_value()`, and if so calls
/// `eval_parse_node` immediately instead of deferring — this core does
/// not contain a parser, so it exposes the building block and the fold
/// check (`both_are_values`) rather than the fold decision itself.
pub fn both_are_values(lhs: &Value, rhs: &Value) -> bool {
    fn is_value(v: &Value) -> bool {
        match v {
            Value::Node(n) => n.is_value(),
            _ => true,
        }
    }
    is_value(lhs) && is_value(rhs)
}

pub fn new_call_reference(function_name: impl Into<String>, captured_env: Option<Value>) -> Value {
    Value::Node(Node::new(NodeData::CallReference(CallRefData {
        function_name: function_name.into(),
        captured_env,
    })))
}

pub fn new_object(class_name: impl Into<String>) -> Value {
    Value::Node(Node::new(NodeData::Object(ObjectData::new(class_name))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Encoding;
    use qore_sink::ExceptionSink;

    fn sink() -> Sink {
        ExceptionSink::new()
    }

    #[test]
    fn list_append_cow_scenario() {
        // spec.md §8 scenario 1.
        let l1 = Value::from_list(vec![
            Value::Int64(1),
            Value::from_string("a", Encoding::Utf8),
            Value::Float64(2.5),
        ]);
        let l2 = l1.clone();
        let mut s = sink();
        let result = plus(&l1, &Value::Bool(true), &mut s);
        assert!(!s.is_exception());

        let Value::Node(result_node) = &result else { panic!("expected list") };
        let NodeData::List(items) = result_node.data() else { panic!("expected list") };
        assert_eq!(items.len(), 4);

        let Value::Node(l2_node) = &l2 else { panic!("expected list") };
        let NodeData::List(l2_items) = l2_node.data() else { panic!("expected list") };
        assert_eq!(l2_items.len(), 3);
    }

    #[test]
    fn hash_plus_object_merge_scenario() {
        // spec.md §8 scenario 2.
        let mut h = indexmap::IndexMap::new();
        h.insert("a".to_string(), Value::Int64(1));
        h.insert("b".to_string(), Value::Int64(2));
        let h = Value::from_hash(h);

        let mut obj = ObjectData::new("Thing");
        obj.members.insert("b".to_string(), Value::Int64(3));
        obj.members.insert("c".to_string(), Value::Int64(4));
        let o = Value::Node(Node::new(NodeData::Object(obj)));

        let mut s = sink();
        let result = plus(&h, &o, &mut s);
        let Value::Node(n) = &result else { panic!("expected hash") };
        let NodeData::Hash(merged) = n.data() else { panic!("expected hash") };
        assert_eq!(merged.get("a").unwrap().get_as_int64(), 1);
        assert_eq!(merged.get("b").unwrap().get_as_int64(), 3);
        assert_eq!(merged.get("c").unwrap().get_as_int64(), 4);
    }

    #[test]
    fn string_plus_non_string_uses_left_encoding() {
        let left = Value::from_string("n=", Encoding::Ascii);
        let mut s = sink();
        let result = plus(&left, &Value::Int64(5), &mut s);
        assert_eq!(result.get_as_string(), "n=5");
        assert_eq!(result.string_encoding(), Some(Encoding::Ascii));
    }

    #[test]
    fn int_overflow_wraps_without_raising() {
        let mut s = sink();
        let result = plus(&Value::Int64(i64::MAX), &Value::Int64(1), &mut s);
        assert!(!s.is_exception());
        assert_eq!(result.get_as_int64(), i64::MIN);
    }

    #[test]
    fn date_plus_integer_adds_seconds_as_relative_duration() {
        let epoch = chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap();
        let date = Value::Node(Node::new(NodeData::Date(QoreDate::absolute(
            epoch,
            chrono_tz::UTC,
        ))));
        let mut s = sink();
        let result = plus(&date, &Value::Int64(60), &mut s);
        let Value::Node(n) = &result else { panic!("expected date") };
        let NodeData::Date(QoreDate::Absolute { instant, .. }) = n.data() else {
            panic!("expected absolute date")
        };
        assert_eq!(instant.timestamp(), 60);
    }

    #[test]
    fn relative_date_plus_relative_date_sums_durations() {
        let a = Value::Node(Node::new(NodeData::Date(QoreDate::relative_millis(1000))));
        let b = Value::Node(Node::new(NodeData::Date(QoreDate::relative_millis(2000))));
        let mut s = sink();
        let result = plus(&a, &b, &mut s);
        let Value::Node(n) = &result else { panic!("expected date") };
        let NodeData::Date(QoreDate::Relative { duration }) = n.data() else {
            panic!("expected relative date")
        };
        assert_eq!(duration.num_milliseconds(), 3000);
    }

    #[test]
    fn binary_plus_binary_concatenates() {
        let l = Value::from_binary(vec![1u8, 2]);
        let r = Value::from_binary(vec![3u8, 4]);
        let mut s = sink();
        let result = plus(&l, &r, &mut s);
        let Value::Node(n) = &result else { panic!("expected binary") };
        let NodeData::Binary(b) = n.data() else { panic!("expected binary") };
        assert_eq!(b.as_ref(), &[1, 2, 3, 4]);
    }
}
