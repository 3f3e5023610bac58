//! Property tests for the round-trip and algebraic laws spec.md §8
//! expects of encoding conversion and the `+` operator's container rules.

use crate::encoding::Encoding;
use crate::node::{Node, NodeData};
use crate::operators::plus;
use crate::value::Value;
use proptest::prelude::*;
use qore_sink::ExceptionSink;

proptest! {
    /// Any ASCII-only string survives a utf-8 -> ascii -> utf-8 round trip
    /// unchanged, since every ASCII byte is representable in both.
    #[test]
    fn ascii_string_round_trips_through_ascii_encoding(s in "[\\x00-\\x7f]*") {
        let bytes = s.as_bytes();
        let as_ascii = Encoding::Utf8.convert(bytes, Encoding::Ascii).unwrap();
        let back = Encoding::Ascii.convert(&as_ascii, Encoding::Utf8).unwrap();
        prop_assert_eq!(back, bytes.to_vec());
    }

    /// `List + List -> List` always has length `lhs.len() + rhs.len()`
    /// (spec.md §4.H / §8 scenario 1's size law).
    #[test]
    fn list_plus_list_sums_lengths(a in prop::collection::vec(any::<i64>(), 0..8), b in prop::collection::vec(any::<i64>(), 0..8)) {
        let lhs = Value::from_list(a.iter().copied().map(Value::Int64).collect());
        let rhs = Value::from_list(b.iter().copied().map(Value::Int64).collect());
        let mut sink: ExceptionSink<Value> = ExceptionSink::new();
        let result = plus(&lhs, &rhs, &mut sink);
        let Value::Node(n) = &result else { panic!("expected list") };
        let NodeData::List(items) = n.data() else { panic!("expected list") };
        prop_assert_eq!(items.len(), a.len() + b.len());
    }

    /// `List + x -> List` (x not itself a List) always grows by exactly
    /// one element.
    #[test]
    fn list_plus_scalar_grows_by_one(a in prop::collection::vec(any::<i64>(), 0..8), x in any::<i64>()) {
        let lhs = Value::from_list(a.iter().copied().map(Value::Int64).collect());
        let mut sink: ExceptionSink<Value> = ExceptionSink::new();
        let result = plus(&lhs, &Value::Int64(x), &mut sink);
        let Value::Node(n) = &result else { panic!("expected list") };
        let NodeData::List(items) = n.data() else { panic!("expected list") };
        prop_assert_eq!(items.len(), a.len() + 1);
    }

    /// `Hash + Hash -> Hash` merges with right-side precedence; the
    /// result's key set is always the union of both operands' key sets
    /// (spec.md §8 scenario 2's key-union law).
    #[test]
    fn hash_plus_hash_key_set_is_union(
        l_keys in prop::collection::hash_set("[a-c]", 0..3),
        r_keys in prop::collection::hash_set("[a-c]", 0..3),
    ) {
        let mut l = indexmap::IndexMap::new();
        for k in &l_keys {
            l.insert(k.clone(), Value::Int64(1));
        }
        let mut r = indexmap::IndexMap::new();
        for k in &r_keys {
            r.insert(k.clone(), Value::Int64(2));
        }
        let lhs = Value::from_hash(l);
        let rhs = Value::from_hash(r);
        let mut sink: ExceptionSink<Value> = ExceptionSink::new();
        let result = plus(&lhs, &rhs, &mut sink);
        let Value::Node(n) = &result else { panic!("expected hash") };
        let NodeData::Hash(merged) = n.data() else { panic!("expected hash") };
        let expected: std::collections::HashSet<_> = l_keys.union(&r_keys).cloned().collect();
        let actual: std::collections::HashSet<_> = merged.keys().cloned().collect();
        prop_assert_eq!(actual, expected);
        for k in &r_keys {
            prop_assert_eq!(merged.get(k).unwrap().get_as_int64(), 2);
        }
    }

    /// `is_equal_hard` is always at least as strict as `is_equal_soft`:
    /// whenever two values are hard-equal they are also soft-equal.
    #[test]
    fn hard_equal_implies_soft_equal(a in any::<i64>(), b in any::<i64>()) {
        let va = Value::Int64(a);
        let vb = Value::Int64(b);
        if va.is_equal_hard(&vb) {
            prop_assert!(va.is_equal_soft(&vb));
        }
    }

    /// Binary concatenation length is always additive, and the prefix
    /// matches the left operand exactly.
    #[test]
    fn binary_plus_binary_concatenates_without_loss(a in prop::collection::vec(any::<u8>(), 0..16), b in prop::collection::vec(any::<u8>(), 0..16)) {
        let lhs = Value::Node(Node::new(NodeData::Binary(bytes::Bytes::from(a.clone()))));
        let rhs = Value::Node(Node::new(NodeData::Binary(bytes::Bytes::from(b.clone()))));
        let mut sink: ExceptionSink<Value> = ExceptionSink::new();
        let result = plus(&lhs, &rhs, &mut sink);
        let Value::Node(n) = &result else { panic!("expected binary") };
        let NodeData::Binary(combined) = n.data() else { panic!("expected binary") };
        prop_assert_eq!(combined.len(), a.len() + b.len());
        prop_assert_eq!(&combined[..a.len()], a.as_slice());
    }
}
