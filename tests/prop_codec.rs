use proptest::prelude::*;
use std::cmp::Ordering;
use treestore::codec::{decode_key, encode_key, encode_partial_key, Cmp, Datum};

/// A pair of components sharing the same type, so two tuples built from a
/// vector of pairs always have identical shape.
fn datum_pair() -> impl Strategy<Value = (Datum, Datum)> {
    prop_oneof![
        (proptest::collection::vec(any::<u8>(), 0..24), proptest::collection::vec(any::<u8>(), 0..24))
            .prop_map(|(a, b)| (Datum::Bytes(a), Datum::Bytes(b))),
        (any::<i64>(), any::<i64>()).prop_map(|(a, b)| (Datum::I64(a), Datum::I64(b))),
        (any::<u64>(), any::<u64>()).prop_map(|(a, b)| (Datum::U64(a), Datum::U64(b))),
        (any::<i64>(), any::<i64>()).prop_map(|(a, b)| (Datum::Time(a), Datum::Time(b))),
    ]
}

fn datum_cmp(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Bytes(x), Datum::Bytes(y)) => x.cmp(y),
        (Datum::I64(x), Datum::I64(y)) => x.cmp(y),
        (Datum::U64(x), Datum::U64(y)) => x.cmp(y),
        (Datum::Time(x), Datum::Time(y)) => x.cmp(y),
        _ => panic!("tuples must share a shape"),
    }
}

fn tuple_cmp(a: &[Datum], b: &[Datum]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match datum_cmp(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

proptest! {
    /// decode(encode(vs)) == vs, element by element
    #[test]
    fn prop_key_roundtrip(
        prefix in any::<u32>(),
        pairs in proptest::collection::vec(datum_pair(), 0..6),
    ) {
        let data: Vec<Datum> = pairs.into_iter().map(|p| p.0).collect();
        let encoded = encode_key(prefix, &data);
        let (decoded_prefix, decoded) = decode_key(&encoded).unwrap();
        prop_assert_eq!(decoded_prefix, prefix);
        prop_assert_eq!(decoded, data);
    }

    /// Tuple order equals byte order of the encodings, for same-shape tuples
    #[test]
    fn prop_encoding_preserves_order(
        prefix in any::<u32>(),
        pairs in proptest::collection::vec(datum_pair(), 1..6),
    ) {
        let a: Vec<Datum> = pairs.iter().map(|p| p.0.clone()).collect();
        let b: Vec<Datum> = pairs.iter().map(|p| p.1.clone()).collect();
        let ea = encode_key(prefix, &a);
        let eb = encode_key(prefix, &b);
        prop_assert_eq!(tuple_cmp(&a, &b), ea.cmp(&eb));
    }

    /// A prefix tuple sorts before any of its extensions
    #[test]
    fn prop_prefix_sorts_first(
        prefix in any::<u32>(),
        pairs in proptest::collection::vec(datum_pair(), 1..6),
        cut in any::<prop::sample::Index>(),
    ) {
        let full: Vec<Datum> = pairs.into_iter().map(|p| p.0).collect();
        let cut = cut.index(full.len());
        let partial = &full[..cut];
        let ea = encode_key(prefix, partial);
        let eb = encode_key(prefix, &full);
        prop_assert!(ea <= eb);
    }

    /// The +infinity sentinel bounds every extension of the partial key
    #[test]
    fn prop_partial_key_brackets_extensions(
        prefix in any::<u32>(),
        pairs in proptest::collection::vec(datum_pair(), 1..5),
        extra in datum_pair(),
    ) {
        let base: Vec<Datum> = pairs.into_iter().map(|p| p.0).collect();
        let mut extended = base.clone();
        extended.push(extra.0);

        let lower = encode_partial_key(prefix, &base, Cmp::Ge);
        let upper = encode_partial_key(prefix, &base, Cmp::Le);
        let full = encode_key(prefix, &extended);

        prop_assert!(lower <= full);
        prop_assert!(full < upper);
    }
}
