//! Order-preserving composite key encoding
//!
//! Higher layers build keys and values as tuples of typed components; the
//! encoding guarantees that byte-wise lexicographic order of an encoded key
//! equals tuple order, so ordered range scans over the raw byte API behave
//! like typed range queries.
//!
//! Each component carries a 1-byte type tag. Signed integers are biased by
//! `2^63` and written big-endian so negatives sort first; unsigned integers
//! are written big-endian directly; timestamps are their Unix-seconds `i64`.
//! Byte strings use a terminated zero-escape: a payload `0x00` encodes as
//! `0x00 0xFF` and the component ends with a bare `0x00`. Any following
//! component starts with a tag in `1..=4`, so the terminator compares below
//! every continuation byte and ordering is preserved for all inputs.
//!
//! A composite key is a big-endian `u32` prefix (the keyspace of the owning
//! store) followed by the encoded components. Partial keys for range
//! comparisons append a single `0xFF` byte for the `>` and `<=` operators,
//! standing in for plus infinity over the missing trailing columns.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Type tag for byte strings
pub const TAG_BYTES: u8 = 1;
/// Type tag for signed 64-bit integers
pub const TAG_I64: u8 = 2;
/// Type tag for unsigned 64-bit integers
pub const TAG_U64: u8 = 3;
/// Type tag for timestamps (Unix seconds)
pub const TAG_TIME: u8 = 4;

const SIGN_BIAS: u64 = 1 << 63;
const INFINITY: u8 = 0xFF;

/// One typed component of a composite key or value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datum {
    /// Arbitrary bytes
    Bytes(Vec<u8>),
    /// Signed integer
    I64(i64),
    /// Unsigned integer
    U64(u64),
    /// Timestamp as Unix seconds
    Time(i64),
}

/// Comparison operator for partial range keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    /// Greater than or equal
    Ge,
    /// Strictly greater than
    Gt,
    /// Strictly less than
    Lt,
    /// Less than or equal
    Le,
}

fn encode_datum(out: &mut Vec<u8>, datum: &Datum) {
    match datum {
        Datum::Bytes(bytes) => {
            out.push(TAG_BYTES);
            for &b in bytes {
                if b == 0x00 {
                    out.push(0x00);
                    out.push(0xFF);
                } else {
                    out.push(b);
                }
            }
            out.push(0x00);
        }
        Datum::I64(v) => {
            out.push(TAG_I64);
            let mut buf = [0u8; 8];
            BigEndian::write_u64(&mut buf, (*v as u64).wrapping_add(SIGN_BIAS));
            out.extend_from_slice(&buf);
        }
        Datum::U64(v) => {
            out.push(TAG_U64);
            let mut buf = [0u8; 8];
            BigEndian::write_u64(&mut buf, *v);
            out.extend_from_slice(&buf);
        }
        Datum::Time(secs) => {
            out.push(TAG_TIME);
            let mut buf = [0u8; 8];
            BigEndian::write_u64(&mut buf, (*secs as u64).wrapping_add(SIGN_BIAS));
            out.extend_from_slice(&buf);
        }
    }
}

/// Decode one component, returning it with the number of bytes consumed
fn decode_datum(input: &[u8]) -> Result<(Datum, usize)> {
    let (&tag, rest) = input
        .split_first()
        .ok_or(Error::Decoding("empty input for component"))?;
    match tag {
        TAG_BYTES => {
            let mut bytes = Vec::new();
            let mut pos = 0;
            loop {
                match rest.get(pos) {
                    None => return Err(Error::Decoding("unterminated byte string")),
                    Some(0x00) => {
                        if rest.get(pos + 1) == Some(&0xFF) {
                            bytes.push(0x00);
                            pos += 2;
                        } else {
                            pos += 1;
                            break;
                        }
                    }
                    Some(&b) => {
                        bytes.push(b);
                        pos += 1;
                    }
                }
            }
            Ok((Datum::Bytes(bytes), 1 + pos))
        }
        TAG_I64 | TAG_TIME => {
            if rest.len() < 8 {
                return Err(Error::Decoding("truncated integer component"));
            }
            let v = BigEndian::read_u64(&rest[..8]).wrapping_sub(SIGN_BIAS) as i64;
            let datum = if tag == TAG_I64 { Datum::I64(v) } else { Datum::Time(v) };
            Ok((datum, 9))
        }
        TAG_U64 => {
            if rest.len() < 8 {
                return Err(Error::Decoding("truncated integer component"));
            }
            Ok((Datum::U64(BigEndian::read_u64(&rest[..8])), 9))
        }
        _ => Err(Error::Decoding("unknown component type tag")),
    }
}

/// Encode a complete composite key: `prefix` then every component
pub fn encode_key(prefix: u32, data: &[Datum]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len() * 9);
    let mut pfx = [0u8; 4];
    BigEndian::write_u32(&mut pfx, prefix);
    out.extend_from_slice(&pfx);
    for datum in data {
        encode_datum(&mut out, datum);
    }
    out
}

/// Encode a partial composite key for a range comparison.
///
/// `>` and `<=` append the plus-infinity sentinel so that every key sharing
/// the given components sorts below the bound; `>=` and `<` rely on the
/// empty suffix as minus infinity.
pub fn encode_partial_key(prefix: u32, data: &[Datum], cmp: Cmp) -> Vec<u8> {
    let mut out = encode_key(prefix, data);
    if matches!(cmp, Cmp::Gt | Cmp::Le) {
        out.push(INFINITY);
    }
    out
}

/// Decode a complete composite key back into its prefix and components
pub fn decode_key(input: &[u8]) -> Result<(u32, Vec<Datum>)> {
    if input.len() < 4 {
        return Err(Error::Decoding("key shorter than its prefix"));
    }
    let prefix = BigEndian::read_u32(&input[..4]);
    let mut data = Vec::new();
    let mut pos = 4;
    while pos < input.len() {
        let (datum, used) = decode_datum(&input[pos..])?;
        data.push(datum);
        pos += used;
    }
    Ok((prefix, data))
}

/// Encode a tagged value tuple (no prefix)
pub fn encode_values(data: &[Datum]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 9);
    for datum in data {
        encode_datum(&mut out, datum);
    }
    out
}

/// Decode a tagged value tuple (no prefix)
pub fn decode_values(input: &[u8]) -> Result<Vec<Datum>> {
    let mut data = Vec::new();
    let mut pos = 0;
    while pos < input.len() {
        let (datum, used) = decode_datum(&input[pos..])?;
        data.push(datum);
        pos += used;
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_types() {
        let data = vec![
            Datum::Bytes(b"hello\x00world\xFF".to_vec()),
            Datum::I64(-42),
            Datum::I64(i64::MIN),
            Datum::U64(u64::MAX),
            Datum::Time(1_700_000_000),
        ];
        let encoded = encode_key(9, &data);
        let (prefix, decoded) = decode_key(&encoded).unwrap();
        assert_eq!(prefix, 9);
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_roundtrip_values() {
        let data = vec![Datum::Bytes(vec![]), Datum::U64(0)];
        assert_eq!(decode_values(&encode_values(&data)).unwrap(), data);
    }

    #[test]
    fn test_i64_order_spans_zero() {
        let order = [i64::MIN, -1, 0, 1, i64::MAX];
        let encoded: Vec<Vec<u8>> =
            order.iter().map(|&v| encode_values(&[Datum::I64(v)])).collect();
        for w in encoded.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn test_bytes_escape_preserves_order() {
        // The cases that break the naive escape scheme.
        let inputs: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00],
            vec![0x00, 0x00],
            vec![0x00, 0x01],
            vec![0x01],
            vec![0xFE],
            vec![0xFE, 0x00],
            vec![0xFF],
            vec![0xFF, 0xFF],
        ];
        let encoded: Vec<Vec<u8>> = inputs
            .iter()
            .map(|b| encode_values(&[Datum::Bytes(b.clone())]))
            .collect();
        for w in encoded.windows(2) {
            assert!(w[0] < w[1], "order broken: {:?} !< {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn test_partial_key_bounds() {
        let base = encode_partial_key(1, &[Datum::U64(5)], Cmp::Ge);
        let upper = encode_partial_key(1, &[Datum::U64(5)], Cmp::Le);
        // Any key extending the components sits between the two bounds.
        let full = encode_key(1, &[Datum::U64(5), Datum::Bytes(b"x".to_vec())]);
        assert!(base < full);
        assert!(full < upper);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_key(&[0, 0]).is_err());
        assert!(decode_values(&[0x99]).is_err());
        assert!(decode_values(&[TAG_I64, 1, 2]).is_err());
        assert!(decode_values(&[TAG_BYTES, b'a']).is_err());
    }
}
