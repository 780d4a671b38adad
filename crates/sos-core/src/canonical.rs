//! Deterministic CBOR for signed structures.
//!
//! Peer infos, circles and retirement tickets are signed over these bytes,
//! so two devices must produce identical encodings for identical values.
//! The subset follows RFC 8949 core deterministic encoding: shortest
//! argument form, definite lengths, map keys ordered by their encoded bytes.
//! Floats and tags never appear in signed data and are refused.

use ciborium::value::{Integer, Value};

use crate::error::CoreError;

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;

const FALSE: u8 = 0xf4;
const TRUE: u8 = 0xf5;
const NULL: u8 = 0xf6;

/// Encode `value` deterministically.
pub fn encode_canonical(value: &Value) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::new();
    write_value(&mut out, value)?;
    Ok(out)
}

/// A map keyed by small integers, the shape every signed structure uses.
pub fn int_map(entries: Vec<(u64, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Integer(k.into()), v))
            .collect(),
    )
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), CoreError> {
    match value {
        Value::Integer(n) => write_integer(out, *n),
        Value::Bytes(b) => {
            write_head(out, MAJOR_BYTES, b.len() as u64);
            out.extend_from_slice(b);
        }
        Value::Text(s) => {
            write_head(out, MAJOR_TEXT, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            write_head(out, MAJOR_ARRAY, items.len() as u64);
            for item in items {
                write_value(out, item)?;
            }
        }
        Value::Map(entries) => write_map(out, entries)?,
        Value::Bool(b) => out.push(if *b { TRUE } else { FALSE }),
        Value::Null => out.push(NULL),
        Value::Float(_) => return Err(CoreError::EncodingError("float in signed data".into())),
        other => {
            return Err(CoreError::EncodingError(format!(
                "unsupported value in signed data: {other:?}"
            )))
        }
    }
    Ok(())
}

fn write_integer(out: &mut Vec<u8>, n: Integer) {
    let n = i128::from(n);
    if n < 0 {
        write_head(out, MAJOR_NEGATIVE, (-1 - n) as u64);
    } else {
        write_head(out, MAJOR_UNSIGNED, n as u64);
    }
}

/// Initial byte plus the shortest argument that holds `arg`.
fn write_head(out: &mut Vec<u8>, major: u8, arg: u64) {
    let major = major << 5;
    match arg {
        0..=23 => out.push(major | arg as u8),
        24..=0xff => out.extend_from_slice(&[major | 24, arg as u8]),
        0x100..=0xffff => {
            out.push(major | 25);
            out.extend_from_slice(&(arg as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(major | 26);
            out.extend_from_slice(&(arg as u32).to_be_bytes());
        }
        _ => {
            out.push(major | 27);
            out.extend_from_slice(&arg.to_be_bytes());
        }
    }
}

fn write_map(out: &mut Vec<u8>, entries: &[(Value, Value)]) -> Result<(), CoreError> {
    let mut encoded = entries
        .iter()
        .map(|(k, v)| encode_canonical(k).map(|key| (key, v)))
        .collect::<Result<Vec<(Vec<u8>, &Value)>, CoreError>>()?;
    encoded.sort_by(|a, b| a.0.cmp(&b.0));
    if encoded.windows(2).any(|w| w[0].0 == w[1].0) {
        return Err(CoreError::EncodingError("duplicate map key".into()));
    }

    write_head(out, MAJOR_MAP, encoded.len() as u64);
    for (key, value) in encoded {
        out.extend_from_slice(&key);
        write_value(out, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(major: u8, arg: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_head(&mut out, major, arg);
        out
    }

    #[test]
    fn test_shortest_heads() {
        assert_eq!(head(MAJOR_UNSIGNED, 23), [0x17]);
        assert_eq!(head(MAJOR_UNSIGNED, 24), [0x18, 24]);
        assert_eq!(head(MAJOR_UNSIGNED, 0x1234), [0x19, 0x12, 0x34]);
        assert_eq!(head(MAJOR_BYTES, 0x1_0000), [0x5a, 0, 1, 0, 0]);
        assert_eq!(head(MAJOR_MAP, u64::MAX)[0], 0xbb);
    }

    #[test]
    fn test_signed_integers() {
        assert_eq!(encode_canonical(&Value::Integer((-1).into())).unwrap(), [0x20]);
        assert_eq!(encode_canonical(&Value::Integer((-25).into())).unwrap(), [0x38, 24]);
    }

    #[test]
    fn test_map_keys_sorted_by_encoding() {
        let circle = int_map(vec![
            (10, Value::Text("keychain".into())),
            (2, Value::Bool(true)),
            (0, Value::Null),
        ]);
        let bytes = encode_canonical(&circle).unwrap();
        assert_eq!(&bytes[..5], &[0xa3, 0x00, NULL, 0x02, TRUE]);
        assert_eq!(bytes[5], 0x0a);
        assert_eq!(&bytes[6..7], &[0x68]);
    }

    #[test]
    fn test_entry_order_is_irrelevant() {
        let forward = int_map(vec![(0, Value::Bytes(vec![7; 3])), (1, Value::Array(vec![]))]);
        let reverse = int_map(vec![(1, Value::Array(vec![])), (0, Value::Bytes(vec![7; 3]))]);
        assert_eq!(encode_canonical(&forward).unwrap(), encode_canonical(&reverse).unwrap());
    }

    #[test]
    fn test_refuses_unsigned_shapes() {
        assert!(encode_canonical(&Value::Float(0.5)).is_err());
        assert!(encode_canonical(&Value::Tag(1, Box::new(Value::Null))).is_err());
        let dup = int_map(vec![(3, Value::Null), (3, Value::Null)]);
        assert!(encode_canonical(&dup).is_err());
    }
}
