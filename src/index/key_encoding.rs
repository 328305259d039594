//! Order-preserving key encoding: byte-wise comparison of encoded keys
//! matches the SQL ordering of the original values.
//!
//! Transforms:
//!   INT     big-endian i32 with the sign bit flipped (4 bytes)
//!   FLOAT   IEEE 754 big-endian; negative values flip all bits, others
//!           flip only the sign bit (8 bytes). -0 normalizes to +0,
//!           NaN is rejected.
//!   STRING  UTF-8 with 0x00 escaped as 0x00 0x01, terminated 0x00 0x00
//!   BOOLEAN 0x00 / 0x01
//!   DATE    days since 1970-01-01, encoded like INT
//!
//! NULL is never encoded; NULLs are simply not indexed.

use crate::common::value::{date_from_days, days_since_epoch};
use crate::common::{DataType, MiniDbError, MiniDbResult, Value};

pub fn encode_key(value: &Value, dtype: DataType) -> MiniDbResult<Vec<u8>> {
    match (value, dtype) {
        (Value::Null, _) => Err(MiniDbError::Execution(
            "NULL values cannot be indexed".to_string(),
        )),
        (Value::Int(v), DataType::Int) => Ok(encode_i32(*v)),
        (Value::Float(f), DataType::Float) => {
            if f.is_nan() {
                return Err(MiniDbError::Execution(
                    "NaN values cannot be indexed".to_string(),
                ));
            }
            // -0.0 and +0.0 must encode identically.
            let f = if *f == 0.0 { 0.0 } else { *f };
            Ok(encode_f64(f))
        }
        (Value::Str(s), DataType::String) => Ok(encode_str(s)),
        (Value::Bool(b), DataType::Boolean) => Ok(vec![if *b { 0x01 } else { 0x00 }]),
        (Value::Date(d), DataType::Date) => Ok(encode_i32(days_since_epoch(*d))),
        // Index lookups may come from SQL literals that need coercion
        // (e.g. an INT literal probing a FLOAT index).
        (v, t) => {
            let coerced = v.coerce_to(t)?;
            if coerced.data_type() == v.data_type() {
                return Err(MiniDbError::Execution(format!(
                    "Cannot encode {:?} as {} key",
                    v, t
                )));
            }
            encode_key(&coerced, t)
        }
    }
}

fn encode_i32(v: i32) -> Vec<u8> {
    let mut raw = v.to_be_bytes();
    raw[0] ^= 0x80;
    raw.to_vec()
}

fn encode_f64(v: f64) -> Vec<u8> {
    let mut raw = v.to_be_bytes();
    if raw[0] & 0x80 != 0 {
        for b in raw.iter_mut() {
            *b ^= 0xFF;
        }
    } else {
        raw[0] ^= 0x80;
    }
    raw.to_vec()
}

fn encode_str(s: &str) -> Vec<u8> {
    let utf8 = s.as_bytes();
    let mut out = Vec::with_capacity(utf8.len() + 2);
    for &b in utf8 {
        if b == 0x00 {
            out.push(0x00);
            out.push(0x01);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
    out
}

/// Decode an encoded key back to a value (used when a range scan yields
/// its keys).
pub fn decode_key(data: &[u8], dtype: DataType) -> MiniDbResult<Value> {
    match dtype {
        DataType::Int => Ok(Value::Int(decode_i32(data)?)),
        DataType::Float => {
            if data.len() < 8 {
                return Err(MiniDbError::Storage("Float key truncated".to_string()));
            }
            let mut raw: [u8; 8] = data[0..8].try_into().unwrap();
            if raw[0] & 0x80 != 0 {
                raw[0] ^= 0x80;
            } else {
                for b in raw.iter_mut() {
                    *b ^= 0xFF;
                }
            }
            Ok(Value::Float(f64::from_be_bytes(raw)))
        }
        DataType::String => {
            let mut out = Vec::new();
            let mut i = 0;
            while i < data.len() {
                let b = data[i];
                if b == 0x00 {
                    let next = *data.get(i + 1).ok_or_else(|| {
                        MiniDbError::Storage("String key missing terminator".to_string())
                    })?;
                    match next {
                        0x00 => break,
                        0x01 => {
                            out.push(0x00);
                            i += 2;
                        }
                        other => {
                            return Err(MiniDbError::Storage(format!(
                                "Invalid escape 0x00 0x{:02X} in string key",
                                other
                            )));
                        }
                    }
                } else {
                    out.push(b);
                    i += 1;
                }
            }
            let s = String::from_utf8(out)
                .map_err(|_| MiniDbError::Storage("Invalid UTF-8 in string key".to_string()))?;
            Ok(Value::Str(s))
        }
        DataType::Boolean => {
            if data.is_empty() {
                return Err(MiniDbError::Storage("Boolean key truncated".to_string()));
            }
            Ok(Value::Bool(data[0] != 0))
        }
        DataType::Date => Ok(Value::Date(date_from_days(decode_i32(data)?))),
    }
}

fn decode_i32(data: &[u8]) -> MiniDbResult<i32> {
    if data.len() < 4 {
        return Err(MiniDbError::Storage("Int key truncated".to_string()));
    }
    let mut raw: [u8; 4] = data[0..4].try_into().unwrap();
    raw[0] ^= 0x80;
    Ok(i32::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::cmp::Ordering;

    fn assert_order_law(values: &[Value], dtype: DataType) {
        // a < b  <=>  encode(a) <lex encode(b)
        for a in values {
            for b in values {
                let ka = encode_key(a, dtype).unwrap();
                let kb = encode_key(b, dtype).unwrap();
                assert_eq!(
                    a.compare(b).unwrap(),
                    ka.cmp(&kb),
                    "order law violated for {:?} vs {:?}",
                    a,
                    b
                );
            }
        }
        // decode(encode(v)) == v
        for v in values {
            let k = encode_key(v, dtype).unwrap();
            assert_eq!(&decode_key(&k, dtype).unwrap(), v);
        }
    }

    #[test]
    fn test_int_order() {
        let vals: Vec<Value> = [i32::MIN, -100, -1, 0, 1, 7, 100, i32::MAX]
            .iter()
            .map(|&v| Value::Int(v))
            .collect();
        assert_order_law(&vals, DataType::Int);
    }

    #[test]
    fn test_float_order() {
        let vals: Vec<Value> = [
            f64::NEG_INFINITY,
            -1.0e18,
            -2.5,
            -0.001,
            0.0,
            0.001,
            1.5,
            3.0e17,
            f64::INFINITY,
        ]
        .iter()
        .map(|&v| Value::Float(v))
        .collect();
        assert_order_law(&vals, DataType::Float);
    }

    #[test]
    fn test_float_negative_zero_and_nan() {
        let pos = encode_key(&Value::Float(0.0), DataType::Float).unwrap();
        let neg = encode_key(&Value::Float(-0.0), DataType::Float).unwrap();
        assert_eq!(pos, neg);
        assert!(encode_key(&Value::Float(f64::NAN), DataType::Float).is_err());
    }

    #[test]
    fn test_string_order_and_escaping() {
        let vals: Vec<Value> = ["", "a", "a\u{0}b", "ab", "b", "ba", "日本"]
            .iter()
            .map(|s| Value::Str(s.to_string()))
            .collect();
        assert_order_law(&vals, DataType::String);

        // The embedded NUL is escaped, never a terminator.
        let k = encode_key(&Value::Str("a\u{0}b".into()), DataType::String).unwrap();
        assert_eq!(k, vec![b'a', 0x00, 0x01, b'b', 0x00, 0x00]);
    }

    #[test]
    fn test_bool_and_date_order() {
        assert_order_law(&[Value::Bool(false), Value::Bool(true)], DataType::Boolean);

        let vals: Vec<Value> = ["1969-07-20", "1970-01-01", "2000-02-29", "2024-06-15"]
            .iter()
            .map(|s| Value::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()))
            .collect();
        assert_order_law(&vals, DataType::Date);
    }

    #[test]
    fn test_null_rejected() {
        assert!(encode_key(&Value::Null, DataType::Int).is_err());
    }

    #[test]
    fn test_int_literal_probes_float_index() {
        let k1 = encode_key(&Value::Int(2), DataType::Float).unwrap();
        let k2 = encode_key(&Value::Float(2.0), DataType::Float).unwrap();
        assert_eq!(k1, k2);
    }
}
