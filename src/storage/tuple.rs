//! Schema-aware row codec.
//!
//! Tuple layout (big-endian):
//!   [tuple_len: u16] [null_bitmap: ceil(ncols/8) bytes] [flags: u16]
//!   [column data in schema order, NULL columns omitted]
//!
//! Column encodings: INT i32, FLOAT f64 (IEEE 754), BOOLEAN one byte,
//! DATE i32 days since 1970-01-01, STRING u16 length prefix + UTF-8.

use crate::catalog::Schema;
use crate::common::value::{date_from_days, days_since_epoch};
use crate::common::{DataType, MiniDbError, MiniDbResult, Value};
use crate::config::MAX_STRING_SIZE;

fn null_bitmap_size(num_columns: usize) -> usize {
    num_columns.div_ceil(8)
}

pub fn serialize_row(row: &[Value], schema: &Schema) -> MiniDbResult<Vec<u8>> {
    let ncols = schema.column_count();
    if row.len() != ncols {
        return Err(MiniDbError::Schema(format!(
            "Expected {} values, got {}",
            ncols,
            row.len()
        )));
    }

    let bmp_size = null_bitmap_size(ncols);
    let mut null_bitmap = vec![0u8; bmp_size];
    let mut col_data: Vec<u8> = Vec::new();

    for (i, (col, val)) in schema.columns.iter().zip(row.iter()).enumerate() {
        if val.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
            continue;
        }
        serialize_value(val, col.data_type, &mut col_data)?;
    }

    let header_size = 2 + bmp_size + 2;
    let total_len = header_size + col_data.len();
    if total_len > u16::MAX as usize {
        return Err(MiniDbError::Schema(format!(
            "Serialized row too large: {} bytes",
            total_len
        )));
    }

    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(total_len as u16).to_be_bytes());
    out.extend_from_slice(&null_bitmap);
    out.extend_from_slice(&0u16.to_be_bytes()); // flags, reserved
    out.extend_from_slice(&col_data);
    Ok(out)
}

fn serialize_value(val: &Value, dtype: DataType, out: &mut Vec<u8>) -> MiniDbResult<()> {
    match (val, dtype) {
        (Value::Int(v), DataType::Int) => out.extend_from_slice(&v.to_be_bytes()),
        (Value::Float(v), DataType::Float) => out.extend_from_slice(&v.to_be_bytes()),
        (Value::Bool(b), DataType::Boolean) => out.push(if *b { 0x01 } else { 0x00 }),
        (Value::Date(d), DataType::Date) => {
            out.extend_from_slice(&days_since_epoch(*d).to_be_bytes())
        }
        (Value::Str(s), DataType::String) => {
            let encoded = s.as_bytes();
            if encoded.len() > MAX_STRING_SIZE {
                return Err(MiniDbError::Schema(format!(
                    "String too long: {} bytes (max {})",
                    encoded.len(),
                    MAX_STRING_SIZE
                )));
            }
            out.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
            out.extend_from_slice(encoded);
        }
        (v, t) => {
            return Err(MiniDbError::Schema(format!(
                "Value {:?} does not match column type {}",
                v, t
            )));
        }
    }
    Ok(())
}

pub fn deserialize_row(data: &[u8], schema: &Schema) -> MiniDbResult<Vec<Value>> {
    let ncols = schema.column_count();
    let bmp_size = null_bitmap_size(ncols);
    let header_size = 2 + bmp_size + 2;
    if data.len() < header_size {
        return Err(MiniDbError::Storage(format!(
            "Tuple too short: {} bytes",
            data.len()
        )));
    }

    let tuple_len = u16::from_be_bytes(data[0..2].try_into().unwrap()) as usize;
    if tuple_len > data.len() {
        return Err(MiniDbError::Storage(format!(
            "Tuple length {} exceeds available {} bytes",
            tuple_len,
            data.len()
        )));
    }
    let null_bitmap = &data[2..2 + bmp_size];
    let mut offset = header_size;

    let mut values = Vec::with_capacity(ncols);
    for (i, col) in schema.columns.iter().enumerate() {
        let is_null = (null_bitmap[i / 8] >> (i % 8)) & 1 == 1;
        if is_null {
            values.push(Value::Null);
            continue;
        }
        let (val, next) = deserialize_value(data, offset, col.data_type)?;
        values.push(val);
        offset = next;
    }
    Ok(values)
}

fn deserialize_value(data: &[u8], offset: usize, dtype: DataType) -> MiniDbResult<(Value, usize)> {
    let need = |n: usize| -> MiniDbResult<()> {
        if offset + n > data.len() {
            Err(MiniDbError::Storage("Tuple data truncated".to_string()))
        } else {
            Ok(())
        }
    };
    match dtype {
        DataType::Int => {
            need(4)?;
            let v = i32::from_be_bytes(data[offset..offset + 4].try_into().unwrap());
            Ok((Value::Int(v), offset + 4))
        }
        DataType::Float => {
            need(8)?;
            let v = f64::from_be_bytes(data[offset..offset + 8].try_into().unwrap());
            Ok((Value::Float(v), offset + 8))
        }
        DataType::Boolean => {
            need(1)?;
            Ok((Value::Bool(data[offset] != 0), offset + 1))
        }
        DataType::Date => {
            need(4)?;
            let days = i32::from_be_bytes(data[offset..offset + 4].try_into().unwrap());
            Ok((Value::Date(date_from_days(days)), offset + 4))
        }
        DataType::String => {
            need(2)?;
            let len = u16::from_be_bytes(data[offset..offset + 2].try_into().unwrap()) as usize;
            let start = offset + 2;
            if start + len > data.len() {
                return Err(MiniDbError::Storage("Tuple string truncated".to_string()));
            }
            let s = std::str::from_utf8(&data[start..start + len])
                .map_err(|_| MiniDbError::Storage("Invalid UTF-8 in tuple string".to_string()))?;
            Ok((Value::Str(s.to_string()), start + len))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Column;
    use chrono::NaiveDate;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", DataType::Int, false),
            Column::new("name", DataType::String, true),
            Column::new("score", DataType::Float, true),
            Column::new("active", DataType::Boolean, true),
            Column::new("joined", DataType::Date, true),
        ])
    }

    #[test]
    fn test_roundtrip_full_row() {
        let s = schema();
        let row = vec![
            Value::Int(-42),
            Value::Str("héllo".to_string()),
            Value::Float(3.5),
            Value::Bool(true),
            Value::Date(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()),
        ];
        let bytes = serialize_row(&row, &s).unwrap();
        assert_eq!(deserialize_row(&bytes, &s).unwrap(), row);
    }

    #[test]
    fn test_roundtrip_with_nulls() {
        let s = schema();
        let row = vec![
            Value::Int(1),
            Value::Null,
            Value::Null,
            Value::Bool(false),
            Value::Null,
        ];
        let bytes = serialize_row(&row, &s).unwrap();
        assert_eq!(deserialize_row(&bytes, &s).unwrap(), row);
        // NULL columns take no data bytes: header + 4 (int) + 1 (bool)
        assert_eq!(bytes.len(), 2 + 1 + 2 + 5);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let s = schema();
        let row = vec![
            Value::Str("oops".to_string()),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
        ];
        assert!(serialize_row(&row, &s).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let s = schema();
        let row = vec![Value::Int(7), Value::Str("abc".into()), Value::Null, Value::Null, Value::Null];
        let bytes = serialize_row(&row, &s).unwrap();
        assert!(deserialize_row(&bytes[..bytes.len() - 2], &s).is_err());
    }
}
