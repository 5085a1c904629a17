//! MySQL 바이너리 JSON 디코딩
//!
//! JSON 컬럼은 binlog에 서버 내부 바이너리 포맷으로 기록된다.
//! 오브젝트/배열의 오프셋은 해당 컨테이너 데이터의 시작 기준이다.

use crate::error::{CdcError, Result};
use crate::events::hex_string;
use crate::reader::PayloadReader;
use crate::value::{decode_decimal, format_date_packed, format_datetime_packed, format_time_packed};
use serde_json::{Map, Number, Value};

const SMALL_OBJECT: u8 = 0x00;
const LARGE_OBJECT: u8 = 0x01;
const SMALL_ARRAY: u8 = 0x02;
const LARGE_ARRAY: u8 = 0x03;
const LITERAL: u8 = 0x04;
const INT16: u8 = 0x05;
const UINT16: u8 = 0x06;
const INT32: u8 = 0x07;
const UINT32: u8 = 0x08;
const INT64: u8 = 0x09;
const UINT64: u8 = 0x0a;
const DOUBLE: u8 = 0x0b;
const STRING: u8 = 0x0c;
const OPAQUE: u8 = 0x0f;

const LITERAL_NULL: u8 = 0x00;
const LITERAL_TRUE: u8 = 0x01;
const LITERAL_FALSE: u8 = 0x02;

// opaque 값의 원래 컬럼 타입
const OPAQUE_TIMESTAMP: u8 = 7;
const OPAQUE_DATE: u8 = 10;
const OPAQUE_TIME: u8 = 11;
const OPAQUE_DATETIME: u8 = 12;
const OPAQUE_NEWDECIMAL: u8 = 246;

fn malformed(what: impl Into<String>) -> CdcError {
    CdcError::MalformedFrame(format!("binary json: {}", what.into()))
}

/// JSON 컬럼 값 → serde_json::Value
pub fn decode_json(data: &[u8]) -> Result<Value> {
    match data.split_first() {
        None => Ok(Value::Null),
        Some((&value_type, body)) => parse_value(value_type, body),
    }
}

fn parse_value(value_type: u8, data: &[u8]) -> Result<Value> {
    let mut reader = PayloadReader::new(data);
    let value = match value_type {
        SMALL_OBJECT => parse_container(data, false, true)?,
        LARGE_OBJECT => parse_container(data, true, true)?,
        SMALL_ARRAY => parse_container(data, false, false)?,
        LARGE_ARRAY => parse_container(data, true, false)?,
        LITERAL => parse_literal(reader.u8()?)?,
        INT16 => Value::from(reader.i16_le()?),
        UINT16 => Value::from(reader.u16_le()?),
        INT32 => Value::from(reader.i32_le()?),
        UINT32 => Value::from(reader.u32_le()?),
        INT64 => Value::from(reader.i64_le()?),
        UINT64 => Value::from(reader.u64_le()?),
        DOUBLE => Number::from_f64(reader.f64_le()?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        STRING => {
            let len = read_variable_length(&mut reader)?;
            Value::String(String::from_utf8_lossy(reader.bytes(len)?).into_owned())
        }
        OPAQUE => parse_opaque(&mut reader)?,
        other => return Err(malformed(format!("unknown value type 0x{:02x}", other))),
    };
    Ok(value)
}

fn parse_literal(literal: u8) -> Result<Value> {
    match literal {
        LITERAL_NULL => Ok(Value::Null),
        LITERAL_TRUE => Ok(Value::Bool(true)),
        LITERAL_FALSE => Ok(Value::Bool(false)),
        other => Err(malformed(format!("unknown literal 0x{:02x}", other))),
    }
}

/// 값 엔트리에 직접 저장되는 타입
fn is_inlined(value_type: u8, large: bool) -> bool {
    match value_type {
        LITERAL | INT16 | UINT16 => true,
        INT32 | UINT32 => large,
        _ => false,
    }
}

fn parse_inlined(value_type: u8, entry: u64) -> Result<Value> {
    Ok(match value_type {
        LITERAL => parse_literal(entry as u8)?,
        INT16 => Value::from(entry as u16 as i16),
        UINT16 => Value::from(entry as u16),
        INT32 => Value::from(entry as u32 as i32),
        UINT32 => Value::from(entry as u32),
        other => return Err(malformed(format!("type 0x{:02x} cannot be inlined", other))),
    })
}

fn parse_container(data: &[u8], large: bool, object: bool) -> Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    let mut header = PayloadReader::new(data);
    let count = header.uint_le(offset_size)? as usize;
    let size = header.uint_le(offset_size)? as usize;
    if size > data.len() {
        return Err(malformed(format!(
            "container size {} exceeds {} available bytes",
            size,
            data.len()
        )));
    }

    let mut keys = Vec::new();
    if object {
        for _ in 0..count {
            let key_offset = header.uint_le(offset_size)? as usize;
            let key_len = header.u16_le()? as usize;
            let key = data
                .get(key_offset..key_offset + key_len)
                .ok_or_else(|| malformed("key out of bounds"))?;
            keys.push(String::from_utf8_lossy(key).into_owned());
        }
    }

    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let value_type = header.u8()?;
        let entry = header.uint_le(offset_size)?;
        let value = if is_inlined(value_type, large) {
            parse_inlined(value_type, entry)?
        } else {
            let offset = entry as usize;
            let body = data
                .get(offset..)
                .filter(|body| !body.is_empty())
                .ok_or_else(|| malformed("value offset out of bounds"))?;
            parse_value(value_type, body)?
        };
        values.push(value);
    }

    if object {
        let map: Map<String, Value> = keys.into_iter().zip(values).collect();
        Ok(Value::Object(map))
    } else {
        Ok(Value::Array(values))
    }
}

/// 7비트씩 이어지는 가변 길이 정수 (최대 5바이트)
fn read_variable_length(reader: &mut PayloadReader<'_>) -> Result<usize> {
    let mut len = 0usize;
    for i in 0..5 {
        let byte = reader.u8()?;
        len |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(len);
        }
    }
    Err(malformed("variable length integer too long"))
}

fn parse_opaque(reader: &mut PayloadReader<'_>) -> Result<Value> {
    let field_type = reader.u8()?;
    let len = read_variable_length(reader)?;
    let data = reader.bytes(len)?;
    let mut body = PayloadReader::new(data);

    let value = match field_type {
        OPAQUE_NEWDECIMAL if data.len() >= 2 => {
            let precision = body.u8()?;
            let scale = body.u8()?;
            Value::String(decode_decimal(&mut body, precision, scale)?)
        }
        OPAQUE_DATE if data.len() >= 8 => Value::String(format_date_packed(body.i64_le()?)?),
        OPAQUE_TIME if data.len() >= 8 => {
            let packed = body.i64_le()?;
            let fsp = if packed % (1 << 24) == 0 { 0 } else { 6 };
            Value::String(format_time_packed(packed, fsp)?)
        }
        OPAQUE_DATETIME | OPAQUE_TIMESTAMP if data.len() >= 8 => {
            Value::String(format_datetime_packed(body.i64_le()?)?)
        }
        _ => Value::String(hex_string(data)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars() {
        assert_eq!(decode_json(&[]).unwrap(), Value::Null);
        assert_eq!(decode_json(&[LITERAL, LITERAL_TRUE]).unwrap(), json!(true));
        assert_eq!(decode_json(&[INT16, 0xfe, 0xff]).unwrap(), json!(-2));
        assert_eq!(decode_json(&[STRING, 3, b'a', b'b', b'c']).unwrap(), json!("abc"));
    }

    #[test]
    fn test_small_object() {
        // {"a": 1, "bc": "x"}
        // 헤더 4 + 키 엔트리 8 + 값 엔트리 6 = 18 바이트 뒤에 키와 문자열
        let mut doc = Vec::new();
        doc.extend_from_slice(&2u16.to_le_bytes());
        doc.extend_from_slice(&23u16.to_le_bytes());
        doc.extend_from_slice(&18u16.to_le_bytes()); // "a" offset
        doc.extend_from_slice(&1u16.to_le_bytes());
        doc.extend_from_slice(&19u16.to_le_bytes()); // "bc" offset
        doc.extend_from_slice(&2u16.to_le_bytes());
        doc.push(INT16);
        doc.extend_from_slice(&1u16.to_le_bytes());
        doc.push(STRING);
        doc.extend_from_slice(&21u16.to_le_bytes());
        doc.extend_from_slice(b"abc");
        doc.extend_from_slice(&[1, b'x']);
        assert_eq!(doc.len(), 23);

        let mut data = vec![SMALL_OBJECT];
        data.extend_from_slice(&doc);

        assert_eq!(decode_json(&data).unwrap(), json!({"a": 1, "bc": "x"}));
    }

    #[test]
    fn test_small_array_with_literals() {
        // [null, false, 7]
        let mut data = vec![SMALL_ARRAY];
        data.extend_from_slice(&3u16.to_le_bytes());
        data.extend_from_slice(&13u16.to_le_bytes());
        data.extend_from_slice(&[LITERAL, LITERAL_NULL, 0]);
        data.extend_from_slice(&[LITERAL, LITERAL_FALSE, 0]);
        data.extend_from_slice(&[UINT16, 7, 0]);
        assert_eq!(decode_json(&data).unwrap(), json!([null, false, 7]));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let err = decode_json(&[0x42]).unwrap_err();
        assert!(matches!(err, CdcError::MalformedFrame(_)));
    }

    #[test]
    fn test_opaque_datetime_out_of_range_is_malformed() {
        let mut data = vec![OPAQUE, OPAQUE_DATETIME, 8];
        data.extend_from_slice(&i64::MIN.to_le_bytes());
        let err = decode_json(&data).unwrap_err();
        assert!(matches!(err, CdcError::MalformedFrame(_)));
    }

    #[test]
    fn test_variable_length() {
        let data = [0x80 | 0x05, 0x01];
        let mut reader = PayloadReader::new(&data);
        assert_eq!(read_variable_length(&mut reader).unwrap(), 5 + (1 << 7));
    }
}
