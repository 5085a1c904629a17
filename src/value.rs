//! 컬럼 값 디코딩
//!
//! 행 이미지 안의 컬럼 하나를 테이블 맵 메타데이터에 따라 읽는다.
//! 정수는 리틀엔디언, 시간 타입의 v2 인코딩과 DECIMAL/BIT는 빅엔디언이다.

use crate::error::{CdcError, Result};
use crate::events::CellValue;
use crate::json;
use crate::reader::PayloadReader;
use crate::table_map::{ColumnDescriptor, ColumnMeta, ColumnType, TableDescriptor};
use chrono::DateTime;

const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];
const DIGITS_PER_INTEGER: usize = 9;
const MAX_MICROS: u32 = 999_999;

/// 컬럼 하나의 값 디코딩 (NULL 비트가 꺼진 컬럼에만 호출)
pub fn decode_value(
    reader: &mut PayloadReader<'_>,
    table: &TableDescriptor,
    column: &ColumnDescriptor,
) -> Result<CellValue> {
    let value = match column.column_type {
        ColumnType::Tiny => {
            if column.unsigned {
                CellValue::UInt(reader.u8()? as u64)
            } else {
                CellValue::Int(reader.i8()? as i64)
            }
        }
        ColumnType::Short => {
            if column.unsigned {
                CellValue::UInt(reader.u16_le()? as u64)
            } else {
                CellValue::Int(reader.i16_le()? as i64)
            }
        }
        ColumnType::Int24 => {
            if column.unsigned {
                CellValue::UInt(reader.u24_le()? as u64)
            } else {
                CellValue::Int(reader.i24_le()? as i64)
            }
        }
        ColumnType::Long => {
            if column.unsigned {
                CellValue::UInt(reader.u32_le()? as u64)
            } else {
                CellValue::Int(reader.i32_le()? as i64)
            }
        }
        ColumnType::LongLong => {
            if column.unsigned {
                CellValue::UInt(reader.u64_le()?)
            } else {
                CellValue::Int(reader.i64_le()?)
            }
        }
        ColumnType::Float => CellValue::Float(reader.f32_le()?),
        ColumnType::Double => CellValue::Double(reader.f64_le()?),
        ColumnType::Null => CellValue::Null,
        ColumnType::Year => {
            let year = reader.u8()? as u16;
            CellValue::Year(if year == 0 { 0 } else { 1900 + year })
        }
        ColumnType::Date | ColumnType::NewDate => {
            let packed = reader.u24_le()?;
            CellValue::Date(format!(
                "{:04}-{:02}-{:02}",
                packed >> 9,
                (packed >> 5) & 0x0f,
                packed & 0x1f
            ))
        }
        ColumnType::Time => {
            let packed = reader.i24_le()?;
            let sign = if packed < 0 { "-" } else { "" };
            let packed = packed.unsigned_abs();
            CellValue::Time(format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                packed / 10000,
                (packed / 100) % 100,
                packed % 100
            ))
        }
        ColumnType::DateTime => {
            let packed = reader.u64_le()?;
            let date = packed / 1_000_000;
            let time = packed % 1_000_000;
            CellValue::DateTime(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                date / 10000,
                (date / 100) % 100,
                date % 100,
                time / 10000,
                (time / 100) % 100,
                time % 100
            ))
        }
        ColumnType::Timestamp => timestamp(reader.u32_le()? as i64, 0)?,
        ColumnType::Timestamp2 => {
            let seconds = reader.uint_be(4)? as i64;
            let micros = read_fraction(reader, fsp(column))?;
            timestamp(seconds, micros)?
        }
        ColumnType::DateTime2 => {
            let fsp = fsp(column);
            let packed = reader.uint_be(5)? as i64 - 0x80_0000_0000;
            let micros = read_fraction(reader, fsp)?;
            CellValue::DateTime(format_datetime(packed, micros, fsp))
        }
        ColumnType::Time2 => {
            let fsp = fsp(column);
            let packed = read_time2_packed(reader, fsp)?;
            CellValue::Time(format_time_packed(packed, fsp)?)
        }
        ColumnType::Varchar | ColumnType::VarString | ColumnType::String => {
            let max_length = match column.meta {
                ColumnMeta::MaxLength(len) => len,
                _ => 0,
            };
            let len = if max_length < 256 {
                reader.u8()? as usize
            } else {
                reader.u16_le()? as usize
            };
            text_or_bytes(reader.bytes(len)?)
        }
        ColumnType::Enum => {
            let index = reader.uint_le(pack_length(column))? as usize;
            let label = match index {
                0 => String::new(),
                n => column
                    .values
                    .get(n - 1)
                    .cloned()
                    .unwrap_or_else(|| n.to_string()),
            };
            CellValue::Enum(label)
        }
        ColumnType::Set => {
            let bits = reader.uint_le(pack_length(column))?;
            let members = (0..64usize)
                .filter(|bit| bits & (1u64 << bit) != 0)
                .map(|bit| {
                    column
                        .values
                        .get(bit)
                        .cloned()
                        .unwrap_or_else(|| (bit + 1).to_string())
                })
                .collect();
            CellValue::Set(members)
        }
        ColumnType::Bit => {
            let bits = match column.meta {
                ColumnMeta::Bits(bits) => bits as usize,
                _ => 0,
            };
            CellValue::Bit(reader.uint_be(bits.div_ceil(8).min(8))?)
        }
        ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Blob => text_or_bytes(length_prefixed(reader, column)?),
        ColumnType::Geometry => CellValue::Bytes(length_prefixed(reader, column)?.to_vec()),
        ColumnType::Json => {
            let data = length_prefixed(reader, column)?;
            CellValue::Json(json::decode_json(data)?)
        }
        ColumnType::NewDecimal => {
            let (precision, scale) = match column.meta {
                ColumnMeta::Decimal { precision, scale } => (precision, scale),
                _ => (0, 0),
            };
            CellValue::Decimal(decode_decimal(reader, precision, scale)?)
        }
        ColumnType::Decimal | ColumnType::TypedArray => {
            return Err(CdcError::UnsupportedType {
                schema: table.schema.clone(),
                table: table.table.clone(),
                column: column.ordinal,
                type_code: column.type_code,
            })
        }
    };
    Ok(value)
}

fn fsp(column: &ColumnDescriptor) -> u8 {
    match column.meta {
        ColumnMeta::Fsp(fsp) => fsp.min(6),
        _ => 0,
    }
}

fn pack_length(column: &ColumnDescriptor) -> usize {
    match column.meta {
        ColumnMeta::PackLength(len) => (len as usize).clamp(1, 8),
        _ => 1,
    }
}

fn length_prefixed<'a>(reader: &mut PayloadReader<'a>, column: &ColumnDescriptor) -> Result<&'a [u8]> {
    let prefix = match column.meta {
        ColumnMeta::LengthBytes(n) => n as usize,
        _ => 0,
    };
    if !(1..=4).contains(&prefix) {
        return Err(CdcError::MalformedFrame(format!(
            "invalid length prefix size {} for column #{}",
            prefix, column.ordinal
        )));
    }
    let len = reader.uint_le(prefix)? as usize;
    reader.bytes(len)
}

/// UTF-8이면 문자열, 아니면 바이너리
fn text_or_bytes(data: &[u8]) -> CellValue {
    match std::str::from_utf8(data) {
        Ok(text) => CellValue::String(text.to_string()),
        Err(_) => CellValue::Bytes(data.to_vec()),
    }
}

fn timestamp(seconds: i64, micros: u32) -> Result<CellValue> {
    let nanos = micros
        .checked_mul(1000)
        .ok_or_else(|| CdcError::MalformedFrame(format!("fraction out of range: {}", micros)))?;
    DateTime::from_timestamp(seconds, nanos)
        .map(CellValue::Timestamp)
        .ok_or_else(|| CdcError::MalformedFrame(format!("timestamp out of range: {}", seconds)))
}

/// v2 시간 타입의 소수부 (마이크로초 단위로 환산)
fn read_fraction(reader: &mut PayloadReader<'_>, fsp: u8) -> Result<u32> {
    let micros = match fsp {
        1 | 2 => reader.uint_be(1)? as u32 * 10_000,
        3 | 4 => reader.uint_be(2)? as u32 * 100,
        5 | 6 => reader.uint_be(3)? as u32,
        _ => 0,
    };
    if micros > MAX_MICROS {
        return Err(CdcError::MalformedFrame(format!(
            "fractional seconds out of range: {}",
            micros
        )));
    }
    Ok(micros)
}

/// packed longlong 절댓값 (i64::MIN은 손상된 값)
fn packed_magnitude(packed: i64) -> Result<i64> {
    packed.checked_abs().ok_or_else(|| {
        CdcError::MalformedFrame(format!("packed temporal value out of range: {}", packed))
    })
}

fn fraction_suffix(micros: u64, fsp: u8) -> String {
    if fsp == 0 {
        return String::new();
    }
    let digits = format!("{:06}", micros);
    format!(".{}", &digits[..fsp as usize])
}

/// DATETIME2 정수부 (소수부 제외 40비트 중 39비트) 포맷
fn format_datetime(int_part: i64, micros: u32, fsp: u8) -> String {
    let ymd = int_part >> 17;
    let ym = ymd >> 5;
    let hms = int_part % (1 << 17);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
        ym / 13,
        ym % 13,
        ymd % (1 << 5),
        hms >> 12,
        (hms >> 6) % (1 << 6),
        hms % (1 << 6),
        fraction_suffix(micros as u64, fsp)
    )
}

/// packed longlong 형식 DATETIME (JSON opaque 값)
pub(crate) fn format_datetime_packed(packed: i64) -> Result<String> {
    let packed = packed_magnitude(packed)?;
    let micros = (packed % (1 << 24)) as u32;
    let fsp = if micros == 0 { 0 } else { 6 };
    Ok(format_datetime(packed >> 24, micros, fsp))
}

/// packed longlong 형식 DATE (JSON opaque 값)
pub(crate) fn format_date_packed(packed: i64) -> Result<String> {
    let ymd = (packed_magnitude(packed)? >> 24) >> 17;
    let ym = ymd >> 5;
    Ok(format!("{:04}-{:02}-{:02}", ym / 13, ym % 13, ymd % (1 << 5)))
}

/// TIME2 바이트를 packed longlong 형식으로 읽기
fn read_time2_packed(reader: &mut PayloadReader<'_>, fsp: u8) -> Result<i64> {
    Ok(match fsp {
        1 | 2 => {
            let mut int_part = reader.uint_be(3)? as i64 - 0x80_0000;
            let mut frac = reader.i8()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = reader.uint_be(3)? as i64 - 0x80_0000;
            let mut frac = reader.uint_be(2)? as i16 as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        5 | 6 => reader.uint_be(6)? as i64 - 0x8000_0000_0000,
        _ => (reader.uint_be(3)? as i64 - 0x80_0000) << 24,
    })
}

pub(crate) fn format_time_packed(packed: i64, fsp: u8) -> Result<String> {
    let sign = if packed < 0 { "-" } else { "" };
    let packed = packed_magnitude(packed)?;
    let hms = packed >> 24;
    let micros = packed % (1 << 24);
    Ok(format!(
        "{}{:02}:{:02}:{:02}{}",
        sign,
        (hms >> 12) % (1 << 10),
        (hms >> 6) % (1 << 6),
        hms % (1 << 6),
        fraction_suffix(micros as u64, fsp)
    ))
}

/// NEWDECIMAL 바이너리 디코딩
///
/// 정수부와 소수부를 9자리씩 4바이트에 담고, 남는 자릿수는 DIG2BYTES 만큼의 바이트에 담는다.
/// 첫 바이트 최상위 비트가 부호이며 음수는 전체 비트가 반전되어 있다.
pub fn decode_decimal(reader: &mut PayloadReader<'_>, precision: u8, scale: u8) -> Result<String> {
    let precision = precision as usize;
    let scale = scale as usize;
    if scale > precision {
        return Err(CdcError::MalformedFrame(format!(
            "decimal scale {} exceeds precision {}",
            scale, precision
        )));
    }
    let integral = precision - scale;
    let (full_int, rest_int) = (integral / DIGITS_PER_INTEGER, integral % DIGITS_PER_INTEGER);
    let (full_frac, rest_frac) = (scale / DIGITS_PER_INTEGER, scale % DIGITS_PER_INTEGER);
    let size = full_int * 4 + DIG2BYTES[rest_int] + full_frac * 4 + DIG2BYTES[rest_frac];
    if size == 0 {
        return Ok("0".to_string());
    }

    let mut buf = reader.bytes(size)?.to_vec();
    let negative = buf[0] & 0x80 == 0;
    buf[0] ^= 0x80;
    if negative {
        for byte in buf.iter_mut() {
            *byte ^= 0xff;
        }
    }

    let mut digits = PayloadReader::new(&buf);
    let mut int_text = String::new();
    if rest_int > 0 {
        int_text.push_str(&digits.uint_be(DIG2BYTES[rest_int])?.to_string());
    }
    for _ in 0..full_int {
        int_text.push_str(&format!("{:09}", digits.uint_be(4)?));
    }
    let int_text = int_text.trim_start_matches('0');

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(if int_text.is_empty() { "0" } else { int_text });

    if scale > 0 {
        out.push('.');
        for _ in 0..full_frac {
            out.push_str(&format!("{:09}", digits.uint_be(4)?));
        }
        if rest_frac > 0 {
            let value = digits.uint_be(DIG2BYTES[rest_frac])?;
            out.push_str(&format!("{:0width$}", value, width = rest_frac));
        }
    }
    Ok(out)
}
