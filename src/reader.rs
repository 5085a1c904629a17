//! binlog 페이로드용 바이트 리더
//!
//! `Cursor` + byteorder 위에서 동작하며, 읽기 실패를 모두 `MalformedFrame`으로 변환한다.
//! (I/O 에러로 변환하면 연결 끊김으로 오인되기 때문)

use crate::error::{CdcError, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

pub struct PayloadReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

fn truncated(what: &str) -> CdcError {
    CdcError::MalformedFrame(format!("truncated payload while reading {}", what))
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PayloadReader {
            cursor: Cursor::new(data),
        }
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(truncated("skipped bytes"));
        }
        self.cursor.set_position((self.position() + n) as u64);
        Ok(())
    }

    /// 남은 바이트를 복사 없이 반환하고 커서를 끝으로 옮긴다
    pub fn rest(&mut self) -> &'a [u8] {
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = self.position().min(data.len());
        self.cursor.set_position(data.len() as u64);
        &data[start..]
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(truncated("byte string"));
        }
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = self.position();
        self.cursor.set_position((start + n) as u64);
        Ok(&data[start..start + n])
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.cursor.read_u8().map_err(|_| truncated("u8"))
    }

    pub fn i8(&mut self) -> Result<i8> {
        self.cursor.read_i8().map_err(|_| truncated("i8"))
    }

    pub fn u16_le(&mut self) -> Result<u16> {
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| truncated("u16"))
    }

    pub fn i16_le(&mut self) -> Result<i16> {
        self.cursor
            .read_i16::<LittleEndian>()
            .map_err(|_| truncated("i16"))
    }

    pub fn u24_le(&mut self) -> Result<u32> {
        self.cursor
            .read_u24::<LittleEndian>()
            .map_err(|_| truncated("u24"))
    }

    pub fn i24_le(&mut self) -> Result<i32> {
        self.cursor
            .read_i24::<LittleEndian>()
            .map_err(|_| truncated("i24"))
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated("u32"))
    }

    pub fn i32_le(&mut self) -> Result<i32> {
        self.cursor
            .read_i32::<LittleEndian>()
            .map_err(|_| truncated("i32"))
    }

    pub fn u64_le(&mut self) -> Result<u64> {
        self.cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| truncated("u64"))
    }

    pub fn i64_le(&mut self) -> Result<i64> {
        self.cursor
            .read_i64::<LittleEndian>()
            .map_err(|_| truncated("i64"))
    }

    pub fn f32_le(&mut self) -> Result<f32> {
        self.cursor
            .read_f32::<LittleEndian>()
            .map_err(|_| truncated("f32"))
    }

    pub fn f64_le(&mut self) -> Result<f64> {
        self.cursor
            .read_f64::<LittleEndian>()
            .map_err(|_| truncated("f64"))
    }

    /// 빅엔디언 부호 없는 정수 (1~8 바이트)
    pub fn uint_be(&mut self, len: usize) -> Result<u64> {
        if len == 0 {
            return Ok(0);
        }
        self.cursor
            .read_uint::<BigEndian>(len)
            .map_err(|_| truncated("big-endian uint"))
    }

    /// 리틀엔디언 부호 없는 정수 (1~8 바이트)
    pub fn uint_le(&mut self, len: usize) -> Result<u64> {
        if len == 0 {
            return Ok(0);
        }
        self.cursor
            .read_uint::<LittleEndian>(len)
            .map_err(|_| truncated("little-endian uint"))
    }

    /// LCB (Length-Coded Binary) 읽기
    pub fn lenenc_int(&mut self) -> Result<u64> {
        let byte = self.u8()?;
        match byte {
            0..=0xfa => Ok(byte as u64),
            0xfb => Ok(0),
            0xfc => Ok(self.u16_le()? as u64),
            0xfd => Ok(self.u24_le()? as u64),
            0xfe => self.u64_le(),
            0xff => Err(CdcError::MalformedFrame(
                "invalid length-encoded integer prefix 0xff".to_string(),
            )),
        }
    }

    pub fn lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.lenenc_int()? as usize;
        self.bytes(len)
    }

    pub fn lenenc_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.lenenc_bytes()?).into_owned())
    }

    /// 1바이트 길이 접두 문자열
    pub fn short_string(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        Ok(String::from_utf8_lossy(self.bytes(len)?).into_owned())
    }

    pub fn null_terminated(&mut self) -> Result<&'a [u8]> {
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = self.position();
        let end = data[start.min(data.len())..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .ok_or_else(|| truncated("null-terminated string"))?;
        self.cursor.set_position((end + 1) as u64);
        Ok(&data[start..end])
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        Read::read_exact(&mut self.cursor, buf).map_err(|_| truncated("fixed buffer"))
    }
}
