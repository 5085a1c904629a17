//! 테이블 맵 레지스트리
//!
//! TABLE_MAP 이벤트로 알게 된 테이블 ID → 스키마/테이블/컬럼 정의 매핑.
//! 테이블 ID는 서버 세션 범위의 값이므로 새 연결마다 레지스트리를 비운다.

use crate::connection::ColumnInfo;
use crate::error::{CdcError, Result};
use crate::reader::PayloadReader;
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::debug;

/// MySQL 컬럼 타입 (binlog 타입 코드)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    TypedArray = 20,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            20 => ColumnType::TypedArray,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => return None,
        })
    }

    /// signedness 메타데이터 비트맵의 대상 타입
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Decimal
                | ColumnType::Tiny
                | ColumnType::Short
                | ColumnType::Int24
                | ColumnType::Long
                | ColumnType::LongLong
                | ColumnType::Float
                | ColumnType::Double
                | ColumnType::NewDecimal
        )
    }
}

/// 타입별 테이블 맵 메타데이터
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnMeta {
    None,
    /// BLOB/TEXT/JSON/GEOMETRY 길이 접두 바이트 수
    LengthBytes(u8),
    /// VARCHAR/CHAR 최대 바이트 길이
    MaxLength(u16),
    Decimal { precision: u8, scale: u8 },
    /// BIT(n)의 전체 비트 수
    Bits(u16),
    /// TIME2/DATETIME2/TIMESTAMP2 소수점 자릿수
    Fsp(u8),
    /// ENUM/SET 저장 바이트 수
    PackLength(u8),
}

/// 컬럼 정의 (TABLE_MAP 이벤트에서 파싱)
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub ordinal: usize,
    /// 옵션 메타데이터나 information_schema에서 알게 된 이름
    pub name: Option<String>,
    /// STRING 메타데이터로 보정된 실제 타입
    pub column_type: ColumnType,
    /// 테이블 맵에 기록된 원본 타입 코드
    pub type_code: u8,
    pub meta: ColumnMeta,
    pub nullable: bool,
    pub unsigned: bool,
    /// ENUM/SET 값 목록
    pub values: Vec<String>,
    pub primary_key: bool,
}

impl ColumnDescriptor {
    /// 테이블 맵 메타데이터 블록에서 이 타입의 메타데이터를 읽는다.
    ///
    /// 알 수 없는 타입은 메타데이터 크기를 알 수 없으므로 `None`을 반환하며,
    /// 호출자는 이후 컬럼 메타데이터 해석을 중단해야 한다.
    pub fn read_meta(type_code: u8, reader: &mut PayloadReader<'_>) -> Result<Option<(ColumnType, ColumnMeta)>> {
        let Some(column_type) = ColumnType::from_u8(type_code) else {
            return Ok(None);
        };

        let parsed = match column_type {
            ColumnType::Tiny
            | ColumnType::Short
            | ColumnType::Int24
            | ColumnType::Long
            | ColumnType::LongLong
            | ColumnType::Null
            | ColumnType::Timestamp
            | ColumnType::Date
            | ColumnType::NewDate
            | ColumnType::Time
            | ColumnType::DateTime
            | ColumnType::Year => (column_type, ColumnMeta::None),
            ColumnType::Float | ColumnType::Double => {
                reader.u8()?;
                (column_type, ColumnMeta::None)
            }
            ColumnType::Varchar => (column_type, ColumnMeta::MaxLength(reader.u16_le()?)),
            ColumnType::Bit => {
                let bits = reader.u8()? as u16;
                let bytes = reader.u8()? as u16;
                (column_type, ColumnMeta::Bits(bytes * 8 + bits))
            }
            ColumnType::Timestamp2 | ColumnType::DateTime2 | ColumnType::Time2 => {
                (column_type, ColumnMeta::Fsp(reader.u8()?))
            }
            ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Blob => (column_type, ColumnMeta::LengthBytes(reader.u8()?)),
            ColumnType::NewDecimal => {
                let precision = reader.u8()?;
                let scale = reader.u8()?;
                (column_type, ColumnMeta::Decimal { precision, scale })
            }
            ColumnType::Enum | ColumnType::Set => {
                reader.u8()?;
                (column_type, ColumnMeta::PackLength(reader.u8()?))
            }
            ColumnType::String | ColumnType::VarString => {
                let byte0 = reader.u8()?;
                let byte1 = reader.u8()?;
                string_meta(byte0, byte1)
            }
            ColumnType::Decimal | ColumnType::TypedArray => return Ok(None),
        };
        Ok(Some(parsed))
    }
}

/// CHAR 계열 메타데이터: 첫 바이트에 실제 타입과 길이 상위 비트가 섞여 있다
fn string_meta(byte0: u8, byte1: u8) -> (ColumnType, ColumnMeta) {
    let (real_type, max_len) = if byte0 != 0 && (byte0 & 0x30) != 0x30 {
        (
            byte0 | 0x30,
            byte1 as u16 | ((((byte0 & 0x30) ^ 0x30) as u16) << 4),
        )
    } else {
        (byte0, byte1 as u16)
    };

    match ColumnType::from_u8(real_type) {
        Some(ColumnType::Enum) => (ColumnType::Enum, ColumnMeta::PackLength(byte1)),
        Some(ColumnType::Set) => (ColumnType::Set, ColumnMeta::PackLength(byte1)),
        _ => (ColumnType::String, ColumnMeta::MaxLength(max_len)),
    }
}

/// 테이블 정의
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
    /// 해석할 수 없는 첫 컬럼 (서수, 타입 코드)
    pub unsupported: Option<(usize, u8)>,
    /// SIGNEDNESS 옵션 메타데이터 수신 여부
    pub signedness_known: bool,
}

impl TableDescriptor {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    pub fn has_column_names(&self) -> bool {
        !self.columns.is_empty() && self.columns.iter().all(|c| c.name.is_some())
    }

    /// 컬럼 이름, 모르면 mysqlbinlog 방식의 `@N` (1부터)
    pub fn column_name(&self, ordinal: usize) -> Cow<'_, str> {
        match self.columns.get(ordinal).and_then(|c| c.name.as_deref()) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("@{}", ordinal + 1)),
        }
    }

    /// TABLE_MAP 뒤에 붙는 옵션 메타데이터 (binlog_row_metadata=FULL) 적용
    pub fn apply_optional_metadata(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = PayloadReader::new(data);
        while !reader.is_empty() {
            let field_type = reader.u8()?;
            let value = reader.lenenc_bytes()?;
            let mut field = PayloadReader::new(value);
            match field_type {
                // SIGNEDNESS: 숫자 컬럼마다 1비트, MSB부터
                1 => {
                    let mut numeric_index = 0usize;
                    for column in self.columns.iter_mut().filter(|c| c.column_type.is_numeric()) {
                        let byte = value.get(numeric_index / 8).copied().unwrap_or(0);
                        column.unsigned = byte & (0x80 >> (numeric_index % 8)) != 0;
                        numeric_index += 1;
                    }
                    self.signedness_known = true;
                }
                // COLUMN_NAME
                4 => {
                    for column in self.columns.iter_mut() {
                        if field.is_empty() {
                            break;
                        }
                        column.name = Some(field.lenenc_string()?);
                    }
                }
                // SET_STR_VALUE / ENUM_STR_VALUE
                5 | 6 => {
                    let wanted = if field_type == 5 {
                        ColumnType::Set
                    } else {
                        ColumnType::Enum
                    };
                    for column in self.columns.iter_mut().filter(|c| c.column_type == wanted) {
                        if field.is_empty() {
                            break;
                        }
                        let count = field.lenenc_int()? as usize;
                        let mut values = Vec::with_capacity(count);
                        for _ in 0..count {
                            values.push(field.lenenc_string()?);
                        }
                        column.values = values;
                    }
                }
                // SIMPLE_PRIMARY_KEY
                8 => {
                    while !field.is_empty() {
                        let index = field.lenenc_int()? as usize;
                        if let Some(column) = self.columns.get_mut(index) {
                            column.primary_key = true;
                        }
                    }
                }
                // PRIMARY_KEY_WITH_PREFIX
                9 => {
                    while !field.is_empty() {
                        let index = field.lenenc_int()? as usize;
                        field.lenenc_int()?;
                        if let Some(column) = self.columns.get_mut(index) {
                            column.primary_key = true;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// information_schema 컬럼 정보 적용. 컬럼 수가 다르면 적용하지 않고 false.
    pub fn apply_column_info(&mut self, info: &[ColumnInfo]) -> bool {
        if info.len() != self.columns.len() {
            return false;
        }
        for (column, info) in self.columns.iter_mut().zip(info) {
            if column.name.is_none() {
                column.name = Some(info.name.clone());
            }
            let column_type = info.column_type.to_ascii_lowercase();
            if !self.signedness_known && column.column_type.is_numeric() {
                column.unsigned = column_type.contains("unsigned");
            }
            if column.values.is_empty()
                && matches!(column.column_type, ColumnType::Enum | ColumnType::Set)
            {
                column.values = parse_value_list(&info.column_type);
            }
            column.primary_key |= info.primary_key;
        }
        true
    }
}

/// `enum('a','b''c')` / `set(...)` 에서 값 목록 추출
pub fn parse_value_list(column_type: &str) -> Vec<String> {
    let (Some(start), Some(end)) = (column_type.find('('), column_type.rfind(')')) else {
        return Vec::new();
    };
    if end <= start {
        return Vec::new();
    }

    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = column_type[start + 1..end].chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if in_quote && chars.peek() == Some(&'\'') => {
                chars.next();
                current.push('\'');
            }
            '\'' => {
                if in_quote {
                    values.push(std::mem::take(&mut current));
                }
                in_quote = !in_quote;
            }
            _ if in_quote => current.push(c),
            _ => {}
        }
    }
    values
}

/// 테이블 ID → 테이블 정의 레지스트리 (세션 단위)
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: HashMap<u64, TableDescriptor>,
}

impl TableRegistry {
    pub fn new() -> Self {
        TableRegistry::default()
    }

    /// 등록 또는 교체. 같은 ID가 다른 테이블을 가리키고 있었다면 먼저 제거한다.
    pub fn upsert(&mut self, table_id: u64, descriptor: TableDescriptor) {
        if let Some(existing) = self.tables.get(&table_id) {
            if existing.schema != descriptor.schema || existing.table != descriptor.table {
                debug!(
                    table_id,
                    old = %existing.qualified_name(),
                    new = %descriptor.qualified_name(),
                    "Table id reused, evicting previous mapping"
                );
                self.evict(table_id);
            }
        }
        self.tables.insert(table_id, descriptor);
    }

    pub fn lookup(&self, table_id: u64) -> Result<&TableDescriptor> {
        self.tables
            .get(&table_id)
            .ok_or(CdcError::UnknownTable { table_id })
    }

    pub fn lookup_mut(&mut self, table_id: u64) -> Result<&mut TableDescriptor> {
        self.tables
            .get_mut(&table_id)
            .ok_or(CdcError::UnknownTable { table_id })
    }

    pub fn evict(&mut self, table_id: u64) -> Option<TableDescriptor> {
        self.tables.remove(&table_id)
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(ordinal: usize, column_type: ColumnType) -> ColumnDescriptor {
        ColumnDescriptor {
            ordinal,
            name: None,
            column_type,
            type_code: column_type as u8,
            meta: ColumnMeta::None,
            nullable: true,
            unsigned: false,
            values: Vec::new(),
            primary_key: false,
        }
    }

    fn table(table_id: u64, name: &str, columns: Vec<ColumnDescriptor>) -> TableDescriptor {
        TableDescriptor {
            table_id,
            schema: "shop".to_string(),
            table: name.to_string(),
            columns,
            unsupported: None,
            signedness_known: false,
        }
    }

    #[test]
    fn test_registry_lookup_unknown_table() {
        let registry = TableRegistry::new();
        let err = registry.lookup(42).unwrap_err();
        assert!(matches!(err, CdcError::UnknownTable { table_id: 42 }));
    }

    #[test]
    fn test_registry_upsert_replaces_reused_id() {
        let mut registry = TableRegistry::new();
        registry.upsert(1, table(1, "orders", vec![column(0, ColumnType::Long)]));
        registry.upsert(1, table(1, "customers", vec![]));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(1).unwrap().table, "customers");

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_string_meta_enum_and_char() {
        // ENUM은 STRING(0xfe) + real_type 0xf7로 기록된다
        assert_eq!(string_meta(0xf7, 1), (ColumnType::Enum, ColumnMeta::PackLength(1)));
        assert_eq!(string_meta(0xfe, 40), (ColumnType::String, ColumnMeta::MaxLength(40)));
        // CHAR(255) utf8mb4 = 1020 바이트: 상위 비트가 첫 바이트에 섞임
        let (ty, meta) = string_meta(0xce, 0xfc);
        assert_eq!(ty, ColumnType::String);
        assert_eq!(meta, ColumnMeta::MaxLength(1020));
    }

    #[test]
    fn test_column_name_fallback() {
        let mut descriptor = table(1, "orders", vec![column(0, ColumnType::Long), column(1, ColumnType::Varchar)]);
        assert_eq!(descriptor.column_name(1), "@2");
        assert!(!descriptor.has_column_names());

        descriptor.columns[1].name = Some("status".into());
        assert_eq!(descriptor.column_name(1), "status");
    }

    #[test]
    fn test_apply_optional_metadata() {
        let mut descriptor = table(
            1,
            "orders",
            vec![
                column(0, ColumnType::Long),
                column(1, ColumnType::Enum),
                column(2, ColumnType::Tiny),
            ],
        );

        let mut data = Vec::new();
        // SIGNEDNESS: 숫자 컬럼 2개 중 두 번째가 unsigned → 0b0100_0000
        data.extend_from_slice(&[1, 1, 0x40]);
        // COLUMN_NAME
        let names: &[&str] = &["id", "state", "flag"];
        let mut payload = Vec::new();
        for name in names {
            payload.push(name.len() as u8);
            payload.extend_from_slice(name.as_bytes());
        }
        data.push(4);
        data.push(payload.len() as u8);
        data.extend_from_slice(&payload);
        // ENUM_STR_VALUE: 1개 컬럼, 값 2개
        data.extend_from_slice(&[6, 8, 2, 2, b'o', b'n', 3, b'o', b'f', b'f']);
        // SIMPLE_PRIMARY_KEY
        data.extend_from_slice(&[8, 1, 0]);

        descriptor.apply_optional_metadata(&data).unwrap();
        assert!(descriptor.has_column_names());
        assert_eq!(descriptor.column_name(1), "state");
        assert!(!descriptor.columns[0].unsigned);
        assert!(descriptor.columns[2].unsigned);
        assert_eq!(descriptor.columns[1].values, vec!["on", "off"]);
        assert!(descriptor.columns[0].primary_key);
        assert!(descriptor.signedness_known);
    }

    #[test]
    fn test_apply_column_info() {
        let mut descriptor = table(
            1,
            "orders",
            vec![column(0, ColumnType::Long), column(1, ColumnType::Set)],
        );
        let info = vec![
            ColumnInfo {
                name: "id".into(),
                column_type: "int(10) unsigned".into(),
                nullable: false,
                primary_key: true,
            },
            ColumnInfo {
                name: "tags".into(),
                column_type: "set('a','b''c')".into(),
                nullable: true,
                primary_key: false,
            },
        ];
        assert!(descriptor.apply_column_info(&info));
        assert_eq!(descriptor.column_name(0), "id");
        assert!(descriptor.columns[0].unsigned);
        assert!(descriptor.columns[0].primary_key);
        assert_eq!(descriptor.columns[1].values, vec!["a", "b'c"]);

        assert!(!descriptor.apply_column_info(&info[..1]));
    }

    #[test]
    fn test_parse_value_list() {
        assert_eq!(parse_value_list("enum('new','shipped')"), vec!["new", "shipped"]);
        assert_eq!(parse_value_list("varchar(20)"), Vec::<String>::new());
    }
}
