//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의

use chrono::{DateTime, Utc};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN/COMMIT)
    QueryEvent = 2,
    /// 서버 종료
    StopEvent = 3,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 포맷 디스크립션 (binlog 버전, 체크섬 알고리즘)
    FormatDescriptionEvent = 15,
    /// 트랜잭션 커밋
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    /// 하트비트 (스트림 유휴 시)
    HeartbeatEvent = 27,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 29,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    PreviousGtidsEvent = 35,
    /// JSON 부분 업데이트 (binlog_row_value_options=PARTIAL_JSON)
    PartialUpdateRowsEvent = 39,
    /// 트랜잭션 페이로드 이벤트 (압축)
    TransactionPayloadEvent = 40,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            29 => EventType::RowsQueryEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            39 => EventType::PartialUpdateRowsEvent,
            40 => EventType::TransactionPayloadEvent,
            _ => EventType::Unknown,
        }
    }

    /// 행 변경 이벤트인 경우 해당 작업 종류
    pub fn row_action(&self) -> Option<ActionKind> {
        match self {
            EventType::WriteRowsEventV1 | EventType::WriteRowsEvent => Some(ActionKind::Insert),
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEvent => Some(ActionKind::Update),
            EventType::DeleteRowsEventV1 | EventType::DeleteRowsEvent => Some(ActionKind::Delete),
            _ => None,
        }
    }

    /// v2 행 이벤트는 post-header 뒤에 extra data 블록을 가진다
    pub fn has_extra_row_data(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEvent | EventType::UpdateRowsEvent | EventType::DeleteRowsEvent
        )
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타입스탬프 (초 단위)
    pub timestamp: u32,
    /// 원본 타입 코드
    pub type_code: u8,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (바이트, 헤더/체크섬 포함)
    pub event_length: u32,
    /// 다음 이벤트 위치 (artificial 이벤트는 0)
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    /// 서버가 만들어 낸 가짜 이벤트 (fake rotate 등)
    pub const ARTIFICIAL_FLAG: u16 = 0x0020;

    pub fn is_artificial(&self) -> bool {
        self.flags & Self::ARTIFICIAL_FLAG != 0
    }
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Insert,
    Update,
    Delete,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [ActionKind::Insert, ActionKind::Update, ActionKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Insert => "insert",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" | "write" => Ok(ActionKind::Insert),
            "update" => Ok(ActionKind::Update),
            "delete" => Ok(ActionKind::Delete),
            other => Err(format!("unknown action kind: {}", other)),
        }
    }
}

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    /// 고정 소수점 (정밀도 유지를 위해 문자열)
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Year(u16),
    /// YYYY-MM-DD
    Date(String),
    /// [-]HH:MM:SS[.ffffff]
    Time(String),
    /// YYYY-MM-DD HH:MM:SS[.ffffff]
    DateTime(String),
    Timestamp(DateTime<Utc>),
    /// 값 목록을 알면 이름, 모르면 1부터 시작하는 인덱스 문자열
    Enum(String),
    Set(Vec<String>),
    Bit(u64),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int(i) => Some(*i),
            CellValue::UInt(u) => i64::try_from(*u).ok(),
            CellValue::Year(y) => Some(*y as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(s)
            | CellValue::Decimal(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::DateTime(s)
            | CellValue::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            CellValue::Null => Some("NULL".to_string()),
            CellValue::Int(i) => Some(i.to_string()),
            CellValue::UInt(u) => Some(u.to_string()),
            CellValue::Double(d) => Some(d.to_string()),
            CellValue::Timestamp(ts) => Some(ts.to_rfc3339()),
            other => other.as_str().map(str::to_string),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Null => serializer.serialize_unit(),
            CellValue::Int(v) => serializer.serialize_i64(*v),
            CellValue::UInt(v) | CellValue::Bit(v) => serializer.serialize_u64(*v),
            CellValue::Float(v) => serializer.serialize_f32(*v),
            CellValue::Double(v) => serializer.serialize_f64(*v),
            CellValue::Year(v) => serializer.serialize_u16(*v),
            CellValue::Decimal(s)
            | CellValue::String(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::DateTime(s)
            | CellValue::Enum(s) => serializer.serialize_str(s),
            CellValue::Bytes(bytes) => serializer.serialize_str(&hex_string(bytes)),
            CellValue::Timestamp(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            CellValue::Set(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            CellValue::Json(value) => value.serialize(serializer),
        }
    }
}

/// 바이너리 값을 `0x...` 16진수 문자열로 표현
pub fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// 행 이미지: 컬럼 서수 → 값 (이미지에 없는 컬럼은 키가 없음)
pub type RowImage = BTreeMap<usize, CellValue>;

/// 디코딩된 행 변경 이벤트 (materializer로 바로 전달됨)
#[derive(Debug, Clone, PartialEq)]
pub struct RawRowEvent {
    pub table_id: u64,
    pub action: ActionKind,
    /// 이벤트가 선언한 컬럼 수
    pub column_count: usize,
    /// UPDATE/DELETE의 변경 전 이미지
    pub before: Vec<RowImage>,
    /// INSERT/UPDATE의 변경 후 이미지 (UPDATE는 before와 같은 인덱스끼리 짝)
    pub after: Vec<RowImage>,
    /// 문장의 마지막 행 이벤트 여부 (STMT_END_F)
    pub statement_end: bool,
}

impl RawRowEvent {
    pub fn row_count(&self) -> usize {
        match self.action {
            ActionKind::Insert => self.after.len(),
            ActionKind::Update | ActionKind::Delete => self.before.len(),
        }
    }
}

/// 포맷 디스크립션 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    pub binlog_version: u16,
    pub server_version: String,
    pub header_length: u8,
    /// 이벤트 타입별 post-header 길이 (인덱스 = 타입 코드 - 1)
    pub post_header_lengths: Vec<u8>,
    pub checksum: ChecksumAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    None,
    Crc32,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEvent {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    /// 스레드 ID
    pub thread_id: u32,
    /// 데이터베이스명
    pub schema: String,
    /// 쿼리 문자열
    pub query: String,
}

impl QueryEvent {
    pub fn is_begin(&self) -> bool {
        self.query.eq_ignore_ascii_case("BEGIN")
    }

    /// 비트랜잭션 엔진은 XID 대신 COMMIT 쿼리로 트랜잭션을 끝낸다
    pub fn is_commit(&self) -> bool {
        self.query.eq_ignore_ascii_case("COMMIT")
    }
}

/// 행 이벤트를 해석하지 않고 건너뛴 이유
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// 스키마/테이블/작업 필터에 걸림
    Filtered,
    /// 테이블에 지원하지 않는 컬럼 타입이 있고 정책이 skip
    UnsupportedType { column: usize, type_code: u8 },
}

/// 디코더가 만든 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    FormatDescription(FormatDescription),
    Rotate(RotateEvent),
    /// 레지스트리에 등록된 테이블 ID
    TableMap { table_id: u64 },
    RowMutation(RawRowEvent),
    SkippedRows {
        table_id: u64,
        action: ActionKind,
        statement_end: bool,
        reason: SkipReason,
    },
    /// "uuid:gno"
    Gtid(String),
    Xid(u64),
    Query(QueryEvent),
    Heartbeat,
    Unknown(u8),
}

/// 헤더와 함께 디코딩된 프레임
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub header: EventHeader,
    pub event: DecodedEvent,
}

/// 변경 이벤트가 발생한 binlog 위치
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPosition {
    pub file: String,
    pub offset: u64,
}

/// CDC 변경 이벤트 (sink로 전달되는 단위)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    /// 데이터베이스명
    pub schema: String,
    /// 테이블명
    pub table: String,
    /// 연산 타입 (insert, update, delete)
    pub action: ActionKind,
    /// 유효 행 상태 (insert/update는 변경 후, delete는 삭제된 값)
    pub columns: BTreeMap<String, CellValue>,
    /// UPDATE 변경 전 값 (설정 시에만)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<BTreeMap<String, CellValue>>,
    pub position: EventPosition,
    /// GTID (있는 경우)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
    /// 이벤트 타임스탬프
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_row_action() {
        assert_eq!(EventType::from_u8(30).row_action(), Some(ActionKind::Insert));
        assert_eq!(EventType::from_u8(24).row_action(), Some(ActionKind::Update));
        assert_eq!(EventType::from_u8(32).row_action(), Some(ActionKind::Delete));
        assert_eq!(EventType::from_u8(19).row_action(), None);
        assert_eq!(EventType::from_u8(200), EventType::Unknown);
    }

    #[test]
    fn test_action_kind_vocabulary() {
        assert_eq!(serde_json::to_value(ActionKind::Insert).unwrap(), json!("insert"));
        assert_eq!("DELETE".parse::<ActionKind>().unwrap(), ActionKind::Delete);
        assert!("truncate".parse::<ActionKind>().is_err());
    }

    #[test]
    fn test_cell_value_serialization() {
        assert_eq!(serde_json::to_value(CellValue::Int(-3)).unwrap(), json!(-3));
        assert_eq!(serde_json::to_value(CellValue::Null).unwrap(), json!(null));
        assert_eq!(
            serde_json::to_value(CellValue::Bytes(vec![0xde, 0xad])).unwrap(),
            json!("0xdead")
        );
        assert_eq!(
            serde_json::to_value(CellValue::Set(vec!["a".into(), "c".into()])).unwrap(),
            json!(["a", "c"])
        );
    }

    #[test]
    fn test_change_event_shape() {
        let mut columns = BTreeMap::new();
        columns.insert("id".to_string(), CellValue::Int(1));
        columns.insert("status".to_string(), CellValue::String("new".into()));
        let event = ChangeEvent {
            schema: "shop".into(),
            table: "orders".into(),
            action: ActionKind::Insert,
            columns,
            before: None,
            position: EventPosition {
                file: "mysql-bin.000001".into(),
                offset: 1024,
            },
            gtid: None,
            timestamp: DateTime::from_timestamp(0, 0).unwrap(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], json!("insert"));
        assert_eq!(value["columns"], json!({"id": 1, "status": "new"}));
        assert_eq!(value["position"], json!({"file": "mysql-bin.000001", "offset": 1024}));
        assert!(value.get("before").is_none());
        assert!(value.get("gtid").is_none());
    }
}
