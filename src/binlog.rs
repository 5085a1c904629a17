//! MySQL Binlog 이벤트 디코더
//!
//! 복제 스트림으로 받은 이벤트 하나(헤더 + 바디 + 선택적 CRC32)를 해석합니다.
//! 이벤트 헤더:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)

use crate::error::{CdcError, Result};
use crate::events::*;
use crate::filter::StreamFilter;
use crate::reader::PayloadReader;
use crate::table_map::{ColumnDescriptor, ColumnMeta, ColumnType, TableDescriptor, TableRegistry};
use crate::value::decode_value;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

const CHECKSUM_LEN: usize = 4;
/// FDE 바디: binlog_version(2) + server_version(50) + create_timestamp(4) + header_length(1)
const FDE_FIXED_LEN: usize = 57;
/// 체크섬 알고리즘 바이트가 기록되기 시작한 서버 버전
const CHECKSUM_VERSION: (u32, u32, u32) = (5, 6, 1);
/// 행 이벤트 플래그: 문장의 마지막 행 이벤트
const STMT_END_F: u16 = 0x0001;

/// 지원하지 않는 컬럼 타입을 가진 테이블의 행 이벤트 처리 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedTypePolicy {
    /// 해당 테이블의 행 이벤트를 건너뛴다
    #[default]
    SkipTable,
    /// 스트림을 중단한다
    Abort,
}

/// 이벤트 디코더 (연결마다 새로 생성)
pub struct EventDecoder {
    filter: Arc<StreamFilter>,
    unsupported_policy: UnsupportedTypePolicy,
    format: Option<FormatDescription>,
    current_file: Option<String>,
}

impl EventDecoder {
    pub fn new(filter: Arc<StreamFilter>, unsupported_policy: UnsupportedTypePolicy) -> Self {
        EventDecoder {
            filter,
            unsupported_policy,
            format: None,
            current_file: None,
        }
    }

    pub fn format(&self) -> Option<&FormatDescription> {
        self.format.as_ref()
    }

    /// 마지막 ROTATE 이벤트가 알려준 binlog 파일
    pub fn current_file(&self) -> Option<&str> {
        self.current_file.as_deref()
    }

    /// 프레임 하나를 디코딩하고, TABLE_MAP이면 레지스트리에 등록한다
    pub fn decode(&mut self, frame: &[u8], registry: &mut TableRegistry) -> Result<DecodedFrame> {
        let header = Self::parse_header(frame)?;
        if header.event_length as usize != frame.len() {
            return Err(CdcError::MalformedFrame(format!(
                "event length {} does not match frame size {}",
                header.event_length,
                frame.len()
            )));
        }

        if header.event_type == EventType::FormatDescriptionEvent {
            let format = Self::parse_format_description(frame)?;
            debug!(
                server_version = %format.server_version,
                binlog_version = format.binlog_version,
                checksum = ?format.checksum,
                "Format description received"
            );
            self.format = Some(format.clone());
            return Ok(DecodedFrame {
                header,
                event: DecodedEvent::FormatDescription(format),
            });
        }

        let body = self.strip_checksum(frame)?;
        let body = &body[EventHeader::SIZE..];

        let event = match header.event_type {
            EventType::RotateEvent => {
                let rotate = Self::parse_rotate_event(body)?;
                self.current_file = Some(rotate.next_binlog_name.clone());
                DecodedEvent::Rotate(rotate)
            }
            EventType::TableMapEvent => {
                let id_len = self.table_id_len(EventType::TableMapEvent);
                let descriptor = Self::parse_table_map_event(body, id_len)?;
                let table_id = descriptor.table_id;
                trace!(table_id, table = %descriptor.qualified_name(), "Table map");
                registry.upsert(table_id, descriptor);
                DecodedEvent::TableMap { table_id }
            }
            EventType::WriteRowsEventV1
            | EventType::UpdateRowsEventV1
            | EventType::DeleteRowsEventV1
            | EventType::WriteRowsEvent
            | EventType::UpdateRowsEvent
            | EventType::DeleteRowsEvent => self.decode_rows(header.event_type, body, registry)?,
            EventType::QueryEvent => DecodedEvent::Query(Self::parse_query_event(body)?),
            EventType::XidEvent => DecodedEvent::Xid(PayloadReader::new(body).u64_le()?),
            EventType::GtidEvent => DecodedEvent::Gtid(Self::parse_gtid_event(body)?),
            EventType::HeartbeatEvent => DecodedEvent::Heartbeat,
            EventType::PartialUpdateRowsEvent | EventType::TransactionPayloadEvent => {
                warn!(
                    type_code = header.type_code,
                    "Ignoring event type that cannot be decoded; disable binlog_row_value_options/binlog_transaction_compression"
                );
                DecodedEvent::Unknown(header.type_code)
            }
            EventType::FormatDescriptionEvent
            | EventType::StopEvent
            | EventType::RowsQueryEvent
            | EventType::AnonymousGtidEvent
            | EventType::PreviousGtidsEvent
            | EventType::Unknown => DecodedEvent::Unknown(header.type_code),
        };

        Ok(DecodedFrame { header, event })
    }

    /// 이벤트 헤더 파싱
    pub fn parse_header(frame: &[u8]) -> Result<EventHeader> {
        if frame.len() < EventHeader::SIZE {
            return Err(CdcError::MalformedFrame(format!(
                "frame of {} bytes is shorter than the event header",
                frame.len()
            )));
        }

        let mut reader = PayloadReader::new(frame);
        let timestamp = reader.u32_le()?;
        let type_code = reader.u8()?;
        let server_id = reader.u32_le()?;
        let event_length = reader.u32_le()?;
        let next_pos = reader.u32_le()?;
        let flags = reader.u16_le()?;

        Ok(EventHeader {
            timestamp,
            type_code,
            event_type: EventType::from_u8(type_code),
            server_id,
            event_length,
            next_pos,
            flags,
        })
    }

    /// 체크섬 검증 후 제거.
    ///
    /// FDE를 받기 전(접속 직후의 fake ROTATE)에는 알고리즘을 모르므로
    /// 마지막 4바이트가 앞부분의 CRC32와 일치할 때만 체크섬으로 본다.
    fn strip_checksum<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8]> {
        match self.format.as_ref().map(|f| f.checksum) {
            Some(ChecksumAlgorithm::Crc32) => verify_checksum(frame),
            Some(ChecksumAlgorithm::None) => Ok(frame),
            None => Ok(verify_checksum(frame).unwrap_or(frame)),
        }
    }

    /// post-header 길이가 6이면 4바이트 테이블 ID (아주 오래된 서버)
    fn table_id_len(&self, event_type: EventType) -> usize {
        let post_header_len = self
            .format
            .as_ref()
            .and_then(|f| f.post_header_lengths.get(event_type as usize - 1).copied());
        match post_header_len {
            Some(6) => 4,
            _ => 6,
        }
    }

    /// FORMAT_DESCRIPTION 이벤트 파싱 (15)
    pub fn parse_format_description(frame: &[u8]) -> Result<FormatDescription> {
        let body = &frame[EventHeader::SIZE.min(frame.len())..];
        let mut reader = PayloadReader::new(body);
        let binlog_version = reader.u16_le()?;
        let server_version = String::from_utf8_lossy(reader.bytes(50)?)
            .trim_end_matches('\0')
            .to_string();
        let _create_timestamp = reader.u32_le()?;
        let header_length = reader.u8()?;

        let has_checksum_byte = parse_server_version(&server_version) >= CHECKSUM_VERSION;
        let (post_header_lengths, checksum) = if has_checksum_byte && body.len() >= FDE_FIXED_LEN + 1 + CHECKSUM_LEN {
            let alg_pos = body.len() - CHECKSUM_LEN - 1;
            let checksum = match body[alg_pos] {
                0 => ChecksumAlgorithm::None,
                1 => ChecksumAlgorithm::Crc32,
                other => {
                    return Err(CdcError::MalformedFrame(format!(
                        "unknown binlog checksum algorithm {}",
                        other
                    )))
                }
            };
            if checksum == ChecksumAlgorithm::Crc32 {
                verify_checksum(frame)?;
            }
            (body[FDE_FIXED_LEN..alg_pos].to_vec(), checksum)
        } else {
            (body[FDE_FIXED_LEN..].to_vec(), ChecksumAlgorithm::None)
        };

        Ok(FormatDescription {
            binlog_version,
            server_version,
            header_length,
            post_header_lengths,
            checksum,
        })
    }

    /// ROTATE 이벤트 파싱 (4)
    pub fn parse_rotate_event(body: &[u8]) -> Result<RotateEvent> {
        let mut reader = PayloadReader::new(body);
        let position = reader.u64_le()?;
        let next_binlog_name = String::from_utf8_lossy(reader.rest()).to_string();
        if next_binlog_name.is_empty() {
            return Err(CdcError::MalformedFrame(
                "rotate event without a file name".to_string(),
            ));
        }

        Ok(RotateEvent {
            next_binlog_name,
            position,
        })
    }

    /// QUERY 이벤트 파싱 (2)
    pub fn parse_query_event(body: &[u8]) -> Result<QueryEvent> {
        let mut reader = PayloadReader::new(body);
        let thread_id = reader.u32_le()?;
        let _exec_time = reader.u32_le()?;
        let schema_len = reader.u8()? as usize;
        let _error_code = reader.u16_le()?;
        let status_len = reader.u16_le()? as usize;

        // Status variables skip
        reader.skip(status_len)?;
        let schema = String::from_utf8_lossy(reader.bytes(schema_len)?).to_string();
        reader.skip(1)?;
        let query = String::from_utf8_lossy(reader.rest()).to_string();

        Ok(QueryEvent {
            thread_id,
            schema,
            query,
        })
    }

    /// GTID 이벤트 파싱 (33) → "uuid:gno"
    pub fn parse_gtid_event(body: &[u8]) -> Result<String> {
        let mut reader = PayloadReader::new(body);
        let _flags = reader.u8()?;
        let mut sid = [0u8; 16];
        reader.read_exact(&mut sid)?;
        let gno = reader.u64_le()?;
        Ok(format!("{}:{}", Uuid::from_bytes(sid), gno))
    }

    /// TABLE_MAP 이벤트 파싱 (19)
    pub fn parse_table_map_event(body: &[u8], table_id_len: usize) -> Result<TableDescriptor> {
        let mut reader = PayloadReader::new(body);
        let table_id = reader.uint_le(table_id_len)?;
        let _flags = reader.u16_le()?;

        let schema = reader.short_string()?;
        reader.skip(1)?;
        let table = reader.short_string()?;
        reader.skip(1)?;

        let column_count = reader.lenenc_int()? as usize;
        let column_types = reader.bytes(column_count)?;
        let metadata = reader.lenenc_bytes()?;
        let null_bitmap = reader.bytes(column_count.div_ceil(8))?;

        let mut meta_reader = PayloadReader::new(metadata);
        let mut unsupported = None;
        let mut columns = Vec::with_capacity(column_count);
        for (ordinal, &type_code) in column_types.iter().enumerate() {
            let parsed = if unsupported.is_none() {
                ColumnDescriptor::read_meta(type_code, &mut meta_reader)?
            } else {
                None
            };
            let (column_type, meta) = match parsed {
                Some(parsed) => parsed,
                None => {
                    if unsupported.is_none() {
                        unsupported = Some((ordinal, type_code));
                    }
                    // 이후 컬럼 메타데이터 위치를 알 수 없다. 값 디코딩은 테이블 단위로 막힌다.
                    (
                        ColumnType::from_u8(type_code).unwrap_or(ColumnType::Null),
                        ColumnMeta::None,
                    )
                }
            };
            columns.push(ColumnDescriptor {
                ordinal,
                name: None,
                column_type,
                type_code,
                meta,
                nullable: bit_set(null_bitmap, ordinal),
                unsigned: false,
                values: Vec::new(),
                primary_key: false,
            });
        }

        let mut descriptor = TableDescriptor {
            table_id,
            schema,
            table,
            columns,
            unsupported,
            signedness_known: false,
        };
        if !reader.is_empty() {
            descriptor.apply_optional_metadata(reader.rest())?;
        }
        Ok(descriptor)
    }

    /// WRITE/UPDATE/DELETE_ROWS 이벤트 (v1: 23~25, v2: 30~32)
    fn decode_rows(
        &self,
        event_type: EventType,
        body: &[u8],
        registry: &TableRegistry,
    ) -> Result<DecodedEvent> {
        let Some(action) = event_type.row_action() else {
            return Ok(DecodedEvent::Unknown(event_type as u8));
        };

        let mut reader = PayloadReader::new(body);
        let table_id = reader.uint_le(self.table_id_len(event_type))?;
        let flags = reader.u16_le()?;
        let statement_end = flags & STMT_END_F != 0;
        if event_type.has_extra_row_data() {
            // extra data 길이는 자기 자신(2바이트)을 포함한다
            let extra_len = reader.u16_le()? as usize;
            reader.skip(extra_len.saturating_sub(2))?;
        }

        let table = registry.lookup(table_id)?;

        if !self.filter.includes(&table.schema, &table.table, action) {
            return Ok(DecodedEvent::SkippedRows {
                table_id,
                action,
                statement_end,
                reason: SkipReason::Filtered,
            });
        }

        if let Some((column, type_code)) = table.unsupported {
            return match self.unsupported_policy {
                UnsupportedTypePolicy::SkipTable => {
                    warn!(
                        table = %table.qualified_name(),
                        column,
                        type_code,
                        "Skipping rows of table with unsupported column type"
                    );
                    Ok(DecodedEvent::SkippedRows {
                        table_id,
                        action,
                        statement_end,
                        reason: SkipReason::UnsupportedType { column, type_code },
                    })
                }
                UnsupportedTypePolicy::Abort => Err(CdcError::UnsupportedType {
                    schema: table.schema.clone(),
                    table: table.table.clone(),
                    column,
                    type_code,
                }),
            };
        }

        let column_count = reader.lenenc_int()? as usize;
        if column_count != table.column_count() {
            return Err(CdcError::SchemaMismatch(format!(
                "rows event for {} has {} columns, table map has {}",
                table.qualified_name(),
                column_count,
                table.column_count()
            )));
        }

        let bitmap_len = column_count.div_ceil(8);
        let present = reader.bytes(bitmap_len)?;
        let present_after = if action == ActionKind::Update {
            reader.bytes(bitmap_len)?
        } else {
            present
        };

        let mut before = Vec::new();
        let mut after = Vec::new();
        while !reader.is_empty() {
            match action {
                ActionKind::Insert => after.push(read_row_image(&mut reader, table, present)?),
                ActionKind::Delete => before.push(read_row_image(&mut reader, table, present)?),
                ActionKind::Update => {
                    before.push(read_row_image(&mut reader, table, present)?);
                    after.push(read_row_image(&mut reader, table, present_after)?);
                }
            }
        }

        Ok(DecodedEvent::RowMutation(RawRowEvent {
            table_id,
            action,
            column_count,
            before,
            after,
            statement_end,
        }))
    }
}

fn bit_set(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index / 8)
        .map(|byte| byte & (1 << (index % 8)) != 0)
        .unwrap_or(false)
}

/// 행 이미지 하나: 포함된 컬럼 기준 NULL 비트맵 + 값들
fn read_row_image(
    reader: &mut PayloadReader<'_>,
    table: &TableDescriptor,
    present: &[u8],
) -> Result<RowImage> {
    let present_columns: Vec<&ColumnDescriptor> = table
        .columns
        .iter()
        .filter(|c| bit_set(present, c.ordinal))
        .collect();
    let null_bitmap = reader.bytes(present_columns.len().div_ceil(8))?;

    let mut image = RowImage::new();
    for (index, column) in present_columns.into_iter().enumerate() {
        let value = if bit_set(null_bitmap, index) {
            CellValue::Null
        } else {
            decode_value(reader, table, column)?
        };
        image.insert(column.ordinal, value);
    }
    Ok(image)
}

/// 마지막 4바이트 CRC32 검증 후 체크섬을 뺀 프레임 반환
fn verify_checksum(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < EventHeader::SIZE + CHECKSUM_LEN {
        return Err(CdcError::MalformedFrame(
            "frame too short to carry a checksum".to_string(),
        ));
    }
    let (data, checksum) = frame.split_at(frame.len() - CHECKSUM_LEN);
    let expected = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
    let actual = crc32fast::hash(data);
    if actual != expected {
        return Err(CdcError::MalformedFrame(format!(
            "checksum mismatch: expected {:08x}, computed {:08x}",
            expected, actual
        )));
    }
    Ok(data)
}

/// "8.0.36-log" → (8, 0, 36)
fn parse_server_version(version: &str) -> (u32, u32, u32) {
    let mut parts = version.split(|c: char| !c.is_ascii_digit()).filter(|p| !p.is_empty());
    let mut next = || parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (next(), next(), next())
}
