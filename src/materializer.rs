//! 행 이벤트 → 변경 이벤트 변환
//!
//! 행 이미지의 컬럼 서수를 테이블 정의의 컬럼 이름으로 바꾸고,
//! 작업 종류에 따라 유효 행 상태를 고른다.
//!   - INSERT: 변경 후 이미지
//!   - UPDATE: 변경 후 이미지 (설정 시 변경 전 이미지를 `before`로)
//!   - DELETE: 삭제된 행의 값

use crate::error::{CdcError, Result};
use crate::events::{ActionKind, CellValue, ChangeEvent, EventPosition, RawRowEvent, RowImage};
use crate::table_map::TableDescriptor;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// 행 이벤트와 함께 전달되는 발생 정보
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext<'a> {
    pub position: &'a EventPosition,
    pub gtid: Option<&'a str>,
    pub timestamp: DateTime<Utc>,
    pub include_before_image: bool,
}

/// 행마다 변경 이벤트 하나
pub fn materialize(
    raw: &RawRowEvent,
    table: &TableDescriptor,
    context: &EventContext<'_>,
) -> Result<Vec<ChangeEvent>> {
    if raw.column_count != table.column_count() {
        return Err(CdcError::SchemaMismatch(format!(
            "rows event for table id {} carries {} columns, descriptor {} has {}",
            raw.table_id,
            raw.column_count,
            table.qualified_name(),
            table.column_count()
        )));
    }

    let mut events = Vec::with_capacity(raw.row_count());
    match raw.action {
        ActionKind::Insert => {
            for image in &raw.after {
                events.push(change_event(table, raw.action, named(table, image)?, None, context));
            }
        }
        ActionKind::Delete => {
            for image in &raw.before {
                events.push(change_event(table, raw.action, named(table, image)?, None, context));
            }
        }
        ActionKind::Update => {
            if raw.before.len() != raw.after.len() {
                return Err(CdcError::SchemaMismatch(format!(
                    "update on {} has {} before images and {} after images",
                    table.qualified_name(),
                    raw.before.len(),
                    raw.after.len()
                )));
            }
            for (before, after) in raw.before.iter().zip(&raw.after) {
                let before = if context.include_before_image {
                    Some(named(table, before)?)
                } else {
                    None
                };
                events.push(change_event(table, raw.action, named(table, after)?, before, context));
            }
        }
    }
    Ok(events)
}

fn change_event(
    table: &TableDescriptor,
    action: ActionKind,
    columns: BTreeMap<String, CellValue>,
    before: Option<BTreeMap<String, CellValue>>,
    context: &EventContext<'_>,
) -> ChangeEvent {
    ChangeEvent {
        schema: table.schema.clone(),
        table: table.table.clone(),
        action,
        columns,
        before,
        position: context.position.clone(),
        gtid: context.gtid.map(str::to_string),
        timestamp: context.timestamp,
    }
}

/// 서수 → 이름. 이미지에 없는 컬럼(minimal row image)은 결과에도 없다.
fn named(table: &TableDescriptor, image: &RowImage) -> Result<BTreeMap<String, CellValue>> {
    let mut columns = BTreeMap::new();
    for (&ordinal, value) in image {
        if ordinal >= table.column_count() {
            return Err(CdcError::SchemaMismatch(format!(
                "row image of {} references column {} beyond {} columns",
                table.qualified_name(),
                ordinal,
                table.column_count()
            )));
        }
        columns.insert(table.column_name(ordinal).into_owned(), value.clone());
    }
    Ok(columns)
}
