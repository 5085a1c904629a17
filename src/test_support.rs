//! 테스트용 binlog 프레임 생성기와 스크립트 소스

use crate::binlog_client::Frame;
use crate::connection::ColumnInfo;
use crate::error::{CdcError, Result};
use crate::events::{ActionKind, EventHeader};
use crate::offset::ReplicationPosition;
use crate::source::{BinlogSource, SourceConnector};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

const SERVER_VERSION: &str = "8.0.36-log";
const TIMESTAMP: u32 = 1_700_000_000;

/// 테스트 컬럼 정의 (타입 코드 + 테이블 맵 메타데이터 바이트)
#[derive(Debug, Clone)]
pub struct TestColumn {
    pub name: String,
    pub type_code: u8,
    pub meta: Vec<u8>,
    pub nullable: bool,
}

impl TestColumn {
    pub fn new(name: &str, type_code: u8, meta: &[u8]) -> Self {
        TestColumn {
            name: name.to_string(),
            type_code,
            meta: meta.to_vec(),
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

pub fn long_column() -> TestColumn {
    TestColumn::new("id", 3, &[])
}

pub fn varchar_column(name: &str, max_length: u16) -> TestColumn {
    TestColumn::new(name, 15, &max_length.to_le_bytes()).nullable()
}

/// `orders (id INT NOT NULL, status VARCHAR(64) NULL)`
pub fn orders_columns() -> Vec<TestColumn> {
    vec![long_column(), varchar_column("status", 64)]
}

pub fn int_value(value: i32) -> Option<Vec<u8>> {
    Some(value.to_le_bytes().to_vec())
}

pub fn varchar_value(value: &str) -> Option<Vec<u8>> {
    let mut data = vec![value.len() as u8];
    data.extend_from_slice(value.as_bytes());
    Some(data)
}

/// 연속된 binlog 이벤트를 위치까지 맞춰 만든다
#[derive(Debug, Clone)]
pub struct BinlogBuilder {
    checksum: bool,
    position: u32,
    file: String,
}

impl BinlogBuilder {
    pub fn new(checksum: bool) -> Self {
        BinlogBuilder {
            checksum,
            position: 4,
            file: "mysql-bin.000001".to_string(),
        }
    }

    /// 다음 이벤트가 기록될 위치
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    pub fn replication_position(&self) -> ReplicationPosition {
        ReplicationPosition::new(self.file.clone(), self.position())
    }

    fn event(&mut self, type_code: u8, flags: u16, body: &[u8], advance: bool) -> Vec<u8> {
        let checksum_len = if self.checksum { 4 } else { 0 };
        let length = (EventHeader::SIZE + body.len() + checksum_len) as u32;
        let next_pos = if advance {
            self.position += length;
            self.position
        } else {
            0
        };

        let mut frame = Vec::with_capacity(length as usize);
        frame.extend_from_slice(&TIMESTAMP.to_le_bytes());
        frame.push(type_code);
        frame.extend_from_slice(&1u32.to_le_bytes());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&next_pos.to_le_bytes());
        frame.extend_from_slice(&flags.to_le_bytes());
        frame.extend_from_slice(body);
        if self.checksum {
            let crc = crc32fast::hash(&frame);
            frame.extend_from_slice(&crc.to_le_bytes());
        }
        frame
    }

    /// 덤프 시작 시 서버가 보내는 가짜 ROTATE
    pub fn fake_rotate(&mut self, file: &str, position: u64) -> Vec<u8> {
        self.file = file.to_string();
        self.position = position as u32;
        let mut body = position.to_le_bytes().to_vec();
        body.extend_from_slice(file.as_bytes());
        self.event(4, EventHeader::ARTIFICIAL_FLAG, &body, false)
    }

    /// 파일 끝의 실제 ROTATE
    pub fn rotate(&mut self, file: &str) -> Vec<u8> {
        let mut body = 4u64.to_le_bytes().to_vec();
        body.extend_from_slice(file.as_bytes());
        let frame = self.event(4, 0, &body, true);
        self.file = file.to_string();
        self.position = 4;
        frame
    }

    /// 파일 처음(4)이면 실제 이벤트, 아니면 위치 0인 재전송 FDE
    pub fn format_description(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&4u16.to_le_bytes());
        let mut version = [0u8; 50];
        version[..SERVER_VERSION.len()].copy_from_slice(SERVER_VERSION.as_bytes());
        body.extend_from_slice(&version);
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(EventHeader::SIZE as u8);

        let mut post_header_lengths = [0u8; 40];
        post_header_lengths[1] = 13; // QUERY
        post_header_lengths[3] = 8; // ROTATE
        post_header_lengths[15] = 8; // XID
        post_header_lengths[18] = 8; // TABLE_MAP
        for index in 22..=24 {
            post_header_lengths[index] = 8;
        }
        for index in 29..=31 {
            post_header_lengths[index] = 10;
        }
        post_header_lengths[32] = 42; // GTID
        body.extend_from_slice(&post_header_lengths);

        body.push(if self.checksum { 1 } else { 0 });
        if !self.checksum {
            body.extend_from_slice(&[0u8; 4]);
        }
        let advance = self.position == 4;
        self.event(15, 0, &body, advance)
    }

    pub fn table_map(
        &mut self,
        table_id: u64,
        schema: &str,
        table: &str,
        columns: &[TestColumn],
        with_names: bool,
    ) -> Vec<u8> {
        let mut body = table_id.to_le_bytes()[..6].to_vec();
        body.extend_from_slice(&1u16.to_le_bytes());
        body.push(schema.len() as u8);
        body.extend_from_slice(schema.as_bytes());
        body.push(0);
        body.push(table.len() as u8);
        body.extend_from_slice(table.as_bytes());
        body.push(0);

        body.push(columns.len() as u8);
        body.extend(columns.iter().map(|c| c.type_code));
        let metadata: Vec<u8> = columns.iter().flat_map(|c| c.meta.iter().copied()).collect();
        body.push(metadata.len() as u8);
        body.extend_from_slice(&metadata);
        body.extend_from_slice(&bitmap(columns.len(), |i| columns[i].nullable));

        if with_names {
            let mut names = Vec::new();
            for column in columns {
                names.push(column.name.len() as u8);
                names.extend_from_slice(column.name.as_bytes());
            }
            body.push(4);
            body.push(names.len() as u8);
            body.extend_from_slice(&names);
        }
        self.event(19, 0, &body, true)
    }

    /// v2 행 이벤트. UPDATE는 이미지가 (before, after) 순서로 번갈아 온다.
    pub fn rows(
        &mut self,
        action: ActionKind,
        table_id: u64,
        images: &[Vec<Option<Vec<u8>>>],
        statement_end: bool,
    ) -> Vec<u8> {
        let type_code = match action {
            ActionKind::Insert => 30,
            ActionKind::Update => 31,
            ActionKind::Delete => 32,
        };
        let mut body = table_id.to_le_bytes()[..6].to_vec();
        body.extend_from_slice(&(statement_end as u16).to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(&rows_body(action, images));
        self.event(type_code, 0, &body, true)
    }

    /// v1 행 이벤트 (extra data 없음, 항상 문장 끝)
    pub fn rows_v1(&mut self, action: ActionKind, table_id: u64, images: &[Vec<Option<Vec<u8>>>]) -> Vec<u8> {
        let type_code = match action {
            ActionKind::Insert => 23,
            ActionKind::Update => 24,
            ActionKind::Delete => 25,
        };
        let mut body = table_id.to_le_bytes()[..6].to_vec();
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&rows_body(action, images));
        self.event(type_code, 0, &body, true)
    }

    pub fn xid(&mut self, xid: u64) -> Vec<u8> {
        self.event(16, 0, &xid.to_le_bytes(), true)
    }

    pub fn gtid(&mut self, sid: Uuid, gno: u64) -> Vec<u8> {
        let mut body = vec![1u8];
        body.extend_from_slice(sid.as_bytes());
        body.extend_from_slice(&gno.to_le_bytes());
        body.push(2);
        body.extend_from_slice(&0i64.to_le_bytes());
        body.extend_from_slice(&1i64.to_le_bytes());
        self.event(33, 0, &body, true)
    }

    pub fn query(&mut self, schema: &str, query: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(schema.len() as u8);
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(schema.as_bytes());
        body.push(0);
        body.extend_from_slice(query.as_bytes());
        self.event(2, 0, &body, true)
    }

    pub fn heartbeat(&mut self) -> Vec<u8> {
        let file = self.file.clone();
        self.event(27, EventHeader::ARTIFICIAL_FLAG, file.as_bytes(), false)
    }
}

fn bitmap(len: usize, is_set: impl Fn(usize) -> bool) -> Vec<u8> {
    let mut bits = vec![0u8; len.div_ceil(8)];
    for index in (0..len).filter(|&i| is_set(i)) {
        bits[index / 8] |= 1 << (index % 8);
    }
    bits
}

fn rows_body(action: ActionKind, images: &[Vec<Option<Vec<u8>>>]) -> Vec<u8> {
    let column_count = images.first().map(Vec::len).unwrap_or(0);
    let mut body = vec![column_count as u8];
    let present = bitmap(column_count, |_| true);
    body.extend_from_slice(&present);
    if action == ActionKind::Update {
        body.extend_from_slice(&present);
    }
    for image in images {
        body.extend_from_slice(&bitmap(image.len(), |i| image[i].is_none()));
        for value in image.iter().flatten() {
            body.extend_from_slice(value);
        }
    }
    body
}

/// 스크립트 세션의 한 단계
#[derive(Debug)]
pub enum Step {
    Frame(Vec<u8>),
    Fail(CdcError),
    End,
    /// 유휴 서버처럼 다음 프레임을 영원히 기다림
    Hang,
}

#[derive(Debug, Default)]
struct ScriptState {
    sessions: VecDeque<std::result::Result<Vec<Step>, CdcError>>,
    current: ReplicationPosition,
    opened: Vec<ReplicationPosition>,
    columns: HashMap<(String, String), Vec<ColumnInfo>>,
    column_requests: usize,
    closed: usize,
}

/// 미리 정한 세션들을 차례로 돌려주는 커넥터
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedConnector {
    pub fn new(current: ReplicationPosition) -> Self {
        let connector = ScriptedConnector::default();
        connector.state.lock().current = current;
        connector
    }

    pub fn session(self, steps: Vec<Step>) -> Self {
        self.state.lock().sessions.push_back(Ok(steps));
        self
    }

    /// 다음 접속 시도를 실패시킨다
    pub fn refuse(self, error: CdcError) -> Self {
        self.state.lock().sessions.push_back(Err(error));
        self
    }

    pub fn with_columns(self, schema: &str, table: &str, columns: Vec<ColumnInfo>) -> Self {
        self.state
            .lock()
            .columns
            .insert((schema.to_string(), table.to_string()), columns);
        self
    }

    /// 세션을 연 위치 목록
    pub fn opened(&self) -> Vec<ReplicationPosition> {
        self.state.lock().opened.clone()
    }

    pub fn column_requests(&self) -> usize {
        self.state.lock().column_requests
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }
}

impl SourceConnector for ScriptedConnector {
    type Source = ScriptedSource;

    async fn current_position(&self) -> Result<ReplicationPosition> {
        Ok(self.state.lock().current.clone())
    }

    async fn open(&self, position: &ReplicationPosition) -> Result<ScriptedSource> {
        let mut state = self.state.lock();
        state.opened.push(position.clone());
        let steps = state.sessions.pop_front().unwrap_or_else(|| Ok(vec![Step::Hang]))?;
        Ok(ScriptedSource {
            steps: steps.into(),
            state: Arc::clone(&self.state),
        })
    }
}

pub struct ScriptedSource {
    steps: VecDeque<Step>,
    state: Arc<Mutex<ScriptState>>,
}

impl BinlogSource for ScriptedSource {
    async fn next_frame(&mut self) -> Result<Frame> {
        match self.steps.pop_front() {
            Some(Step::Frame(frame)) => Ok(Frame::Event(Bytes::from(frame))),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::End) => Ok(Frame::EndOfStream),
            Some(Step::Hang) | None => std::future::pending().await,
        }
    }

    async fn table_columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut state = self.state.lock();
        state.column_requests += 1;
        state
            .columns
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .ok_or_else(|| CdcError::QueryError(format!("no columns scripted for {}.{}", schema, table)))
    }

    async fn close(self) -> Result<()> {
        self.state.lock().closed += 1;
        Ok(())
    }
}

pub fn column_info(name: &str, column_type: &str) -> ColumnInfo {
    ColumnInfo {
        name: name.to_string(),
        column_type: column_type.to_string(),
        nullable: true,
        primary_key: false,
    }
}
