//! MySQL CDC 엔진 - binlog 스트리밍 제어
//!
//! 상태 전이:
//!   Disconnected → Connecting → Streaming → {Reconnecting → Connecting, Stopping → Stopped}
//!
//! 프레임 하나를 끝까지 처리(디코딩, 변환, sink 전달)한 뒤 다음 프레임을 읽는다.
//! 재연결은 마지막 durable 위치에서 시작하므로 일부 이벤트는 다시 전달될 수 있다 (at-least-once).

use crate::binlog::{EventDecoder, UnsupportedTypePolicy};
use crate::binlog_client::Frame;
use crate::config::duration_millis;
use crate::connection::{ColumnInfo, ConnectionConfig};
use crate::error::{CdcError, Result, Severity};
use crate::events::*;
use crate::filter::StreamFilter;
use crate::gtid::GtidSet;
use crate::materializer::{materialize, EventContext};
use crate::offset::{PositionStore, ReplicationPosition, StartPosition};
use crate::source::{BinlogSource, MySqlConnector, SourceConnector};
use crate::table_map::TableRegistry;
use chrono::DateTime;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// CDC 엔진 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CdcConfig {
    pub connection: ConnectionConfig,
    /// 대상 스키마 (비어 있으면 전체)
    pub schemas: Vec<String>,
    /// 대상 테이블, `table` 또는 `schema.table` (비어 있으면 전체)
    pub tables: Vec<String>,
    pub actions: Vec<ActionKind>,
    pub start: StartPosition,
    /// false면 현재 binlog 끝에서 스트림 종료
    pub blocking: bool,
    pub reconnect: ReconnectPolicy,
    pub unsupported_types: UnsupportedTypePolicy,
    /// UPDATE 이벤트에 변경 전 값 포함
    pub include_before_image: bool,
    /// sink 채널 크기 (가득 차면 디코딩이 멈춘다)
    pub channel_capacity: usize,
    /// durable 위치가 이만큼 전진할 때마다 저장
    pub checkpoint_every: u64,
}

impl Default for CdcConfig {
    fn default() -> Self {
        CdcConfig {
            connection: ConnectionConfig::default(),
            schemas: Vec::new(),
            tables: Vec::new(),
            actions: ActionKind::ALL.to_vec(),
            start: StartPosition::Current,
            blocking: true,
            reconnect: ReconnectPolicy::default(),
            unsupported_types: UnsupportedTypePolicy::SkipTable,
            include_before_image: false,
            channel_capacity: 1024,
            checkpoint_every: 100,
        }
    }
}

impl CdcConfig {
    pub fn filter(&self) -> StreamFilter {
        StreamFilter::new(
            self.schemas.iter().cloned(),
            self.tables.iter().cloned(),
            self.actions.iter().copied(),
        )
    }
}

/// 재연결 백오프 (지수 증가, 상한 있음)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    #[serde(rename = "initial_backoff_ms", deserialize_with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", deserialize_with = "duration_millis")]
    pub max_backoff: Duration,
    /// 진전 없이 연속으로 실패할 수 있는 횟수. None 또는 0이면 무제한.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// n번째 연속 실패 후 대기 시간
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        matches!(self.max_attempts, Some(max) if max > 0 && failures >= max)
    }
}

/// 엔진 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Stopping,
    Stopped,
}

/// 관측 훅. 반환값이 없으며 제어 흐름에 영향을 주지 않는다.
pub trait EngineObserver: Send + Sync {
    fn on_state_change(&self, _state: EngineState) {}
    fn on_connect_error(&self, _error: &CdcError, _attempt: u32) {}
    fn on_session_error(&self, _error: &CdcError, _position: &ReplicationPosition) {}
    fn on_checkpoint(&self, _position: &ReplicationPosition) {}
}

struct NoopObserver;

impl EngineObserver for NoopObserver {}

#[derive(Debug)]
struct EngineShared {
    state: RwLock<EngineState>,
    position: RwLock<Option<ReplicationPosition>>,
}

/// 실행 중인 엔진 제어용 핸들
#[derive(Debug, Clone)]
pub struct EngineHandle {
    stop: Arc<watch::Sender<bool>>,
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    /// 진행 중인 프레임을 마치고 종료하도록 요청
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// 마지막 durable 위치 (재시작 지점)
    pub fn position(&self) -> Option<ReplicationPosition> {
        self.shared.position.read().clone()
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.read()
    }
}

enum SessionEnd {
    Stopped,
    EndOfStream,
}

/// MySQL CDC 엔진
pub struct CdcEngine<C: SourceConnector = MySqlConnector> {
    config: Arc<CdcConfig>,
    connector: C,
    store: Option<Arc<dyn PositionStore>>,
    observer: Arc<dyn EngineObserver>,
    shared: Arc<EngineShared>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl CdcEngine<MySqlConnector> {
    /// 새 CDC 엔진 생성
    pub fn new(config: CdcConfig) -> Self {
        let connector = MySqlConnector::new(config.connection.clone(), config.blocking);
        CdcEngine::with_connector(config, connector)
    }
}

impl<C: SourceConnector> CdcEngine<C> {
    pub fn with_connector(config: CdcConfig, connector: C) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        CdcEngine {
            config: Arc::new(config),
            connector,
            store: None,
            observer: Arc::new(NoopObserver),
            shared: Arc::new(EngineShared {
                state: RwLock::new(EngineState::Disconnected),
                position: RwLock::new(None),
            }),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    /// 위치 저장소. 저장된 위치가 있으면 설정의 시작 위치보다 우선한다.
    pub fn with_store(mut self, store: Arc<dyn PositionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &CdcConfig {
        &self.config
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            stop: Arc::clone(&self.stop_tx),
            shared: Arc::clone(&self.shared),
        }
    }

    /// stop 요청, 스트림 끝, 치명적 에러 중 하나가 올 때까지 실행.
    /// 마지막 durable 위치를 반환한다.
    pub async fn run(self, sink: mpsc::Sender<ChangeEvent>) -> Result<ReplicationPosition> {
        let mut durable = match self.initial_position() {
            Ok(position) => position,
            Err(e) => {
                self.set_state(EngineState::Stopped);
                return Err(e);
            }
        };
        let filter = Arc::new(self.config.filter());
        let mut stop = self.stop_rx.clone();
        let mut failures = 0u32;

        info!(
            start = %durable.as_ref().map(|p| p.to_string()).unwrap_or_else(|| "current".to_string()),
            "Starting CDC Engine"
        );

        let outcome = loop {
            let stopping = *stop.borrow();
            if stopping {
                break Ok(());
            }
            self.set_state(EngineState::Connecting);

            let opened = tokio::select! {
                _ = wait_for_stop(&mut stop) => break Ok(()),
                opened = self.open_session(durable.as_ref()) => opened,
            };
            let (mut source, start) = match opened {
                Ok(opened) => opened,
                Err(e) => {
                    failures += 1;
                    self.observer.on_connect_error(&e, failures);
                    if e.severity() == Severity::Fatal {
                        break Err(e);
                    }
                    if self.config.reconnect.exhausted(failures) {
                        break Err(CdcError::StartupError {
                            attempts: failures,
                            source: Box::new(e),
                        });
                    }
                    warn!(attempt = failures, kind = e.kind(), "Failed to open replication session: {}", e);
                    self.set_state(EngineState::Reconnecting);
                    if self.backoff(failures, &mut stop).await {
                        break Ok(());
                    }
                    continue;
                }
            };

            self.publish_position(&start);
            durable = Some(start.clone());

            let mut session = match Session::new(&self, Arc::clone(&filter), start) {
                Ok(session) => session,
                Err(e) => {
                    close_source(source).await;
                    break Err(e);
                }
            };
            self.set_state(EngineState::Streaming);
            let result = session.stream(&mut source, &sink, &mut stop).await;
            close_source(source).await;

            let position = session.durable.clone();
            if session.progressed {
                failures = 0;
            }
            durable = Some(position.clone());

            match result {
                Ok(SessionEnd::Stopped) => break Ok(()),
                Ok(SessionEnd::EndOfStream) => {
                    info!(position = %position, "Reached end of binlog stream");
                    break Ok(());
                }
                Err(CdcError::ChannelClosed) => {
                    info!(position = %position, "Change event receiver dropped, stopping");
                    break Ok(());
                }
                Err(e) => {
                    self.observer.on_session_error(&e, &position);
                    match e.severity() {
                        Severity::Fatal => {
                            error!(position = %position, kind = e.kind(), "Stopping on fatal error: {}", e);
                            break Err(e);
                        }
                        Severity::Transient | Severity::Session => {
                            failures += 1;
                            warn!(
                                position = %position,
                                kind = e.kind(),
                                attempt = failures,
                                "Replication session failed, reconnecting: {}",
                                e
                            );
                            if self.config.reconnect.exhausted(failures) {
                                break Err(CdcError::StartupError {
                                    attempts: failures,
                                    source: Box::new(e),
                                });
                            }
                            self.set_state(EngineState::Reconnecting);
                            if self.backoff(failures, &mut stop).await {
                                break Ok(());
                            }
                        }
                    }
                }
            }
        };

        self.set_state(EngineState::Stopping);
        if let Some(position) = &durable {
            self.checkpoint(position);
        }
        self.set_state(EngineState::Stopped);
        info!("CDC Engine stopped");

        outcome.map(|_| durable.unwrap_or_default())
    }

    fn initial_position(&self) -> Result<Option<ReplicationPosition>> {
        if let Some(store) = &self.store {
            if let Some(position) = store.load()? {
                info!(position = %position, "Resuming from stored position");
                return Ok(Some(position));
            }
        }
        Ok(self.config.start.resolve_static())
    }

    async fn open_session(
        &self,
        durable: Option<&ReplicationPosition>,
    ) -> Result<(C::Source, ReplicationPosition)> {
        let start = match durable {
            Some(position) => position.clone(),
            None => self.connector.current_position().await?,
        };
        debug!(position = %start, "Opening replication session");
        let source = self.connector.open(&start).await?;
        Ok((source, start))
    }

    /// 대기 중 stop 요청이 오면 true
    async fn backoff(&self, attempt: u32, stop: &mut watch::Receiver<bool>) -> bool {
        let delay = self.config.reconnect.delay(attempt);
        debug!(?delay, attempt, "Backing off before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = wait_for_stop(stop) => true,
        }
    }

    fn set_state(&self, state: EngineState) {
        let previous = std::mem::replace(&mut *self.shared.state.write(), state);
        if previous != state {
            debug!(?previous, ?state, "Engine state changed");
            self.observer.on_state_change(state);
        }
    }

    fn publish_position(&self, position: &ReplicationPosition) {
        *self.shared.position.write() = Some(position.clone());
    }

    fn checkpoint(&self, position: &ReplicationPosition) {
        let Some(store) = &self.store else {
            return;
        };
        match store.save(position) {
            Ok(()) => self.observer.on_checkpoint(position),
            Err(e) => error!(position = %position, "Failed to save position: {}", e),
        }
    }
}

impl<C> CdcEngine<C>
where
    C: SourceConnector + 'static,
    C::Source: 'static,
{
    /// 설정 크기의 채널을 만들고 백그라운드 태스크로 실행
    pub fn spawn(
        self,
    ) -> (
        EngineHandle,
        mpsc::Receiver<ChangeEvent>,
        JoinHandle<Result<ReplicationPosition>>,
    ) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let handle = self.handle();
        let task = tokio::spawn(self.run(tx));
        (handle, rx, task)
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    let requested = stop.wait_for(|&stopped| stopped).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

async fn close_source<S: BinlogSource>(source: S) {
    if let Err(e) = source.close().await {
        debug!("Failed to close replication session: {}", e);
    }
}

/// 연결 하나 동안의 디코딩 상태. 재연결마다 새로 만든다.
struct Session<'a, C: SourceConnector> {
    engine: &'a CdcEngine<C>,
    filter: Arc<StreamFilter>,
    decoder: EventDecoder,
    registry: TableRegistry,
    /// (schema, table) → information_schema 컬럼, 조회 실패는 None
    catalog: HashMap<(String, String), Option<Vec<ColumnInfo>>>,
    position: ReplicationPosition,
    durable: ReplicationPosition,
    /// GTID 모드에서만 Some
    gtid_set: Option<GtidSet>,
    transaction_gtid: Option<String>,
    /// TABLE_MAP 이후 문장 끝 행 이벤트를 아직 못 봄
    in_statement: bool,
    /// BEGIN 이후 XID/COMMIT을 아직 못 봄
    in_transaction: bool,
    progressed: bool,
    since_checkpoint: u64,
}

impl<'a, C: SourceConnector> Session<'a, C> {
    fn new(engine: &'a CdcEngine<C>, filter: Arc<StreamFilter>, start: ReplicationPosition) -> Result<Self> {
        let gtid_set = start.gtid.as_deref().map(GtidSet::parse).transpose()?;
        Ok(Session {
            engine,
            decoder: EventDecoder::new(Arc::clone(&filter), engine.config.unsupported_types),
            filter,
            registry: TableRegistry::new(),
            catalog: HashMap::new(),
            position: start.clone(),
            durable: start,
            gtid_set,
            transaction_gtid: None,
            in_statement: false,
            in_transaction: false,
            progressed: false,
            since_checkpoint: 0,
        })
    }

    /// 프레임 단위로 디코딩해 sink로 보낸다.
    ///
    /// sink가 가득 찬 동안 stop이 오면 프레임의 나머지 이벤트는 버린다.
    /// 그 프레임은 durable 위치에 반영되지 않았으므로 재시작 시 처음부터 다시 전달된다.
    async fn stream(
        &mut self,
        source: &mut C::Source,
        sink: &mpsc::Sender<ChangeEvent>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = wait_for_stop(stop) => return Ok(SessionEnd::Stopped),
                frame = source.next_frame() => frame?,
            };
            let data = match frame {
                Frame::Event(data) => data,
                Frame::EndOfStream => return Ok(SessionEnd::EndOfStream),
            };

            let events = self.process(&data, source).await?;
            for event in events {
                tokio::select! {
                    biased;
                    sent = sink.send(event) => sent.map_err(|_| CdcError::ChannelClosed)?,
                    _ = wait_for_stop(stop) => return Ok(SessionEnd::Stopped),
                }
            }
            self.finish_frame();
        }
    }

    /// 프레임 하나 디코딩 후 내보낼 변경 이벤트 반환
    async fn process(&mut self, data: &[u8], source: &mut C::Source) -> Result<Vec<ChangeEvent>> {
        let DecodedFrame { header, event } = self.decoder.decode(data, &mut self.registry)?;
        if !matches!(event, DecodedEvent::Rotate(_)) && header.next_pos > 0 {
            self.position.advance(header.next_pos as u64);
        }

        let mut events = Vec::new();
        match event {
            DecodedEvent::Rotate(rotate) => {
                debug!(
                    file = %rotate.next_binlog_name,
                    position = rotate.position,
                    artificial = header.is_artificial(),
                    "Rotate"
                );
                self.position.rotate(rotate.next_binlog_name, rotate.position);
            }
            DecodedEvent::TableMap { table_id } => {
                self.in_statement = true;
                self.resolve_column_names(table_id, source).await?;
            }
            DecodedEvent::RowMutation(raw) => {
                let table = self.registry.lookup(raw.table_id)?;
                let position = EventPosition {
                    file: self.position.file.clone(),
                    offset: self.position.offset,
                };
                let context = EventContext {
                    position: &position,
                    gtid: self.transaction_gtid.as_deref(),
                    timestamp: DateTime::from_timestamp(header.timestamp as i64, 0).unwrap_or_default(),
                    include_before_image: self.engine.config.include_before_image,
                };
                events = materialize(&raw, table, &context)?;
                if raw.statement_end {
                    self.in_statement = false;
                }
            }
            DecodedEvent::SkippedRows {
                table_id,
                action,
                statement_end,
                reason,
            } => {
                trace!(table_id, action = %action, ?reason, "Rows skipped");
                if statement_end {
                    self.in_statement = false;
                }
            }
            DecodedEvent::Gtid(gtid) => self.transaction_gtid = Some(gtid),
            DecodedEvent::Xid(_) => self.commit_transaction()?,
            DecodedEvent::Query(query) => {
                if query.is_begin() {
                    self.in_transaction = true;
                } else if query.is_commit() {
                    self.commit_transaction()?;
                } else {
                    debug!(schema = %query.schema, "Statement event, invalidating column cache");
                    self.catalog.clear();
                    // DDL은 BEGIN/XID 없이 GTID 트랜잭션 하나를 이룬다
                    if !self.in_transaction {
                        self.commit_transaction()?;
                    }
                }
            }
            DecodedEvent::FormatDescription(_) | DecodedEvent::Heartbeat | DecodedEvent::Unknown(_) => {}
        }
        Ok(events)
    }

    /// 테이블 맵에 컬럼 이름이 없으면 소스에 물어본다 (세션 동안 캐시)
    async fn resolve_column_names(&mut self, table_id: u64, source: &mut C::Source) -> Result<()> {
        let table = self.registry.lookup(table_id)?;
        if table.has_column_names() || !self.filter.includes_table(&table.schema, &table.table) {
            return Ok(());
        }

        let key = (table.schema.clone(), table.table.clone());
        if !self.catalog.contains_key(&key) {
            let columns = match source.table_columns(&key.0, &key.1).await {
                Ok(columns) => Some(columns),
                Err(e) => {
                    warn!(
                        schema = %key.0,
                        table = %key.1,
                        "Column lookup failed, using positional names: {}",
                        e
                    );
                    None
                }
            };
            self.catalog.insert(key.clone(), columns);
        }

        if let Some(Some(columns)) = self.catalog.get(&key) {
            let table = self.registry.lookup_mut(table_id)?;
            if !table.apply_column_info(columns) {
                warn!(
                    table = %table.qualified_name(),
                    binlog_columns = table.column_count(),
                    catalog_columns = columns.len(),
                    "Column count differs from information_schema, using positional names"
                );
            }
        }
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        if let (Some(set), Some(gtid)) = (self.gtid_set.as_mut(), self.transaction_gtid.as_deref()) {
            set.add_gtid(gtid)?;
            self.position.gtid = Some(set.to_string());
        }
        self.transaction_gtid = None;
        self.in_statement = false;
        self.in_transaction = false;
        Ok(())
    }

    /// 문장 경계에서만 durable 위치 갱신
    fn finish_frame(&mut self) {
        if self.in_statement || self.position == self.durable {
            return;
        }
        self.durable = self.position.clone();
        self.progressed = true;
        self.engine.publish_position(&self.durable);

        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.engine.config.checkpoint_every.max(1) {
            self.engine.checkpoint(&self.durable);
            self.since_checkpoint = 0;
        }
    }
}
