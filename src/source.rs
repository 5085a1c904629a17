//! 복제 소스 추상화
//!
//! 스트림 컨트롤러는 소스를 트레이트로만 다룬다. MySQL 구현은
//! 복제 연결(`BinlogClient`)과 메타데이터 조회용 SQL 연결(`MySqlConnection`)을 묶는다.

use crate::binlog_client::{BinlogClient, Frame};
use crate::connection::{ColumnInfo, ConnectionConfig, MySqlConnection};
use crate::error::Result;
use crate::offset::ReplicationPosition;
use std::future::Future;
use tracing::{debug, info, warn};

/// 열린 복제 세션 하나
pub trait BinlogSource: Send {
    /// 다음 이벤트 프레임. 연결이 끊기면 `ConnectionLost`.
    fn next_frame(&mut self) -> impl Future<Output = Result<Frame>> + Send;

    /// 테이블 컬럼 정보 (서수 순)
    fn table_columns(
        &mut self,
        schema: &str,
        table: &str,
    ) -> impl Future<Output = Result<Vec<ColumnInfo>>> + Send;

    fn close(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized;
}

/// 세션을 여는 쪽. 재연결마다 `open`이 다시 호출된다.
pub trait SourceConnector: Send + Sync {
    type Source: BinlogSource;

    /// 서버의 현재 binlog 위치 (GTID 모드면 실행된 GTID 집합 포함)
    fn current_position(&self) -> impl Future<Output = Result<ReplicationPosition>> + Send;

    /// 접속, 인증, 복제 등록 후 덤프 시작
    fn open(
        &self,
        position: &ReplicationPosition,
    ) -> impl Future<Output = Result<Self::Source>> + Send;
}

/// MySQL 서버 커넥터
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    config: ConnectionConfig,
    blocking: bool,
}

impl MySqlConnector {
    pub fn new(config: ConnectionConfig, blocking: bool) -> Self {
        MySqlConnector { config, blocking }
    }
}

impl SourceConnector for MySqlConnector {
    type Source = MySqlBinlogSource;

    async fn current_position(&self) -> Result<ReplicationPosition> {
        let mut conn = MySqlConnection::connect(&self.config).await?;
        let result: Result<ReplicationPosition> = async {
            match conn.get_binlog_format().await {
                Ok(format) if !format.eq_ignore_ascii_case("ROW") => {
                    warn!(binlog_format = %format, "binlog_format is not ROW; row events will be missing");
                }
                Ok(_) => {}
                Err(e) => debug!("Could not read binlog_format: {}", e),
            }

            let status = conn.get_binlog_status().await?;
            let mut position = ReplicationPosition::new(status.file, status.position);
            if conn.is_gtid_mode_enabled().await? && !status.executed_gtid_set.is_empty() {
                position = position.with_gtid(status.executed_gtid_set.to_string());
            }
            Ok(position)
        }
        .await;

        if let Err(e) = conn.close().await {
            debug!("Failed to close status connection: {}", e);
        }
        result
    }

    async fn open(&self, position: &ReplicationPosition) -> Result<MySqlBinlogSource> {
        let mut client = BinlogClient::connect(&self.config).await?;
        client
            .register_as_replica(self.config.server_id, position, self.blocking)
            .await?;
        info!(
            server_id = self.config.server_id,
            position = %position,
            "Registered as replica"
        );

        Ok(MySqlBinlogSource {
            client,
            config: self.config.clone(),
            metadata: None,
        })
    }
}

/// MySQL 복제 세션
pub struct MySqlBinlogSource {
    client: BinlogClient,
    config: ConnectionConfig,
    /// 컬럼 이름이 필요할 때 연다
    metadata: Option<MySqlConnection>,
}

impl BinlogSource for MySqlBinlogSource {
    fn next_frame(&mut self) -> impl Future<Output = Result<Frame>> + Send {
        self.client.next_frame()
    }

    async fn table_columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        if self.metadata.is_none() {
            self.metadata = Some(MySqlConnection::connect(&self.config).await?);
        }
        match self.metadata.as_mut() {
            Some(conn) => {
                let result = conn.get_table_columns(schema, table).await;
                if result.is_err() {
                    // 다음 조회 때 다시 연결
                    self.metadata = None;
                }
                result
            }
            None => Ok(Vec::new()),
        }
    }

    async fn close(self) -> Result<()> {
        if let Some(conn) = self.metadata {
            if let Err(e) = conn.close().await {
                debug!("Failed to close metadata connection: {}", e);
            }
        }
        self.client.close().await
    }
}
