//! MySQL 데이터베이스 연결 관리
//!
//! 복제 스트림과 별개로 쓰는 일반 SQL 연결. 현재 binlog 위치와
//! information_schema 컬럼 정보를 조회한다.

use crate::config::{duration_secs, optional_duration_secs};
use crate::error::{CdcError, Result};
use crate::gtid::GtidSet;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// MySQL 연결 설정
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// 핸드셰이크 문자셋
    pub charset: String,
    /// 복제 클라이언트로 등록할 서버 ID (소스 서버와 다른 값이어야 함)
    pub server_id: u32,
    #[serde(deserialize_with = "duration_secs")]
    pub timeout: Duration,
    /// 유휴 시 서버가 보내는 하트비트 주기
    #[serde(deserialize_with = "optional_duration_secs")]
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            charset: "utf8mb4".to_string(),
            server_id: 3,
            timeout: Duration::from_secs(30),
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("charset", &self.charset)
            .field("server_id", &self.server_id)
            .field("timeout", &self.timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .into()
    }
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn = tokio::time::timeout(config.timeout, Conn::new(config.build_opts()))
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!("Timed out connecting to {}", config.address()))
            })?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

        Ok(MySqlConnection { conn })
    }

    /// Binlog 상태 조회
    ///
    /// 8.2 이상은 SHOW BINARY LOG STATUS, 이전 버전은 SHOW MASTER STATUS
    pub async fn get_binlog_status(&mut self) -> Result<BinlogStatus> {
        let rows: Vec<Row> = match self.conn.query("SHOW BINARY LOG STATUS").await {
            Ok(rows) => rows,
            Err(e) => {
                debug!(error = %e, "SHOW BINARY LOG STATUS failed, falling back to SHOW MASTER STATUS");
                self.conn
                    .query("SHOW MASTER STATUS")
                    .await
                    .map_err(|e| CdcError::QueryError(format!("Failed to query binlog status: {}", e)))?
            }
        };

        let row = rows.into_iter().next().ok_or_else(|| {
            CdcError::QueryError("No binlog status available (is log_bin enabled?)".to_string())
        })?;

        let file: String = column(&row, 0)?
            .ok_or_else(|| CdcError::QueryError("Binlog status without file".to_string()))?;
        let position: u64 = column(&row, 1)?.unwrap_or(0);
        let executed_gtid_set: Option<String> = column(&row, 4)?;

        Ok(BinlogStatus {
            file,
            position,
            executed_gtid_set: match executed_gtid_set {
                Some(set) => GtidSet::parse(&set)?,
                None => GtidSet::new(),
            },
        })
    }

    /// GTID 모드 활성 여부 확인
    pub async fn is_gtid_mode_enabled(&mut self) -> Result<bool> {
        Ok(self
            .get_variable("gtid_mode")
            .await?
            .map(|mode| mode.eq_ignore_ascii_case("ON"))
            .unwrap_or(false))
    }

    /// 변수 조회
    pub async fn get_variable(&mut self, name: &str) -> Result<Option<String>> {
        let result: Vec<(String, String)> = self
            .conn
            .exec("SHOW GLOBAL VARIABLES LIKE ?", (name,))
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query {}: {}", name, e)))?;

        Ok(result.into_iter().next().map(|(_, v)| v))
    }

    /// Binlog 형식 확인 (ROW, STATEMENT, MIXED)
    pub async fn get_binlog_format(&mut self) -> Result<String> {
        self.get_variable("binlog_format")
            .await?
            .ok_or_else(|| CdcError::QueryError("Binlog format not found".to_string()))
    }

    /// 테이블 컬럼 정보 (서수 순)
    pub async fn get_table_columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let result: Vec<(String, String, String, String)> = self
            .conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (schema, table),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

        Ok(result
            .into_iter()
            .map(|(name, column_type, is_nullable, column_key)| ColumnInfo {
                name,
                column_type,
                nullable: is_nullable == "YES",
                primary_key: column_key == "PRI",
            })
            .collect())
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to disconnect: {}", e)))
    }
}

fn column<T: FromValue>(row: &Row, index: usize) -> Result<Option<T>> {
    match row.get_opt::<Option<T>, usize>(index) {
        None => Ok(None),
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(CdcError::QueryError(format!(
            "Unexpected value in column {}: {}",
            index, e
        ))),
    }
}

/// Binlog 상태
#[derive(Debug, Clone)]
pub struct BinlogStatus {
    pub file: String,
    pub position: u64,
    pub executed_gtid_set: GtidSet,
}

/// 테이블 컬럼 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// e.g. "int(10) unsigned", "enum('a','b')"
    pub column_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}
