//! CDC 관련 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("연결이 끊어졌습니다: {0}")]
    ConnectionLost(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("잘못된 binlog 프레임: {0}")]
    MalformedFrame(String),

    #[error("알 수 없는 테이블 ID: {table_id} (선행 TABLE_MAP 이벤트 없음)")]
    UnknownTable { table_id: u64 },

    #[error("지원하지 않는 컬럼 타입 {type_code}: {schema}.{table} 컬럼 #{column}")]
    UnsupportedType {
        schema: String,
        table: String,
        column: usize,
        type_code: u8,
    },

    #[error("스키마 불일치: {0}")]
    SchemaMismatch(String),

    #[error("시작 실패 ({attempts}회 시도): {source}")]
    StartupError {
        attempts: u32,
        #[source]
        source: Box<CdcError>,
    },

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("채널이 닫혔습니다")]
    ChannelClosed,
}

/// 에러 발생 시 스트림 컨트롤러가 취할 조치
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// 백오프 후 재연결
    Transient,
    /// 현재 세션 종료, 마지막 durable 위치에서 재연결
    Session,
    /// 엔진 종료
    Fatal,
}

impl CdcError {
    pub fn severity(&self) -> Severity {
        match self {
            CdcError::ConnectionError(_)
            | CdcError::ConnectionLost(_)
            | CdcError::IoError(_)
            | CdcError::ProtocolError(_)
            | CdcError::QueryError(_) => Severity::Transient,
            CdcError::MalformedFrame(_)
            | CdcError::UnknownTable { .. }
            | CdcError::SchemaMismatch(_) => Severity::Session,
            CdcError::UnsupportedType { .. }
            | CdcError::StartupError { .. }
            | CdcError::GtidError(_)
            | CdcError::ConfigError(_)
            | CdcError::SerializationError(_)
            | CdcError::ChannelClosed => Severity::Fatal,
        }
    }

    /// 로그/훅에서 사용하는 짧은 에러 종류명
    pub fn kind(&self) -> &'static str {
        match self {
            CdcError::ConnectionError(_) => "connection",
            CdcError::ConnectionLost(_) => "connection_lost",
            CdcError::ProtocolError(_) => "protocol",
            CdcError::MalformedFrame(_) => "malformed_frame",
            CdcError::UnknownTable { .. } => "unknown_table",
            CdcError::UnsupportedType { .. } => "unsupported_type",
            CdcError::SchemaMismatch(_) => "schema_mismatch",
            CdcError::StartupError { .. } => "startup",
            CdcError::GtidError(_) => "gtid",
            CdcError::QueryError(_) => "query",
            CdcError::IoError(_) => "io",
            CdcError::ConfigError(_) => "config",
            CdcError::SerializationError(_) => "serialization",
            CdcError::ChannelClosed => "channel_closed",
        }
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => CdcError::ConnectionLost(err.to_string()),
            _ => CdcError::IoError(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            CdcError::ConnectionLost("eof".into()).severity(),
            Severity::Transient
        );
        assert_eq!(
            CdcError::UnknownTable { table_id: 7 }.severity(),
            Severity::Session
        );
        assert_eq!(
            CdcError::SchemaMismatch("x".into()).severity(),
            Severity::Session
        );
        assert_eq!(CdcError::ChannelClosed.severity(), Severity::Fatal);
    }

    #[test]
    fn test_io_error_eof_is_connection_lost() {
        let err: CdcError = io::Error::new(io::ErrorKind::UnexpectedEof, "closed").into();
        assert!(matches!(err, CdcError::ConnectionLost(_)));
        assert_eq!(err.kind(), "connection_lost");
    }
}
