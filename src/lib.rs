//! MySQL Binlog CDC (Change Data Capture) 핵심 구현
//!
//! 이 라이브러리는 복제 클라이언트로 MySQL 바이너리 로그를 받아 행 단위 변경 이벤트로 바꿉니다.
//! 주요 기능:
//! - 복제 프로토콜 (핸드셰이크, 복제 등록, binlog 덤프)
//! - Binlog 이벤트 및 컬럼 값 디코딩
//! - 테이블 맵 추적과 컬럼 이름 매핑
//! - 재연결 및 위치 저장 (at-least-once)

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod cdc_engine;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod filter;
pub mod gtid;
pub mod json;
pub mod materializer;
pub mod offset;
pub mod protocol;
pub mod reader;
pub mod source;
pub mod table_map;
pub mod value;

#[cfg(test)]
mod test_support;

pub use binlog_client::BinlogClient;
pub use cdc_engine::{CdcConfig, CdcEngine, EngineHandle, EngineObserver, EngineState, ReconnectPolicy};
pub use connection::ConnectionConfig;
pub use error::{CdcError, Result};
pub use events::{ActionKind, CellValue, ChangeEvent};
pub use filter::StreamFilter;
pub use gtid::GtidSet;
pub use offset::{FilePositionStore, PositionStore, ReplicationPosition, StartPosition};
pub use source::MySqlConnector;
