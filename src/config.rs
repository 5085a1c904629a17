//! 설정 파일 로딩
//!
//! `CdcConfig`는 TOML 파일에서 읽는다. 시간 값은 정수(초 또는 밀리초)로 적는다.
//!
//! ```toml
//! schemas = ["shop"]
//! actions = ["insert", "update", "delete"]
//! start = "current"
//!
//! [connection]
//! hostname = "127.0.0.1"
//! username = "repl"
//! server_id = 1001
//! ```

use crate::cdc_engine::CdcConfig;
use crate::error::{CdcError, Result};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

impl CdcConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CdcConfig = toml::from_str(content)
            .map_err(|e| CdcError::ConfigError(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CdcError::ConfigError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// 실행 전에 걸러야 하는 값 검사
    pub fn validate(&self) -> Result<()> {
        if self.connection.server_id == 0 {
            return Err(CdcError::ConfigError(
                "server_id must be non-zero for a replication client".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(CdcError::ConfigError(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.reconnect.initial_backoff > self.reconnect.max_backoff {
            return Err(CdcError::ConfigError(
                "reconnect.initial_backoff_ms exceeds reconnect.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn duration_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

/// 0이면 꺼짐
pub fn optional_duration_secs<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = Option::<u64>::deserialize(deserializer)?;
    Ok(secs.filter(|&s| s > 0).map(Duration::from_secs))
}

pub fn duration_millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::UnsupportedTypePolicy;
    use crate::events::ActionKind;
    use crate::offset::StartPosition;
    use std::io::Write;

    #[test]
    fn test_full_config() {
        let config = CdcConfig::from_toml_str(
            r#"
            schemas = ["shop"]
            tables = ["orders", "billing.invoices"]
            actions = ["insert", "delete"]
            start = { file = "mysql-bin.000010", offset = 1200 }
            blocking = false
            unsupported_types = "abort"
            include_before_image = true
            channel_capacity = 64
            checkpoint_every = 10

            [connection]
            hostname = "db.internal"
            port = 3307
            username = "repl"
            password = "secret"
            server_id = 1001
            timeout = 5
            heartbeat_interval = 0

            [reconnect]
            initial_backoff_ms = 100
            max_backoff_ms = 2000
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.hostname, "db.internal");
        assert_eq!(config.connection.port, 3307);
        assert_eq!(config.connection.timeout, Duration::from_secs(5));
        assert_eq!(config.connection.heartbeat_interval, None);
        assert_eq!(config.actions, vec![ActionKind::Insert, ActionKind::Delete]);
        assert_eq!(
            config.start,
            StartPosition::File {
                file: "mysql-bin.000010".into(),
                offset: 1200
            }
        );
        assert!(!config.blocking);
        assert_eq!(config.unsupported_types, UnsupportedTypePolicy::Abort);
        assert_eq!(config.reconnect.initial_backoff, Duration::from_millis(100));
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.channel_capacity, 64);
    }

    #[test]
    fn test_defaults() {
        let config = CdcConfig::from_toml_str("").unwrap();
        assert_eq!(config.connection.port, 3306);
        assert_eq!(config.connection.heartbeat_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.start, StartPosition::Current);
        assert!(config.blocking);
        assert!(config.schemas.is_empty());
        assert_eq!(config.unsupported_types, UnsupportedTypePolicy::SkipTable);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            CdcConfig::from_toml_str("actions = [\"truncate\"]"),
            Err(CdcError::ConfigError(_))
        ));
        assert!(matches!(
            CdcConfig::from_toml_str("[connection]\nserver_id = 0"),
            Err(CdcError::ConfigError(_))
        ));
        assert!(matches!(
            CdcConfig::from_toml_str("channel_capacity = 0"),
            Err(CdcError::ConfigError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "schemas = [\"shop\"]").unwrap();
        let config = CdcConfig::from_file(file.path()).unwrap();
        assert_eq!(config.schemas, vec!["shop".to_string()]);

        assert!(CdcConfig::from_file("/nonexistent/cdc.toml").is_err());
    }
}
