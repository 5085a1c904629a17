//! Binlog 처리 위치 추적 및 저장
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::error::{CdcError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// binlog 파일의 첫 이벤트 위치 (4바이트 매직 넘버 다음)
pub const BINLOG_START_OFFSET: u64 = 4;

/// 복제 위치
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub file: String,
    /// 바이트 위치
    pub offset: u64,
    /// 실행된 GTID 집합 (GTID 모드에서만)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
}

impl ReplicationPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        ReplicationPosition {
            file: file.into(),
            offset,
            gtid: None,
        }
    }

    pub fn with_gtid(mut self, gtid: impl Into<String>) -> Self {
        self.gtid = Some(gtid.into());
        self
    }

    /// 같은 파일 안에서는 앞으로만 이동
    pub fn advance(&mut self, offset: u64) {
        if offset > self.offset {
            self.offset = offset;
        }
    }

    /// 새 파일로 전환
    pub fn rotate(&mut self, file: impl Into<String>, offset: u64) {
        self.file = file.into();
        self.offset = offset;
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.file.rsplit('.').next().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)?;
        if let Some(gtid) = &self.gtid {
            write!(f, " gtid={}", gtid)?;
        }
        Ok(())
    }
}

/// 최초 시작 위치
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "StartPositionRepr")]
pub enum StartPosition {
    /// 서버의 현재 binlog 위치 (SHOW BINARY LOG STATUS)
    #[default]
    Current,
    /// 서버에 남아 있는 가장 오래된 binlog
    Earliest,
    File { file: String, offset: u64 },
    /// 이미 실행된 GTID 집합 이후부터
    Gtid { set: String },
}

/// TOML 표현: `"current"`, `"earliest"`, `{ file = "...", offset = 4 }`, `{ gtid = "..." }`
#[derive(Deserialize)]
#[serde(untagged)]
enum StartPositionRepr {
    Named(String),
    File {
        file: String,
        #[serde(default = "default_offset")]
        offset: u64,
    },
    Gtid {
        gtid: String,
    },
}

fn default_offset() -> u64 {
    BINLOG_START_OFFSET
}

impl TryFrom<StartPositionRepr> for StartPosition {
    type Error = String;

    fn try_from(repr: StartPositionRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            StartPositionRepr::Named(name) => match name.to_ascii_lowercase().as_str() {
                "current" => Ok(StartPosition::Current),
                "earliest" => Ok(StartPosition::Earliest),
                other => Err(format!("unknown start position: {}", other)),
            },
            StartPositionRepr::File { file, offset } => Ok(StartPosition::File { file, offset }),
            StartPositionRepr::Gtid { gtid } => Ok(StartPosition::Gtid { set: gtid }),
        }
    }
}

impl StartPosition {
    /// 서버에 묻지 않고 정할 수 있는 위치. `Current`는 None.
    ///
    /// `Earliest`는 빈 파일명 + 4: 서버가 가장 오래된 파일부터 보낸다.
    pub fn resolve_static(&self) -> Option<ReplicationPosition> {
        match self {
            StartPosition::Current => None,
            StartPosition::Earliest => Some(ReplicationPosition::new("", BINLOG_START_OFFSET)),
            StartPosition::File { file, offset } => Some(ReplicationPosition::new(file.clone(), *offset)),
            StartPosition::Gtid { set } => {
                Some(ReplicationPosition::new("", BINLOG_START_OFFSET).with_gtid(set.clone()))
            }
        }
    }
}

/// 재시작 위치 저장소
pub trait PositionStore: Send + Sync {
    fn load(&self) -> Result<Option<ReplicationPosition>>;
    fn save(&self, position: &ReplicationPosition) -> Result<()>;
}

/// JSON 파일 저장소 (임시 파일에 쓴 뒤 rename)
#[derive(Debug, Clone)]
pub struct FilePositionStore {
    path: PathBuf,
}

impl FilePositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FilePositionStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PositionStore for FilePositionStore {
    fn load(&self) -> Result<Option<ReplicationPosition>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| CdcError::IoError(format!("{}: {}", self.path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, position: &ReplicationPosition) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(position)?;
        write_synced(&tmp, content.as_bytes())
            .map_err(|e| CdcError::IoError(format!("{}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| CdcError::IoError(format!("{}: {}", self.path.display(), e)))?;
        sync_parent_dir(&self.path);
        debug!(path = %self.path.display(), position = %position, "Position saved");
        Ok(())
    }
}

/// 내용을 쓰고 fsync까지 마친다
fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}

/// rename 자체를 영속화. 디렉터리를 열 수 없는 플랫폼에서는 건너뛴다.
fn sync_parent_dir(path: &Path) {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return;
    };
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), "Could not sync position directory: {}", e);
    }
}

/// `MemoryPositionStore`가 보관하는 최근 위치 수
pub const MEMORY_HISTORY_LIMIT: usize = 64;

/// 메모리 저장소 (테스트, 임베딩용). 최근 위치만 보관한다.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    saved: Mutex<VecDeque<ReplicationPosition>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        MemoryPositionStore::default()
    }

    pub fn with_position(position: ReplicationPosition) -> Self {
        MemoryPositionStore {
            saved: Mutex::new(VecDeque::from([position])),
        }
    }

    /// 저장된 위치 이력 (오래된 것부터, 최대 `MEMORY_HISTORY_LIMIT`개)
    pub fn history(&self) -> Vec<ReplicationPosition> {
        self.saved.lock().iter().cloned().collect()
    }
}

impl PositionStore for MemoryPositionStore {
    fn load(&self) -> Result<Option<ReplicationPosition>> {
        Ok(self.saved.lock().back().cloned())
    }

    fn save(&self, position: &ReplicationPosition) -> Result<()> {
        let mut saved = self.saved.lock();
        if saved.len() >= MEMORY_HISTORY_LIMIT {
            saved.pop_front();
        }
        saved.push_back(position.clone());
        Ok(())
    }
}
