/// MySQL CDC 엔진 실행 파일
///
/// 변경 이벤트를 한 줄에 하나씩 JSON으로 stdout에 쓴다. 로그는 stderr로 간다.
use binlog_cdc::{CdcConfig, CdcEngine, FilePositionStore};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Stream MySQL row changes as JSON lines")]
struct Cli {
    /// TOML 설정 파일. 아래 플래그가 주어지면 파일 값을 덮어쓴다.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, env = "DB_HOST")]
    host: Option<String>,

    #[arg(long, env = "DB_PORT")]
    port: Option<u16>,

    #[arg(long, env = "DB_USER")]
    user: Option<String>,

    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// 복제 클라이언트 서버 ID
    #[arg(long, env = "DB_SERVER_ID")]
    server_id: Option<u32>,

    #[arg(long, env = "DB_SCHEMAS", value_delimiter = ',')]
    schemas: Vec<String>,

    /// `table` 또는 `schema.table`
    #[arg(long, env = "DB_TABLES", value_delimiter = ',')]
    tables: Vec<String>,

    /// 재시작 위치를 저장할 파일
    #[arg(long)]
    position_file: Option<PathBuf>,

    /// 현재 binlog 끝에 도달하면 종료
    #[arg(long)]
    non_blocking: bool,

    /// UPDATE 이벤트에 변경 전 값 포함
    #[arg(long)]
    before_image: bool,
}

impl Cli {
    fn build_config(&self) -> binlog_cdc::Result<CdcConfig> {
        let mut config = match &self.config {
            Some(path) => CdcConfig::from_file(path)?,
            None => CdcConfig::default(),
        };

        let connection = &mut config.connection;
        if let Some(host) = &self.host {
            connection.hostname = host.clone();
        }
        if let Some(port) = self.port {
            connection.port = port;
        }
        if let Some(user) = &self.user {
            connection.username = user.clone();
        }
        if let Some(password) = &self.password {
            connection.password = password.clone();
        }
        if let Some(server_id) = self.server_id {
            connection.server_id = server_id;
        }
        if !self.schemas.is_empty() {
            config.schemas = self.schemas.clone();
        }
        if !self.tables.is_empty() {
            config.tables = self.tables.clone();
        }
        if self.non_blocking {
            config.blocking = false;
        }
        if self.before_image {
            config.include_before_image = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.build_config()?;

    info!(
        address = %config.connection.address(),
        server_id = config.connection.server_id,
        "Starting MySQL CDC Engine"
    );

    let mut engine = CdcEngine::new(config);
    if let Some(path) = &cli.position_file {
        engine = engine.with_store(Arc::new(FilePositionStore::new(path)));
    }
    let (handle, mut events, task) = engine.spawn();

    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            stopper.stop();
        }
    });

    let stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        let line = serde_json::to_string(&event)?;
        let mut out = stdout.lock();
        if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
            // stdout이 닫힘 (파이프 종료)
            handle.stop();
            break;
        }
    }
    drop(events);

    match task.await? {
        Ok(position) => {
            info!(position = %position, "Resume from this position on the next run");
            Ok(())
        }
        Err(e) => {
            error!(kind = e.kind(), "CDC Engine failed: {}", e);
            Err(e.into())
        }
    }
}
