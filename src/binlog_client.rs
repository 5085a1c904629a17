//! MySQL Binlog 클라이언트
//!
//! 복제 프로토콜로 서버에 접속해 binlog 이벤트 프레임을 하나씩 읽는다.
//! 접속 → 인증 → 체크섬/하트비트 설정 → COM_REGISTER_SLAVE → COM_BINLOG_DUMP(_GTID)

use crate::auth;
use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::gtid::GtidSet;
use crate::offset::ReplicationPosition;
use crate::protocol::{self, ErrorPacket, GreetingPacket, PacketChannel};
use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const COM_QUIT: u8 = 0x01;
const COM_QUERY: u8 = 0x03;
const COM_REGISTER_SLAVE: u8 = 0x15;
/// COM_BINLOG_DUMP 명령어 코드
const COM_BINLOG_DUMP: u8 = 0x12;
/// COM_BINLOG_DUMP_GTID 명령어 코드
const COM_BINLOG_DUMP_GTID: u8 = 0x1e;

/// 더 보낼 이벤트가 없으면 EOF로 스트림 종료
const BINLOG_DUMP_NON_BLOCK: u16 = 0x01;
const BINLOG_THROUGH_GTID: u16 = 0x04;

/// 서버가 보낸 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// binlog 이벤트 원본 바이트 (헤더부터, OK 바이트 제외)
    Event(Bytes),
    /// non-blocking 덤프가 끝남
    EndOfStream,
}

/// Binlog 클라이언트
pub struct BinlogClient<S = TcpStream> {
    channel: PacketChannel<S>,
    greeting: GreetingPacket,
    heartbeat_interval: Option<Duration>,
}

impl BinlogClient<TcpStream> {
    /// TCP 접속 및 인증
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        info!("Connecting to {}", config.address());
        let channel = tokio::time::timeout(
            config.timeout,
            PacketChannel::connect(&config.hostname, config.port),
        )
        .await
        .map_err(|_| CdcError::ConnectionError(format!("Timed out connecting to {}", config.address())))??;

        tokio::time::timeout(config.timeout, Self::handshake(channel, config))
            .await
            .map_err(|_| CdcError::ConnectionError("Timed out during handshake".to_string()))?
    }
}

impl<S> BinlogClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// 이미 열린 스트림에서 핸드셰이크 수행
    pub async fn handshake(mut channel: PacketChannel<S>, config: &ConnectionConfig) -> Result<Self> {
        let greeting_packet = channel.read_packet().await?;
        let greeting = GreetingPacket::parse(&greeting_packet)?;

        info!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );

        let (plugin, auth_response) =
            match auth::scramble_for(&greeting.auth_plugin, &config.password, &greeting.scramble) {
                Some(response) => (greeting.auth_plugin.as_str(), response),
                None => {
                    debug!(plugin = %greeting.auth_plugin, "Unsupported default auth plugin, offering mysql_native_password");
                    (
                        auth::NATIVE_PASSWORD,
                        auth::create_auth_response(&config.password, &greeting.scramble),
                    )
                }
            };

        let handshake = auth::create_handshake_response(
            &config.username,
            &auth_response,
            None,
            auth::collation_id(&config.charset),
            plugin,
        )?;
        channel.write_packet(&handshake).await?;

        Self::authenticate(&mut channel, config, &greeting.scramble).await?;
        info!("Authentication successful");

        Ok(BinlogClient {
            channel,
            greeting,
            heartbeat_interval: config.heartbeat_interval,
        })
    }

    /// 인증 결과 처리 (auth switch, caching_sha2 fast auth 포함)
    async fn authenticate(
        channel: &mut PacketChannel<S>,
        config: &ConnectionConfig,
        scramble: &[u8],
    ) -> Result<()> {
        let mut scramble = scramble.to_vec();
        loop {
            let response = channel.read_packet().await?;
            match response.first() {
                Some(0x00) => return Ok(()),
                Some(0xFF) => {
                    let err = ErrorPacket::parse(&response)?;
                    return Err(CdcError::ConnectionError(format!(
                        "Authentication failed: {}",
                        err
                    )));
                }
                // Auth switch request: 플러그인 이름 + 새 scramble
                Some(0xFE) => {
                    let rest = &response[1..];
                    let name_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                    let plugin = String::from_utf8_lossy(&rest[..name_end]).into_owned();
                    let data = rest.get(name_end + 1..).unwrap_or_default();
                    scramble = data.strip_suffix(&[0]).unwrap_or(data).to_vec();

                    debug!(plugin = %plugin, "Auth switch requested");
                    let reply = auth::scramble_for(&plugin, &config.password, &scramble)
                        .ok_or_else(|| {
                            CdcError::ConnectionError(format!(
                                "Unsupported authentication plugin: {}",
                                plugin
                            ))
                        })?;
                    channel.write_packet(&reply).await?;
                }
                // caching_sha2_password 추가 데이터
                Some(0x01) => match response.get(1).copied() {
                    Some(auth::FAST_AUTH_SUCCESS) => {
                        debug!("caching_sha2_password fast auth succeeded");
                    }
                    Some(auth::PERFORM_FULL_AUTH) => {
                        return Err(CdcError::ConnectionError(
                            "caching_sha2_password full authentication requested; \
                             this client supports only the cached fast path (log in once with another client or use mysql_native_password)"
                                .to_string(),
                        ));
                    }
                    other => {
                        return Err(CdcError::ProtocolError(format!(
                            "Unexpected auth data: {:?}",
                            other
                        )))
                    }
                },
                other => {
                    return Err(CdcError::ProtocolError(format!(
                        "Unexpected authentication response: {:?}",
                        other
                    )))
                }
            }
        }
    }

    pub fn server_version(&self) -> &str {
        &self.greeting.server_version
    }

    /// OK만 돌려주는 문장 실행 (SET 등)
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut packet = Vec::with_capacity(sql.len() + 1);
        packet.push(COM_QUERY);
        packet.extend_from_slice(sql.as_bytes());
        self.channel.execute(&packet, sql).await
    }

    /// 복제 클라이언트로 등록하고 주어진 위치부터 덤프 요청
    ///
    /// 위치에 GTID 집합이 있으면 COM_BINLOG_DUMP_GTID를 사용한다.
    pub async fn register_as_replica(
        &mut self,
        server_id: u32,
        position: &ReplicationPosition,
        blocking: bool,
    ) -> Result<()> {
        // 서버 체크섬 설정을 그대로 받는다 (FDE로 알고리즘 확인)
        if let Err(e) = self
            .execute("SET @master_binlog_checksum = @@global.binlog_checksum")
            .await
        {
            warn!("Failed to negotiate binlog checksum, continuing without: {}", e);
        }

        if let Some(interval) = self.heartbeat_interval {
            self.execute(&format!(
                "SET @master_heartbeat_period = {}",
                interval.as_nanos()
            ))
            .await?;
        }

        let register = create_register_slave_command(server_id)?;
        self.channel.execute(&register, "COM_REGISTER_SLAVE").await?;

        let mut flags = if blocking { 0 } else { BINLOG_DUMP_NON_BLOCK };
        let dump = match position.gtid.as_deref() {
            Some(gtid) => {
                let gtid_set = GtidSet::parse(gtid)?;
                flags |= BINLOG_THROUGH_GTID;
                info!(gtid = %gtid_set, "Sending COM_BINLOG_DUMP_GTID");
                create_binlog_dump_gtid_command(server_id, position, flags, &gtid_set)?
            }
            None => {
                info!(
                    "Sent COM_BINLOG_DUMP: file={}, position={}",
                    position.file, position.offset
                );
                create_binlog_dump_command(server_id, position, flags)?
            }
        };
        self.channel.write_command(&dump).await
    }

    /// 다음 binlog 프레임
    pub async fn next_frame(&mut self) -> Result<Frame> {
        let packet = self.channel.read_packet().await?;
        match packet.first() {
            Some(0x00) => Ok(Frame::Event(Bytes::from(packet).slice(1..))),
            Some(0xFE) if protocol::is_eof_packet(&packet) => Ok(Frame::EndOfStream),
            Some(0xFF) => {
                let err = ErrorPacket::parse(&packet)?;
                Err(CdcError::ProtocolError(format!("Binlog stream error: {}", err)))
            }
            Some(other) => Err(CdcError::ProtocolError(format!(
                "Unexpected packet header 0x{:02x} in binlog stream",
                other
            ))),
            None => Err(CdcError::ProtocolError("Empty packet in binlog stream".to_string())),
        }
    }

    /// COM_QUIT 후 소켓 종료
    pub async fn close(mut self) -> Result<()> {
        if let Err(e) = self.channel.write_command(&[COM_QUIT]).await {
            debug!("COM_QUIT failed: {}", e);
        }
        self.channel.shutdown().await
    }
}

/// COM_REGISTER_SLAVE 명령어 생성
fn create_register_slave_command(server_id: u32) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.write_u8(COM_REGISTER_SLAVE)?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    // report host / user / password (빈 문자열)
    buffer.write_u8(0)?;
    buffer.write_u8(0)?;
    buffer.write_u8(0)?;
    // report port
    buffer.write_u16::<LittleEndian>(0)?;
    // replication rank (무시됨)
    buffer.write_u32::<LittleEndian>(0)?;
    // master id
    buffer.write_u32::<LittleEndian>(0)?;
    Ok(buffer)
}

/// COM_BINLOG_DUMP 명령어 생성
fn create_binlog_dump_command(
    server_id: u32,
    position: &ReplicationPosition,
    flags: u16,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.write_u8(COM_BINLOG_DUMP)?;
    // Binlog position (4 bytes, little-endian)
    buffer.write_u32::<LittleEndian>(position.offset as u32)?;
    buffer.write_u16::<LittleEndian>(flags)?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    // Binlog filename (패킷 끝까지)
    buffer.write_all(position.file.as_bytes())?;
    Ok(buffer)
}

/// COM_BINLOG_DUMP_GTID 명령어 생성
fn create_binlog_dump_gtid_command(
    server_id: u32,
    position: &ReplicationPosition,
    flags: u16,
    gtid_set: &GtidSet,
) -> Result<Vec<u8>> {
    let encoded = gtid_set.encode();
    let mut buffer = Vec::new();
    buffer.write_u8(COM_BINLOG_DUMP_GTID)?;
    buffer.write_u16::<LittleEndian>(flags)?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_u32::<LittleEndian>(position.file.len() as u32)?;
    buffer.write_all(position.file.as_bytes())?;
    buffer.write_u64::<LittleEndian>(position.offset)?;
    buffer.write_u32::<LittleEndian>(encoded.len() as u32)?;
    buffer.write_all(&encoded)?;
    Ok(buffer)
}
