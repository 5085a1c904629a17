//! MySQL 프로토콜 패킷 처리
//!
//! mysql-binlog-connector-java의 PacketChannel과 동일한 기능 제공.
//! 16MB를 넘는 페이로드는 여러 패킷으로 나뉘어 전송되므로 읽을 때 이어 붙인다.

use crate::error::{CdcError, Result};
use crate::reader::PayloadReader;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

/// 단일 패킷 최대 페이로드 (2^24 - 1)
pub const MAX_PAYLOAD_LEN: usize = 0x00ff_ffff;

/// MySQL 패킷 채널
pub struct PacketChannel<S = TcpStream> {
    stream: BufStream<S>,
    sequence: u8,
}

impl PacketChannel<TcpStream> {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(hostname: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            CdcError::ConnectionError(format!("Failed to connect to {}: {}", addr, e))
        })?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel::new(stream))
    }
}

impl<S> PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        PacketChannel {
            stream: BufStream::new(stream),
            sequence: 0,
        }
    }

    /// 새 명령 시작 시 시퀀스 번호 초기화
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// 패킷 읽기 (분할 패킷은 하나로 합침)
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            // 패킷 헤더 읽기 (3 bytes length + 1 byte sequence)
            let mut header = [0u8; 4];
            self.stream.read_exact(&mut header).await.map_err(|e| {
                CdcError::ConnectionLost(format!("Failed to read packet header: {}", e))
            })?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            // 패킷 본문 읽기
            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .map_err(|e| {
                    CdcError::ConnectionLost(format!("Failed to read packet body: {}", e))
                })?;

            if length < MAX_PAYLOAD_LEN {
                return Ok(payload);
            }
        }
    }

    /// 패킷 쓰기 (현재 시퀀스 번호 사용)
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(data.len() + 4);
        let mut chunks = data.chunks(MAX_PAYLOAD_LEN).peekable();
        if chunks.peek().is_none() {
            buffer.put_uint_le(0, 3);
            buffer.put_u8(self.next_sequence());
        }
        while let Some(chunk) = chunks.next() {
            buffer.put_uint_le(chunk.len() as u64, 3);
            buffer.put_u8(self.next_sequence());
            buffer.put_slice(chunk);
            // 정확히 최대 길이로 끝나면 빈 패킷으로 종료를 알린다
            if chunks.peek().is_none() && chunk.len() == MAX_PAYLOAD_LEN {
                buffer.put_uint_le(0, 3);
                buffer.put_u8(self.next_sequence());
            }
        }

        self.stream
            .write_all(&buffer)
            .await
            .map_err(|e| CdcError::ConnectionLost(format!("Failed to write packet: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| CdcError::ConnectionLost(format!("Failed to flush: {}", e)))?;

        Ok(())
    }

    /// 새 명령 전송 (시퀀스 0부터)
    pub async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        self.reset_sequence();
        self.write_packet(data).await
    }

    /// 명령을 보내고 OK 패킷을 기대
    pub async fn execute(&mut self, data: &[u8], what: &str) -> Result<()> {
        self.write_command(data).await?;
        let response = self.read_packet().await?;
        if is_error_packet(&response) {
            let err = ErrorPacket::parse(&response)?;
            return Err(CdcError::ProtocolError(format!("{} failed: {}", what, err)));
        }
        if !is_ok_packet(&response) {
            return Err(CdcError::ProtocolError(format!(
                "{}: unexpected response {:?}",
                what,
                response.first()
            )));
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to shutdown stream: {}", e)))
    }

    fn next_sequence(&mut self) -> u8 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }
}

/// Greeting 패킷 파싱
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(data);
        let protocol = |e: CdcError| CdcError::ProtocolError(format!("Invalid greeting: {}", e));

        // Protocol version (1 byte)
        let protocol_version = reader.u8().map_err(protocol)?;
        if protocol_version == 0xFF {
            let err = ErrorPacket::parse(data)?;
            return Err(CdcError::ConnectionError(format!(
                "Server refused connection: {}",
                err
            )));
        }

        // Server version (null-terminated string)
        let server_version =
            String::from_utf8_lossy(reader.null_terminated().map_err(protocol)?).into_owned();

        // Thread ID (4 bytes)
        let thread_id = reader.u32_le().map_err(protocol)?;

        // Auth plugin data part 1 (8 bytes)
        let mut scramble = reader.bytes(8).map_err(protocol)?.to_vec();

        // Filler (1 byte, always 0x00)
        reader.u8().map_err(protocol)?;

        // Capability flags (lower 2 bytes)
        let capabilities_lower = reader.u16_le().map_err(protocol)?;

        // 구버전 서버는 여기서 끝날 수 있음
        if reader.is_empty() {
            return Ok(GreetingPacket {
                protocol_version,
                server_version,
                thread_id,
                scramble,
                server_capabilities: capabilities_lower as u32,
                server_collation: 0,
                server_status: 0,
                auth_plugin: String::from("mysql_native_password"),
            });
        }

        let server_collation = reader.u8().map_err(protocol)?;
        let server_status = reader.u16_le().map_err(protocol)?;
        let capabilities_upper = reader.u16_le().map_err(protocol)?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        // Length of auth plugin data (1 byte)
        let auth_data_len = reader.u8().map_err(protocol)?;

        // Reserved (10 bytes)
        reader.skip(10).map_err(protocol)?;

        // Auth plugin data part 2 (at least 13 bytes, 마지막 null byte 제외)
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let part2 = reader.bytes(part2_len).map_err(protocol)?;
        scramble.extend_from_slice(&part2[..part2.len() - 1]);

        let auth_plugin = if reader.is_empty() {
            String::from("mysql_native_password")
        } else {
            let rest = reader.rest();
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            String::from_utf8_lossy(&rest[..end]).into_owned()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin,
        })
    }
}

/// ERR 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: u16,
    pub sql_state: Option<String>,
    pub message: String,
}

impl ErrorPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(data);
        let header = reader.u8()?;
        if header != 0xFF {
            return Err(CdcError::ProtocolError(format!(
                "Expected error packet, got 0x{:02x}",
                header
            )));
        }
        let code = reader.u16_le()?;
        let sql_state = if reader.remaining() >= 6 && data[3] == b'#' {
            reader.skip(1)?;
            Some(String::from_utf8_lossy(reader.bytes(5)?).into_owned())
        } else {
            None
        };
        let message = String::from_utf8_lossy(reader.rest()).into_owned();
        Ok(ErrorPacket {
            code,
            sql_state,
            message,
        })
    }
}

impl std::fmt::Display for ErrorPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sql_state {
            Some(state) => write!(f, "[{}] ({}) {}", self.code, state, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFF
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0x00
}

/// EOF 패킷 확인 (0xFE, 길이 < 9)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFE && data.len() < 9
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_is_error_packet() {
        assert!(is_error_packet(&[0xFF, 0x01, 0x02]));
        assert!(!is_error_packet(&[0x00, 0x01, 0x02]));
    }

    #[test]
    fn test_is_ok_packet() {
        assert!(is_ok_packet(&[0x00, 0x01, 0x02]));
        assert!(!is_ok_packet(&[0xFF, 0x01, 0x02]));
    }

    #[test]
    fn test_is_eof_packet() {
        assert!(is_eof_packet(&[0xFE, 0x00, 0x00, 0x02, 0x00]));
        assert!(!is_eof_packet(&[0xFE; 20]));
    }

    #[test]
    fn test_error_packet_parse() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000");
        data.extend_from_slice(b"Access denied");
        let err = ErrorPacket::parse(&data).unwrap();
        assert_eq!(err.code, 1045);
        assert_eq!(err.sql_state.as_deref(), Some("28000"));
        assert_eq!(err.message, "Access denied");
    }

    #[test]
    fn test_greeting_parse() {
        let mut data = vec![10u8];
        data.extend_from_slice(b"8.0.36\0");
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(b"abcdefgh");
        data.push(0);
        data.extend_from_slice(&0xf7ffu16.to_le_bytes());
        data.push(255);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&0x000fu16.to_le_bytes());
        data.push(21);
        data.extend_from_slice(&[0u8; 10]);
        data.extend_from_slice(b"ijklmnopqrst\0");
        data.extend_from_slice(b"caching_sha2_password\0");

        let greeting = GreetingPacket::parse(&data).unwrap();
        assert_eq!(greeting.server_version, "8.0.36");
        assert_eq!(greeting.thread_id, 7);
        assert_eq!(greeting.scramble, b"abcdefghijklmnopqrst".to_vec());
        assert_eq!(greeting.server_collation, 255);
        assert_eq!(greeting.auth_plugin, "caching_sha2_password");
    }

    #[tokio::test]
    async fn test_read_packet_tracks_sequence() {
        let mock = Builder::new()
            .read(&[3, 0, 0, 4])
            .read(b"abc")
            .write(&[2, 0, 0, 5, b'o', b'k'])
            .build();
        let mut channel = PacketChannel::new(mock);

        let packet = channel.read_packet().await.unwrap();
        assert_eq!(packet, b"abc");

        // 응답은 다음 시퀀스 번호(5)로 전송된다
        channel.write_packet(b"ok").await.unwrap();
    }

    #[tokio::test]
    async fn test_read_packet_joins_split_payload() {
        let first = vec![0xabu8; MAX_PAYLOAD_LEN];
        let mock = Builder::new()
            .read(&[0xff, 0xff, 0xff, 0])
            .read(&first)
            .read(&[3, 0, 0, 1])
            .read(b"xyz")
            .write(&[2, 0, 0, 2, b'o', b'k'])
            .build();
        let mut channel = PacketChannel::new(mock);

        let packet = channel.read_packet().await.unwrap();
        assert_eq!(packet.len(), MAX_PAYLOAD_LEN + 3);
        assert!(packet[..MAX_PAYLOAD_LEN].iter().all(|&b| b == 0xab));
        assert_eq!(&packet[MAX_PAYLOAD_LEN..], b"xyz");

        // 마지막 조각의 시퀀스(1) 다음 번호로 응답
        channel.write_packet(b"ok").await.unwrap();
    }

    #[tokio::test]
    async fn test_read_packet_eof_is_connection_lost() {
        let mock = Builder::new().read(&[3, 0]).build();
        let mut channel = PacketChannel::new(mock);
        let err = channel.read_packet().await.unwrap_err();
        assert!(matches!(err, CdcError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_write_command_resets_sequence() {
        let mock = Builder::new()
            .read(&[1, 0, 0, 9, 0x00])
            .write(&[1, 0, 0, 0, 0x0e])
            .build();
        let mut channel = PacketChannel::new(mock);
        channel.read_packet().await.unwrap();
        channel.write_command(&[0x0e]).await.unwrap();
    }
}
