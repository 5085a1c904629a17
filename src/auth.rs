//! MySQL 인증 처리
//!
//! mysql_native_password, caching_sha2_password(fast auth) 구현

use byteorder::{LittleEndian, WriteBytesExt};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::Write;

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// caching_sha2_password 상태 바이트 (0x01 다음)
pub const FAST_AUTH_SUCCESS: u8 = 0x03;
pub const PERFORM_FULL_AUTH: u8 = 0x04;

/// 플러그인에 맞는 인증 응답 생성
pub fn scramble_for(plugin: &str, password: &str, scramble: &[u8]) -> Option<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD => Some(create_auth_response(password, scramble)),
        CACHING_SHA2_PASSWORD => Some(create_sha2_auth_response(password, scramble)),
        _ => None,
    }
}

/// Native password 인증 응답 생성
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = Sha1::digest(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = Sha1::digest(stage1);

    // SHA1(scramble + SHA1(SHA1(password)))
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    // XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password 인증 응답 생성
///
/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + scramble))
pub fn create_sha2_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let hash1 = Sha256::digest(password.as_bytes());
    let hash2 = Sha256::digest(hash1);

    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(scramble);
    let hash3 = hasher.finalize();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}

/// 인증 패킷 생성
pub fn create_handshake_response(
    username: &str,
    auth_response: &[u8],
    database: Option<&str>,
    collation: u8,
    auth_plugin: &str,
) -> Result<Vec<u8>, std::io::Error> {
    let mut buffer = Vec::new();

    // Client capability flags (4 bytes)
    let mut capabilities = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;

    if database.is_some() {
        capabilities |= capabilities::CONNECT_WITH_DB;
    }

    buffer.write_u32::<LittleEndian>(capabilities)?;

    // Max packet size (4 bytes) - 0 means default (16MB)
    buffer.write_u32::<LittleEndian>(0)?;

    // Character set (1 byte)
    buffer.write_u8(collation)?;

    // Reserved (23 bytes of zeros)
    buffer.write_all(&[0u8; 23])?;

    // Username (null-terminated string)
    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    // Authentication response
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(auth_response)?;

    // Database name (null-terminated string, if provided)
    if let Some(db) = database {
        buffer.write_all(db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    // Authentication plugin name (null-terminated)
    buffer.write_all(auth_plugin.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

/// 문자셋 이름 → 핸드셰이크용 collation ID
pub fn collation_id(charset: &str) -> u8 {
    match charset.to_ascii_lowercase().as_str() {
        "utf8" | "utf8mb3" => 33,
        "latin1" => 8,
        "ascii" => 11,
        "binary" => 63,
        // utf8mb4_general_ci
        _ => 45,
    }
}
