//! Checksummed container for every file the archive writes.
//!
//! Layout (little endian):
//! - 4 bytes magic (`CTXS` shard, `CTXI` index)
//! - u32 format version
//! - u32 crc32 of payload
//! - u64 payload length
//! - bincode payload

use std::io;

use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const SHARD_MAGIC: [u8; 4] = *b"CTXS";
pub const INDEX_MAGIC: [u8; 4] = *b"CTXI";

/// Bumped whenever a payload layout changes
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 4 + 8;

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

pub fn encode<T: Serialize>(magic: [u8; 4], value: &T) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(value).map_err(|e| invalid(e.to_string()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&checksum(&payload).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode<T: DeserializeOwned>(magic: [u8; 4], data: &[u8]) -> io::Result<T> {
    if data.len() < HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("file too short for header: {} bytes", data.len()),
        ));
    }
    if data[0..4] != magic {
        return Err(invalid(format!(
            "bad magic {:?}, expected {:?}",
            &data[0..4],
            magic
        )));
    }

    let mut word = [0u8; 4];
    word.copy_from_slice(&data[4..8]);
    let version = u32::from_le_bytes(word);
    if version != FORMAT_VERSION {
        return Err(invalid(format!(
            "unsupported format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }

    word.copy_from_slice(&data[8..12]);
    let expected_crc = u32::from_le_bytes(word);

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[12..20]);
    let len = u64::from_le_bytes(len_bytes) as usize;

    let payload = &data[HEADER_LEN..];
    if payload.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("payload length {} does not match header {}", payload.len(), len),
        ));
    }
    let actual_crc = checksum(payload);
    if actual_crc != expected_crc {
        return Err(invalid(format!(
            "checksum mismatch: stored {:08x}, computed {:08x}",
            expected_crc, actual_crc
        )));
    }

    bincode::deserialize(payload).map_err(|e| invalid(e.to_string()))
}
