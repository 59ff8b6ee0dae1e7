//! Record codec.
//!
//! Every record file is:
//! ```text
//! [magic: 4 bytes "HRLD"][version: 1 byte][length: 4 bytes LE]
//! [data: N bytes JSON][crc32: 4 bytes LE]
//! ```
//! The checksum lets a reload scan tell a torn or corrupted record from a good
//! one and skip it.

use std::io::{Read, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::StorageError;

/// Current codec version.
const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying herald record files.
pub const MAGIC: [u8; 4] = *b"HRLD";

/// Largest record the decoder accepts.
const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

fn codec_err(message: impl Into<String>) -> StorageError {
    StorageError::Codec {
        message: message.into(),
    }
}

fn io_err(source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: "<record>".to_string(),
        source,
    }
}

/// Encode a complete record: header, framed body and checksum.
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let data = serde_json::to_vec(value).map_err(|e| codec_err(format!("serialization failed: {e}")))?;
    let len = u32::try_from(data.len()).map_err(|_| codec_err("record too large"))?;

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(MAGIC.len() + 1 + 4 + data.len() + 4);
    out.extend_from_slice(&MAGIC);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Write an encoded record.
pub fn write_record<T: Serialize>(writer: &mut impl Write, value: &T) -> Result<(), StorageError> {
    let bytes = encode_record(value)?;
    writer.write_all(&bytes).map_err(io_err)
}

/// Decode a record, verifying magic, version and checksum.
///
/// # Errors
/// `Codec` on any mismatch or a body that does not deserialize.
pub fn read_record<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T, StorageError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(io_err)?;
    if magic != MAGIC {
        return Err(codec_err(format!("invalid magic bytes: {magic:?}")));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version).map_err(io_err)?;
    if version[0] != CODEC_VERSION {
        return Err(codec_err(format!(
            "unsupported codec version: {} (expected {CODEC_VERSION})",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).map_err(io_err)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(codec_err(format!("record size {len} exceeds maximum {MAX_RECORD_SIZE}")));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).map_err(io_err)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes).map_err(io_err)?;
    let stored = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(codec_err(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x} (data corrupted)"
        )));
    }

    serde_json::from_slice(&data).map_err(|e| codec_err(format!("deserialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_detects_corruption() {
        let mut encoded = encode_record(&"test data".to_string()).unwrap();
        let idx = encoded.len() - 6;
        encoded[idx] ^= 0xFF;

        let err = read_record::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert!(err.to_string().contains("CRC") || err.to_string().contains("deserialization"));
    }

    #[test]
    fn test_detects_truncation() {
        let encoded = encode_record(&vec![1u32, 2, 3]).unwrap();
        let truncated = encoded[..encoded.len() - 3].to_vec();
        assert!(read_record::<Vec<u32>>(&mut Cursor::new(truncated)).is_err());
    }

    #[test]
    fn test_rejects_oversized_record() {
        let mut bad = MAGIC.to_vec();
        bad.push(CODEC_VERSION);
        bad.extend_from_slice(&(200_000_000u32).to_le_bytes());

        let err = read_record::<String>(&mut Cursor::new(bad)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let err = read_record::<String>(&mut Cursor::new(b"JUNK\x01garbage".to_vec())).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_event_record() {
        use crate::event::{Event, EventDescriptor};

        let event = Event::new(&EventDescriptor::new("svc", 4), 9, chrono::Utc::now(), serde_json::json!({"k": 1}));
        let mut buf = Vec::new();
        write_record(&mut buf, &event).unwrap();
        let decoded: Event = read_record(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, event);
    }
}
