//! On-disk snapshot format for [`CatalogState`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ MAGIC: [u8; 4] = "RSDN"                         │
//! ├─────────────────────────────────────────────────┤
//! │ VERSION: u32                                    │
//! ├─────────────────────────────────────────────────┤
//! │ PAYLOAD_LEN: u64                                │
//! ├─────────────────────────────────────────────────┤
//! │ PAYLOAD: bincode(CatalogState)                  │
//! ├─────────────────────────────────────────────────┤
//! │ CRC32: u32 over everything above                │
//! └─────────────────────────────────────────────────┘
//! ```

use super::catalog::CatalogState;
use crate::error::{Result, StorageError};
use crc::{Crc, CRC_32_ISCSI};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MAGIC: [u8; 4] = *b"RSDN";

const VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 8;

/// Encode a catalog snapshot.
pub fn encode(state: &CatalogState) -> Result<Vec<u8>> {
    let payload = bincode::serialize(state)?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);

    let crc = CRC32.checksum(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Decode and verify a catalog snapshot.
pub fn decode(data: &[u8]) -> Result<CatalogState> {
    if data.len() < HEADER_LEN + 4 {
        return Err(corrupted(format!("snapshot too short: {} bytes", data.len())));
    }
    // Magic first for a clearer error than a checksum mismatch.
    if data[0..4] != MAGIC {
        return Err(corrupted("invalid magic".to_string()));
    }

    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let mut digest = CRC32.digest();
    digest.update(body);
    let actual = digest.finalize();
    if expected != actual {
        return Err(corrupted(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    let version = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    if version != VERSION {
        return Err(corrupted(format!("unsupported version {}", version)));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&body[8..16]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    let payload = &body[HEADER_LEN..];
    if payload.len() != len {
        return Err(corrupted(format!(
            "payload length {} does not match header {}",
            payload.len(),
            len
        )));
    }

    Ok(bincode::deserialize(payload)?)
}

fn corrupted(msg: String) -> crate::error::Error {
    StorageError::Corrupted(msg).into()
}
