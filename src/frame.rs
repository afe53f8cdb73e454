//! Binary frame carried Base64-encoded inside SMS bodies.
//!
//! Control-plane messages ride the SMS channel when no packet-data path is
//! available. The frame is deliberately small: sync word, payload length,
//! JSON-serialized [`HostMessage`], CRC32 trailer.

use thiserror::Error;

use crate::bus::HostMessage;

/// Wire layout (little-endian):
/// `[sync 2][len u16][payload len bytes][crc32 over sync+len+payload]`.
pub const SYNC: [u8; 2] = [0x54, 0x47];

const HEADER_LEN: usize = 4;
const TRAILER_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame truncated ({0} bytes)")]
    Truncated(usize),
    #[error("bad sync word")]
    BadSync,
    #[error("length field {declared} does not match payload of {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("CRC mismatch")]
    CrcMismatch,
    #[error("payload is not a valid host message")]
    Payload(#[from] serde_json::Error),
}

pub fn encode(msg: &HostMessage) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(msg)?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    frame.extend_from_slice(&SYNC);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&payload);
    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

pub fn decode(bytes: &[u8]) -> Result<HostMessage, FrameError> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(FrameError::Truncated(bytes.len()));
    }
    if bytes[..2] != SYNC {
        return Err(FrameError::BadSync);
    }
    let declared = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    let actual = bytes.len() - HEADER_LEN - TRAILER_LEN;
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }
    let (body, trailer) = bytes.split_at(bytes.len() - TRAILER_LEN);
    let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != crc {
        return Err(FrameError::CrcMismatch);
    }
    Ok(serde_json::from_slice(&body[HEADER_LEN..])?)
}
