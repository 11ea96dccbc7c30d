//! Binary upload frames: 4-byte big-endian header length + JSON header + raw payload.

use serde::{Deserialize, Serialize};

/// Header for binary upload chunks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadFrameHeader {
    /// The payload is the final chunk; the upload completes after it.
    #[serde(default)]
    pub last: bool,
}

/// Parsed binary upload frame.
#[derive(Debug)]
pub struct UploadFrame {
    pub header: UploadFrameHeader,
    pub data: Vec<u8>,
}

/// Parses a raw binary WebSocket frame into an [`UploadFrame`].
///
/// Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON][rest: payload]`
pub fn parse_upload_frame(data: &[u8]) -> Result<UploadFrame, ParseError> {
    if data.len() < 4 {
        return Err(ParseError::TooShort);
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if data.len() - 4 < header_len {
        return Err(ParseError::HeaderTruncated {
            expected: header_len,
            got: data.len() - 4,
        });
    }

    let header_bytes = &data[4..4 + header_len];
    let header = if header_bytes.is_empty() {
        UploadFrameHeader::default()
    } else {
        serde_json::from_slice(header_bytes).map_err(|e| ParseError::InvalidJson(e.to_string()))?
    };

    Ok(UploadFrame {
        header,
        data: data[4 + header_len..].to_vec(),
    })
}

/// Encodes an upload frame for sending over WebSocket.
pub fn encode_upload_frame(
    header: &UploadFrameHeader,
    payload: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Errors from binary frame parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}
