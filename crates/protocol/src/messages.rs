use serde::{Deserialize, Serialize};

use crate::constants::Status;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Asks the server to pair with the party holding `target_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub target_id: String,
}

/// The phase a party believes it is in, sent in answer to `state_query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReply {
    pub state: u8,
}

/// Descriptive metadata of the offered file. Not checked against the
/// bytes actually streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub content_type: String,
}

/// A chunk of file data pushed by the uploader.
///
/// The `data` field is base64-encoded in JSON. Binary frames carry the
/// same chunk without the encoding overhead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadChunk {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Server payloads
// ---------------------------------------------------------------------------

/// Identity assigned to the party for this connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityReply {
    pub identity: String,
}

/// Outcome of a pairing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectReply {
    pub status: Status,
}

/// Tells the target that someone wants to pair with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingConnect {
    pub partner_id: String,
}

/// Outcome of a transfer negotiation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
}

/// Asks the party to reload and start over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceRefresh {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
