use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time allowed to write a WebSocket message.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(30);

/// Time to wait for a pong response (or any incoming message).
///
/// This acts as a read deadline: if *nothing* arrives within this window
/// the party is considered gone and the disconnect path runs, which
/// releases its identity and aborts any tunnel it was part of.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often the server pings each party.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Maximum message size in bytes (16 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Number of decimal digits in a freshly allocated identity.
pub const IDENTITY_DIGITS: usize = 6;

/// Length of a tunnel identifier.
pub const TUNNEL_ID_LEN: usize = 32;

/// Alphabet tunnel identifiers are drawn from.
pub const TUNNEL_ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Path prefix of the download endpoint (`GET /tunnel/{id}`).
pub const TUNNEL_PATH_PREFIX: &str = "/tunnel/";

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Party -> server
    #[serde(rename = "identity_request")]
    IdentityRequest,
    #[serde(rename = "state_reply")]
    StateReply,
    #[serde(rename = "connect_request")]
    ConnectRequest,
    #[serde(rename = "connect_reject")]
    ConnectReject,
    #[serde(rename = "connect_accept")]
    ConnectAccept,
    #[serde(rename = "transfer_request")]
    TransferRequest,
    #[serde(rename = "transfer_reject")]
    TransferReject,
    #[serde(rename = "transfer_accept")]
    TransferAccept,
    #[serde(rename = "upload_chunk")]
    UploadChunk,
    #[serde(rename = "upload_complete")]
    UploadComplete,
    #[serde(rename = "ping")]
    Ping,

    // Server -> party
    #[serde(rename = "state_query")]
    StateQuery,
    #[serde(rename = "identity_reply")]
    IdentityReply,
    #[serde(rename = "connect_reply")]
    ConnectReply,
    #[serde(rename = "incoming_connect")]
    IncomingConnect,
    #[serde(rename = "transfer_reply")]
    TransferReply,
    #[serde(rename = "incoming_transfer")]
    IncomingTransfer,
    #[serde(rename = "pull_more")]
    PullMore,
    #[serde(rename = "tunnel_closed")]
    TunnelClosed,
    #[serde(rename = "tunnel_aborted")]
    TunnelAborted,
    #[serde(rename = "force_refresh")]
    ForceRefresh,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Handshake status carried by `connect_reply` and `transfer_reply`.
///
/// Each code belongs to exactly one transition of the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum Status {
    /// The partner accepted (sent to the initiator).
    Accepted,
    /// The request was delivered to the target.
    Sent,
    /// The target is already busy with another negotiation.
    Busy,
    /// The partner rejected the request.
    Rejected,
    /// Acceptance confirmed to the accepting party itself.
    Confirmed,
    /// The partner is not in a phase that allows the request.
    InvalidPartnerState,
    /// No party with that identity, or the partner vanished.
    NotFound,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Accepted => 200,
            Status::Sent => 201,
            Status::Busy => 202,
            Status::Rejected => 204,
            Status::Confirmed => 300,
            Status::InvalidPartnerState => 403,
            Status::NotFound => 404,
        }
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

impl TryFrom<u16> for Status {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            200 => Ok(Status::Accepted),
            201 => Ok(Status::Sent),
            202 => Ok(Status::Busy),
            204 => Ok(Status::Rejected),
            300 => Ok(Status::Confirmed),
            403 => Ok(Status::InvalidPartnerState),
            404 => Ok(Status::NotFound),
            other => Err(format!("unknown status code {other}")),
        }
    }
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
