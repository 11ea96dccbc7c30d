//! Network front of the tunnelshare relay.
//!
//! One TCP listener serves two surfaces: parties connect over WebSocket
//! and exchange JSON envelopes (plus binary upload frames), while the
//! receiving side pulls a tunnel's bytes with a plain `GET /tunnel/{id}`.
//! Messages are dispatched to a [`Handler`]; [`HubHandler`] wires them to
//! the pairing hub.

mod connection;
mod download;
mod handler;
mod hub_handler;
mod notice;
mod server;

pub use connection::{SendError, Sender, spawn_connection};
pub use download::{DownloadRequest, content_disposition};
pub use handler::{Handler, HandlerFuture};
pub use hub_handler::HubHandler;
pub use notice::encode_notice;
pub use server::{RelayServer, ServerConfig};

/// Send buffer capacity per connection.
///
/// An uploader gets at most one `pull_more` per flushed chunk, so the
/// buffer only has to absorb negotiation traffic and the odd pong.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed HTTP request: {0}")]
    BadRequest(String),

    #[error("timed out waiting for the request head")]
    HeadTimeout,
}
