//! Handler trait for processing party messages.
//!
//! Implementors provide the negotiation logic while the server framework
//! handles sockets, routing, keepalive and the binary frame format.

use std::future::Future;
use std::pin::Pin;

use tokio::io::AsyncWriteExt;
use tunnelshare_protocol::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
use tunnelshare_protocol::envelope::Message;
use tunnelshare_protocol::{MessageType, UploadFrame};
use tunnelshare_relay::ConnId;

use crate::connection::Sender;
use crate::download::{self, DownloadRequest};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling traffic from connected parties.
///
/// Each message method receives the connection handle, a [`Sender`] back
/// to that party and the parsed JSON envelope. Default implementations
/// reply with "not implemented" so handlers only override what they
/// support.
pub trait Handler: Send + Sync + 'static {
    /// Called once a WebSocket is established, before any message.
    fn on_connect(&self, conn: ConnId, sender: Sender) -> HandlerFuture<'_>;

    /// Called exactly once when the connection's read pump stops.
    fn on_disconnect(&self, conn: ConnId) -> HandlerFuture<'_>;

    fn on_identity_request(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(conn, sender, msg)
    }

    fn on_state_reply(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(conn, sender, msg)
    }

    fn on_connect_request(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(conn, sender, msg)
    }

    fn on_connect_reject(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(conn, sender, msg)
    }

    fn on_connect_accept(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(conn, sender, msg)
    }

    fn on_transfer_request(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(conn, sender, msg)
    }

    fn on_transfer_reject(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(conn, sender, msg)
    }

    fn on_transfer_accept(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(conn, sender, msg)
    }

    /// Called for `upload_chunk` (base64 data inside the JSON payload).
    fn on_upload_chunk(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(conn, sender, msg)
    }

    fn on_upload_complete(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(conn, sender, msg)
    }

    /// Called for `ping` messages.
    fn on_ping(&self, _conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for a binary upload frame.
    fn on_upload_frame(&self, conn: ConnId, sender: Sender, frame: UploadFrame) -> HandlerFuture<'_> {
        let _ = (sender, frame);
        Box::pin(async move {
            // No message id available for binary; log and drop.
            tracing::warn!(%conn, "binary frame received but handler not implemented");
        })
    }

    /// Called for `GET /tunnel/{id}`. The handler owns the socket and
    /// writes the whole HTTP response.
    fn on_download(&self, request: DownloadRequest) -> HandlerFuture<'_> {
        Box::pin(async move {
            let mut stream = request.into_stream();
            let _ = download::write_not_found(&mut stream).await;
            let _ = stream.shutdown().await;
        })
    }
}

fn not_implemented<'a>(conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'a> {
    Box::pin(async move {
        tracing::debug!(%conn, msg_type = ?msg.msg_type, "message not implemented");
        let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
    })
}
