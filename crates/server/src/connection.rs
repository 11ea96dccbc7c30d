//! Party connection management: read/write pumps, ping/pong, send buffering.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tunnelshare_protocol::constants::{
    MessageType, WS_ERR_CODE_NOT_IMPLEMENTED, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
    WS_WRITE_WAIT,
};
use tunnelshare_protocol::envelope::Message;
use tunnelshare_protocol::parse_upload_frame;
use tunnelshare_relay::ConnId;

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

/// Handle for sending messages to one connected party.
///
/// Cloneable; wraps an `mpsc::Sender` drained by the write pump.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` if the buffer is full or the party is gone.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// A sender whose frames land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Runs the read and write pumps for an upgraded WebSocket.
///
/// The handler sees `on_connect` before the first dispatched message and
/// `on_disconnect` exactly once, after the read pump has stopped. Both
/// pumps stop when the socket closes or the cancel token fires.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    conn: ConnId,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> Sender
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_sender = sender.clone();
    tokio::spawn(async move {
        handler.on_connect(conn, read_sender.clone()).await;
        read_pump(ws_stream, conn, read_sender, Arc::clone(&handler), cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        cancel.cancel();
        handler.on_disconnect(conn).await;
        tracing::info!(%conn, "party disconnected");
    });

    sender
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => match msg {
                Some(ws_msg) => ws_msg,
                None => break,
            },

            _ = ping_interval.tick() => WsMessage::Ping(Vec::new().into()),
        };

        match tokio::time::timeout(WS_WRITE_WAIT, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("write pump send error: {e}");
                break;
            }
            Err(_) => {
                tracing::warn!("write pump timed out");
                break;
            }
        }
    }

    // Stop the read pump as well; a party we cannot write to is gone.
    cancel.cancel();
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches to the handler.
async fn read_pump<S, H>(
    mut stream: S,
    conn: ConnId,
    sender: Sender,
    handler: Arc<H>,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut liveness = tokio::time::interval(WS_PONG_WAIT);
    liveness.reset();
    let mut heard = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = liveness.tick() => {
                if !heard {
                    tracing::warn!(%conn, "pong timeout, closing connection");
                    break;
                }
                heard = false;
            }

            frame = stream.next() => {
                let ws_msg = match frame {
                    Some(Ok(ws_msg)) => ws_msg,
                    Some(Err(e)) => {
                        tracing::debug!(%conn, "read pump error: {e}");
                        break;
                    }
                    None => break,
                };
                heard = true;

                match ws_msg {
                    WsMessage::Text(text) => {
                        if text.len() > WS_MAX_MESSAGE_SIZE {
                            tracing::error!(%conn, "message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                            continue;
                        }
                        dispatch_text(&handler, conn, &sender, &text).await;
                    }
                    WsMessage::Binary(data) => {
                        if data.len() > WS_MAX_MESSAGE_SIZE {
                            tracing::error!(%conn, "binary message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                            continue;
                        }
                        dispatch_binary(&handler, conn, &sender, &data).await;
                    }
                    WsMessage::Pong(_) => liveness.reset(),
                    WsMessage::Ping(data) => {
                        let _ = sender.tx.try_send(WsMessage::Pong(data));
                    }
                    WsMessage::Close(_) => {
                        tracing::debug!(%conn, "received close frame");
                        break;
                    }
                    WsMessage::Frame(_) => {}
                }
            }
        }
    }
}

/// Dispatches a text (JSON) message to the appropriate handler method.
async fn dispatch_text<H: Handler>(handler: &Arc<H>, conn: ConnId, sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(%conn, "invalid message JSON: {e}");
            return;
        }
    };

    let s = sender.clone();
    match msg.msg_type {
        MessageType::IdentityRequest => handler.on_identity_request(conn, s, msg).await,
        MessageType::StateReply => handler.on_state_reply(conn, s, msg).await,
        MessageType::ConnectRequest => handler.on_connect_request(conn, s, msg).await,
        MessageType::ConnectReject => handler.on_connect_reject(conn, s, msg).await,
        MessageType::ConnectAccept => handler.on_connect_accept(conn, s, msg).await,
        MessageType::TransferRequest => handler.on_transfer_request(conn, s, msg).await,
        MessageType::TransferReject => handler.on_transfer_reject(conn, s, msg).await,
        MessageType::TransferAccept => handler.on_transfer_accept(conn, s, msg).await,
        MessageType::UploadChunk => handler.on_upload_chunk(conn, s, msg).await,
        MessageType::UploadComplete => handler.on_upload_complete(conn, s, msg).await,
        MessageType::Ping => handler.on_ping(conn, s, msg).await,
        _ => {
            tracing::warn!(%conn, msg_type = ?msg.msg_type, "unhandled message type");
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
        }
    }
}

/// Dispatches a binary upload frame to the handler.
async fn dispatch_binary<H: Handler>(handler: &Arc<H>, conn: ConnId, sender: &Sender, data: &[u8]) {
    match parse_upload_frame(data) {
        Ok(frame) => handler.on_upload_frame(conn, sender.clone(), frame).await,
        Err(e) => tracing::warn!(%conn, "failed to parse binary frame: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_error_display() {
        let err = SendError;
        assert!(err.to_string().contains("buffer full"));
    }

    #[tokio::test]
    async fn send_msg_queues_json_text() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = Sender { tx };
        let msg = Message::push(MessageType::PullMore, Option::<&()>::None).unwrap();
        sender.send_msg(msg).unwrap();

        let Some(WsMessage::Text(text)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "pull_more");
        assert_eq!(json["id"], "");
    }

    #[test]
    fn send_fails_once_closed() {
        let (tx, rx) = mpsc::channel(1);
        let sender = Sender { tx };
        drop(rx);
        assert!(!sender.is_connected());
        let msg = Message::push(MessageType::Pong, Option::<&()>::None).unwrap();
        assert!(sender.send_msg(msg).is_err());
    }

    #[test]
    fn send_fails_when_buffer_full() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = Sender { tx };
        let msg = Message::push(MessageType::Pong, Option::<&()>::None).unwrap();
        assert!(sender.send_msg(msg.clone()).is_ok());
        assert!(sender.send_msg(msg).is_err());
    }
}
