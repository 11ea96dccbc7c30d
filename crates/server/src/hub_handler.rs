//! [`Handler`] implementation backed by the pairing [`Hub`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use tunnelshare_protocol::constants::{WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_INTERNAL};
use tunnelshare_protocol::envelope::Message;
use tunnelshare_protocol::messages::{ConnectRequest, StateReply, UploadChunk};
use tunnelshare_protocol::{FileMeta, UploadFrame};
use tunnelshare_relay::{ConnId, Delivery, Hub, Notice, TunnelId};

use crate::connection::Sender;
use crate::download::{self, DownloadRequest};
use crate::handler::{Handler, HandlerFuture};
use crate::notice::encode_notice;

/// Outbound handles of every connected party.
#[derive(Clone, Default)]
struct Peers(Arc<Mutex<HashMap<ConnId, Sender>>>);

impl Peers {
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, Sender>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `notice` to `to`. Returns `false` if it could not be queued.
    fn send(&self, to: ConnId, notice: &Notice, id: &str) -> bool {
        let peers = self.lock();
        let Some(sender) = peers.get(&to) else {
            debug!(conn = %to, ?notice, "notice for departed party dropped");
            return false;
        };
        match encode_notice(notice, id) {
            Ok(msg) => sender.send_msg(msg).is_ok(),
            Err(e) => {
                error!(conn = %to, "failed to encode notice: {e}");
                false
            }
        }
    }

    /// Sends every delivery to its party. Notices addressed to the party
    /// that made request `reply_to` echo that request's id.
    fn deliver(&self, deliveries: Vec<Delivery>, reply_to: Option<(ConnId, &str)>) {
        for delivery in deliveries {
            let id = match reply_to {
                Some((conn, id)) if conn == delivery.to => id,
                _ => "",
            };
            self.send(delivery.to, &delivery.notice, id);
        }
    }
}

/// Routes party traffic into the hub and delivers the resulting notices.
pub struct HubHandler {
    hub: Arc<Hub>,
    peers: Peers,
}

impl HubHandler {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            peers: Peers::default(),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    fn deliver(&self, deliveries: Vec<Delivery>, reply_to: Option<(ConnId, &str)>) {
        self.peers.deliver(deliveries, reply_to);
    }

    fn reply(&self, conn: ConnId, msg: &Message, deliveries: Vec<Delivery>) {
        self.deliver(deliveries, Some((conn, msg.id.as_str())));
    }

    /// Aborts `tunnel_id` if no download has claimed it within the idle
    /// timeout, so both parties can pair again.
    fn expire_if_unclaimed(&self, tunnel_id: TunnelId) {
        let Some(limit) = self.hub.config().tunnel_idle_timeout else {
            return;
        };
        let hub = Arc::clone(&self.hub);
        let peers = self.peers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let deliveries = hub.expire_unclaimed(tunnel_id.as_str());
            if !deliveries.is_empty() {
                info!(tunnel = %tunnel_id, "tunnel expired without a download");
            }
            peers.deliver(deliveries, None);
        });
    }

    /// Parses the payload of `msg`, answering 400 when it is missing or
    /// malformed.
    fn payload<T: for<'de> serde::Deserialize<'de>>(
        conn: ConnId,
        sender: &Sender,
        msg: &Message,
    ) -> Option<T> {
        match msg.parse_payload::<T>() {
            Ok(Some(payload)) => Some(payload),
            Ok(None) => {
                debug!(%conn, msg_type = ?msg.msg_type, "missing payload");
                let _ = sender.send_error(msg, WS_ERR_CODE_BAD_REQUEST, "missing payload");
                None
            }
            Err(e) => {
                debug!(%conn, msg_type = ?msg.msg_type, "invalid payload: {e}");
                let _ = sender.send_error(msg, WS_ERR_CODE_BAD_REQUEST, &format!("invalid payload: {e}"));
                None
            }
        }
    }
}

impl Handler for HubHandler {
    fn on_connect(&self, conn: ConnId, sender: Sender) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.peers.lock().insert(conn, sender.clone());
            match self.hub.connect(conn) {
                Ok((_identity, deliveries)) => self.deliver(deliveries, None),
                Err(e) => {
                    error!(%conn, "could not register party: {e}");
                    self.peers.lock().remove(&conn);
                    let _ = sender.send_msg(Message::error("", WS_ERR_CODE_INTERNAL, e.to_string()));
                }
            }
        })
    }

    fn on_disconnect(&self, conn: ConnId) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.peers.lock().remove(&conn);
            let deliveries = self.hub.disconnect(conn);
            self.deliver(deliveries, None);
        })
    }

    fn on_identity_request(&self, conn: ConnId, _sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.reply(conn, &msg, self.hub.identity_request(conn));
        })
    }

    fn on_state_reply(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Some(reply) = Self::payload::<StateReply>(conn, &sender, &msg) {
                self.reply(conn, &msg, self.hub.state_reply(conn, reply.state));
            }
        })
    }

    fn on_connect_request(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Some(req) = Self::payload::<ConnectRequest>(conn, &sender, &msg) {
                self.reply(conn, &msg, self.hub.connect_request(conn, &req.target_id));
            }
        })
    }

    fn on_connect_reject(&self, conn: ConnId, _sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.reply(conn, &msg, self.hub.connect_reject(conn));
        })
    }

    fn on_connect_accept(&self, conn: ConnId, _sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.reply(conn, &msg, self.hub.connect_accept(conn));
        })
    }

    fn on_transfer_request(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Some(file) = Self::payload::<FileMeta>(conn, &sender, &msg) {
                self.reply(conn, &msg, self.hub.transfer_request(conn, file));
            }
        })
    }

    fn on_transfer_reject(&self, conn: ConnId, _sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.reply(conn, &msg, self.hub.transfer_reject(conn));
        })
    }

    fn on_transfer_accept(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            match self.hub.transfer_accept(conn) {
                Ok(deliveries) => {
                    let opened = deliveries.iter().find_map(|d| match &d.notice {
                        Notice::TransferReply {
                            tunnel_id: Some(id),
                            ..
                        } => Some(id.clone()),
                        _ => None,
                    });
                    self.reply(conn, &msg, deliveries);
                    if let Some(tunnel_id) = opened {
                        self.expire_if_unclaimed(tunnel_id);
                    }
                }
                Err(e) => {
                    error!(%conn, "could not open tunnel: {e}");
                    let _ = sender.send_error(&msg, WS_ERR_CODE_INTERNAL, &e.to_string());
                }
            }
        })
    }

    fn on_upload_chunk(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Some(chunk) = Self::payload::<UploadChunk>(conn, &sender, &msg) {
                self.hub.upload_chunk(conn, chunk.data);
            }
        })
    }

    fn on_upload_complete(&self, conn: ConnId, _sender: Sender, _msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.hub.upload_complete(conn);
        })
    }

    fn on_upload_frame(&self, conn: ConnId, _sender: Sender, frame: UploadFrame) -> HandlerFuture<'_> {
        Box::pin(async move {
            if !frame.data.is_empty() {
                self.hub.upload_chunk(conn, frame.data);
            }
            if frame.header.last {
                self.hub.upload_complete(conn);
            }
        })
    }

    fn on_download(&self, request: DownloadRequest) -> HandlerFuture<'_> {
        Box::pin(async move {
            let peer = request.peer();
            let Some(tunnel) = self.hub.claim_tunnel(request.tunnel_id()) else {
                debug!(%peer, tunnel = request.tunnel_id(), "download of invalid tunnel");
                let mut stream = request.into_stream();
                let _ = download::write_not_found(&mut stream).await;
                let _ = stream.shutdown().await;
                return;
            };

            let tunnel_id = tunnel.id().clone();
            let uploader = tunnel.uploader();
            info!(%peer, tunnel = %tunnel_id, file = %tunnel.file().name, "download started");

            let pulled = Arc::clone(&tunnel);
            let pull_more = || {
                if !self.peers.send(uploader, &Notice::PullMore, "") {
                    warn!(tunnel = %pulled.id(), %uploader, "uploader unreachable, aborting tunnel");
                    pulled.abort();
                }
            };
            let outcome = download::stream_tunnel(
                tunnel,
                request.into_stream(),
                pull_more,
                self.hub.config().tunnel_idle_timeout,
            )
            .await;

            info!(%peer, tunnel = %tunnel_id, ?outcome, "download ended");
            let deliveries = self.hub.finish_tunnel(tunnel_id.as_str(), outcome);
            self.deliver(deliveries, None);
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
    use tunnelshare_protocol::MessageType;
    use tunnelshare_relay::{HubConfig, Phase};

    use super::*;

    fn handler() -> HubHandler {
        HubHandler::new(Hub::new(HubConfig::default()))
    }

    async fn join(handler: &HubHandler, n: u64) -> (ConnId, Sender, mpsc::Receiver<WsMessage>) {
        join_with_capacity(handler, n, 16).await
    }

    async fn join_with_capacity(
        handler: &HubHandler,
        n: u64,
        capacity: usize,
    ) -> (ConnId, Sender, mpsc::Receiver<WsMessage>) {
        let conn = ConnId(n);
        let (sender, mut rx) = Sender::channel(capacity);
        handler.on_connect(conn, sender.clone()).await;
        assert_eq!(next(&mut rx)["type"], "state_query");
        (conn, sender, rx)
    }

    fn next(rx: &mut mpsc::Receiver<WsMessage>) -> Value {
        match rx.try_recv() {
            Ok(WsMessage::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    fn request(id: &str, msg_type: MessageType, payload: Option<&Value>) -> Message {
        Message::new(id, msg_type, payload).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<WsMessage>) {
        while rx.try_recv().is_ok() {}
    }

    type Party<'a> = (ConnId, &'a Sender, &'a mut mpsc::Receiver<WsMessage>);

    /// Bonds `a` and `b`, has `a` offer a file and `b` accept it. Every
    /// reply is drained as it arrives. Returns the tunnel id.
    async fn open_tunnel(handler: &HubHandler, a: Party<'_>, b: Party<'_>) -> String {
        let (a, a_tx, a_rx) = a;
        let (b, b_tx, b_rx) = b;
        let b_identity = handler.hub().snapshot(b).unwrap().identity;

        let target = serde_json::json!({ "targetId": b_identity.as_str() });
        handler
            .on_connect_request(a, a_tx.clone(), request("", MessageType::ConnectRequest, Some(&target)))
            .await;
        drain(a_rx);
        drain(b_rx);
        handler
            .on_connect_accept(b, b_tx.clone(), request("", MessageType::ConnectAccept, None))
            .await;
        drain(a_rx);
        drain(b_rx);

        let file = serde_json::json!({ "name": "x.txt", "size": 5, "type": "text/plain" });
        handler
            .on_transfer_request(a, a_tx.clone(), request("", MessageType::TransferRequest, Some(&file)))
            .await;
        drain(a_rx);
        drain(b_rx);
        handler
            .on_transfer_accept(b, b_tx.clone(), request("t2", MessageType::TransferAccept, None))
            .await;
        drain(a_rx);
        let confirmed = next(b_rx);
        assert_eq!(confirmed["payload"]["status"], 300);
        confirmed["payload"]["tunnelId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn replies_echo_request_id_and_pushes_do_not() {
        let handler = handler();
        let (a, a_tx, mut a_rx) = join(&handler, 1).await;
        let (b, b_tx, mut b_rx) = join(&handler, 2).await;

        handler
            .on_identity_request(b, b_tx.clone(), request("who", MessageType::IdentityRequest, None))
            .await;
        let reply = next(&mut b_rx);
        assert_eq!(reply["id"], "who");
        let b_identity = reply["payload"]["identity"].as_str().unwrap().to_string();

        let payload = serde_json::json!({ "targetId": b_identity });
        handler
            .on_connect_request(a, a_tx, request("c1", MessageType::ConnectRequest, Some(&payload)))
            .await;
        let sent = next(&mut a_rx);
        assert_eq!(sent["id"], "c1");
        assert_eq!(sent["payload"]["status"], 201);
        let incoming = next(&mut b_rx);
        assert_eq!(incoming["type"], "incoming_connect");
        assert_eq!(incoming["id"], "");

        handler
            .on_connect_accept(b, b_tx, request("c2", MessageType::ConnectAccept, None))
            .await;
        let accepted = next(&mut a_rx);
        assert_eq!((accepted["id"].as_str(), accepted["payload"]["status"].as_u64()), (Some(""), Some(200)));
        let confirmed = next(&mut b_rx);
        assert_eq!((confirmed["id"].as_str(), confirmed["payload"]["status"].as_u64()), (Some("c2"), Some(300)));
    }

    #[tokio::test]
    async fn malformed_payload_is_a_bad_request() {
        let handler = handler();
        let (a, a_tx, mut a_rx) = join(&handler, 1).await;
        let payload = serde_json::json!({ "wrong": true });
        handler
            .on_connect_request(a, a_tx, request("c1", MessageType::ConnectRequest, Some(&payload)))
            .await;
        let reply = next(&mut a_rx);
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["id"], "c1");
        assert_eq!(reply["error"]["code"], 400);
    }

    #[tokio::test]
    async fn disconnect_refreshes_partner() {
        let handler = handler();
        let (a, a_tx, mut a_rx) = join(&handler, 1).await;
        let (b, b_tx, mut b_rx) = join(&handler, 2).await;
        let b_identity = handler.hub().snapshot(b).unwrap().identity;

        let payload = serde_json::json!({ "targetId": b_identity.as_str() });
        handler
            .on_connect_request(a, a_tx, request("", MessageType::ConnectRequest, Some(&payload)))
            .await;
        handler
            .on_connect_accept(b, b_tx, request("", MessageType::ConnectAccept, None))
            .await;
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}

        handler.on_disconnect(a).await;
        let refresh = next(&mut b_rx);
        assert_eq!(refresh["type"], "force_refresh");
        assert_eq!(handler.hub().connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_tunnel_is_aborted_after_idle_timeout() {
        let handler = HubHandler::new(Hub::new(HubConfig {
            tunnel_idle_timeout: Some(Duration::from_secs(30)),
            ..HubConfig::default()
        }));
        let (a, a_tx, mut a_rx) = join(&handler, 1).await;
        let (b, b_tx, mut b_rx) = join(&handler, 2).await;
        let tunnel_id = open_tunnel(&handler, (a, &a_tx, &mut a_rx), (b, &b_tx, &mut b_rx)).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(handler.hub().tunnel_exists(&tunnel_id));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!handler.hub().tunnel_exists(&tunnel_id));
        assert_eq!(next(&mut a_rx)["type"], "tunnel_aborted");
        assert_eq!(next(&mut b_rx)["type"], "tunnel_aborted");
        assert_eq!(handler.hub().snapshot(a).unwrap().phase, Phase::Idle);
        assert_eq!(handler.hub().snapshot(b).unwrap().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn unreachable_uploader_aborts_the_download() {
        let handler = handler();
        let (a, a_tx, mut a_rx) = join_with_capacity(&handler, 1, 1).await;
        let (b, b_tx, mut b_rx) = join(&handler, 2).await;
        let tunnel_id = open_tunnel(&handler, (a, &a_tx, &mut a_rx), (b, &b_tx, &mut b_rx)).await;

        // The uploader's send buffer is full, so no pull request can reach it.
        a_tx.send_msg(Message::error("", 0, "filler")).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        handler
            .on_download(DownloadRequest::new(tunnel_id.clone(), peer, stream))
            .await;

        assert!(!handler.hub().tunnel_exists(&tunnel_id));
        assert_eq!(next(&mut b_rx)["type"], "tunnel_aborted");
        assert_eq!(handler.hub().snapshot(a).unwrap().phase, Phase::Idle);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }
}
