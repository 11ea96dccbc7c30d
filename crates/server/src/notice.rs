//! Encoding of relay notices as wire messages.

use tunnelshare_protocol::MessageType;
use tunnelshare_protocol::envelope::Message;
use tunnelshare_protocol::messages::{
    ConnectReply, ForceRefresh, IdentityReply, IncomingConnect, TransferReply,
};
use tunnelshare_relay::Notice;

/// Builds the message for `notice`, carrying `id` (empty for pushes).
pub fn encode_notice(notice: &Notice, id: &str) -> Result<Message, serde_json::Error> {
    const NONE: Option<&()> = None;
    match notice {
        Notice::StateQuery => Message::new(id, MessageType::StateQuery, NONE),
        Notice::IdentityReply { identity } => Message::new(
            id,
            MessageType::IdentityReply,
            Some(&IdentityReply {
                identity: identity.to_string(),
            }),
        ),
        Notice::ConnectReply { status } => Message::new(
            id,
            MessageType::ConnectReply,
            Some(&ConnectReply { status: *status }),
        ),
        Notice::IncomingConnect { partner } => Message::new(
            id,
            MessageType::IncomingConnect,
            Some(&IncomingConnect {
                partner_id: partner.to_string(),
            }),
        ),
        Notice::TransferReply { status, tunnel_id } => Message::new(
            id,
            MessageType::TransferReply,
            Some(&TransferReply {
                status: *status,
                tunnel_id: tunnel_id.as_ref().map(ToString::to_string),
            }),
        ),
        Notice::IncomingTransfer(file) => Message::new(id, MessageType::IncomingTransfer, Some(file)),
        Notice::PullMore => Message::new(id, MessageType::PullMore, NONE),
        Notice::TunnelClosed => Message::new(id, MessageType::TunnelClosed, NONE),
        Notice::TunnelAborted => Message::new(id, MessageType::TunnelAborted, NONE),
        Notice::ForceRefresh { reason } => Message::new(
            id,
            MessageType::ForceRefresh,
            Some(&ForceRefresh {
                reason: reason.clone(),
            }),
        ),
    }
}
