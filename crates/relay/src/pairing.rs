//! Pairing negotiation state machine.
//!
//! Drives connect request/accept/reject and transfer request/accept/reject
//! between two connections. Every operation mutates the stores and returns
//! the notices the transport must deliver, in order. An event whose
//! precondition does not hold is ignored: under races (a partner that
//! just left or moved on) the caller simply gets no answer.

use tracing::{debug, info};
use tunnelshare_protocol::{FileMeta, Status};

use crate::identity::IdentityRegistry;
use crate::relay::RelayOutcome;
use crate::session::{ConnectionState, Phase, SessionStore};
use crate::tunnel::TunnelRegistry;
use crate::{ConnId, Identity, RelayError, TunnelId};

/// Server-to-party event produced by the negotiation.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Ask a freshly connected party which phase it thinks it is in.
    StateQuery,
    IdentityReply { identity: Identity },
    ConnectReply { status: Status },
    IncomingConnect { partner: Identity },
    TransferReply {
        status: Status,
        tunnel_id: Option<TunnelId>,
    },
    IncomingTransfer(FileMeta),
    /// Ask the uploader for the next chunk.
    PullMore,
    TunnelClosed,
    TunnelAborted,
    ForceRefresh { reason: String },
}

/// A notice addressed to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: ConnId,
    pub notice: Notice,
}

impl Delivery {
    pub fn new(to: ConnId, notice: Notice) -> Self {
        Self { to, notice }
    }
}

const PARTNER_LEFT: &str = "Your partner decided to disconnect";
const STALE_SESSION: &str = "Stale session, please reload";

/// Owns identities, connection states and tunnels, and applies the
/// negotiation rules to them.
#[derive(Debug)]
pub struct PairingEngine {
    identities: IdentityRegistry,
    sessions: SessionStore,
    tunnels: TunnelRegistry,
}

impl PairingEngine {
    pub fn new(identity_digits: usize) -> Self {
        Self::with_registry(IdentityRegistry::new(identity_digits))
    }

    pub fn with_registry(identities: IdentityRegistry) -> Self {
        Self {
            identities,
            sessions: SessionStore::new(),
            tunnels: TunnelRegistry::new(),
        }
    }

    pub fn identities(&self) -> &IdentityRegistry {
        &self.identities
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn tunnels(&self) -> &TunnelRegistry {
        &self.tunnels
    }

    pub fn state(&self, conn: ConnId) -> Option<&ConnectionState> {
        self.sessions.get(conn)
    }

    /// Registers a new connection with a fresh identity and an Idle state.
    pub fn connect(&mut self, conn: ConnId) -> Result<(Identity, Vec<Delivery>), RelayError> {
        if self.sessions.contains(conn) {
            return Err(RelayError::AlreadyConnected(conn));
        }
        let identity = self.identities.allocate(conn)?;
        self.sessions.insert(conn, identity.clone());
        info!(%conn, %identity, "party connected");
        Ok((identity, vec![Delivery::new(conn, Notice::StateQuery)]))
    }

    pub fn identity_request(&self, conn: ConnId) -> Vec<Delivery> {
        match self.sessions.get(conn) {
            Some(state) => vec![Delivery::new(
                conn,
                Notice::IdentityReply {
                    identity: state.identity.clone(),
                },
            )],
            None => Vec::new(),
        }
    }

    /// A party that reports a non-Idle phase on a fresh connection is a
    /// leftover from an earlier session and must reload.
    pub fn state_reply(&self, conn: ConnId, reported: u8) -> Vec<Delivery> {
        if !self.sessions.contains(conn) || reported == Phase::Idle.code() {
            return Vec::new();
        }
        debug!(%conn, reported, "stale client state");
        vec![Delivery::new(
            conn,
            Notice::ForceRefresh {
                reason: STALE_SESSION.into(),
            },
        )]
    }

    pub fn connect_request(&mut self, conn: ConnId, target_id: &str) -> Vec<Delivery> {
        let Some(requester) = self.sessions.get(conn) else {
            return Vec::new();
        };
        if requester.phase != Phase::Idle {
            debug!(%conn, phase = ?requester.phase, "connect request while not idle ignored");
            return Vec::new();
        }
        let requester_identity = requester.identity.clone();
        self.sessions.set_phase(conn, Phase::Requesting);

        let reply = |status| vec![Delivery::new(conn, Notice::ConnectReply { status })];

        let Some(target) = self.identities.lookup(target_id) else {
            self.sessions.set_phase(conn, Phase::Idle);
            debug!(%conn, target = target_id, "connect request to unknown identity");
            return reply(Status::NotFound);
        };
        if target == conn || self.sessions.phase(target) != Some(Phase::Idle) {
            self.sessions.set_phase(conn, Phase::Idle);
            debug!(%conn, %target, "connect request to busy target");
            return reply(Status::Busy);
        }

        self.sessions.set_phase(target, Phase::AwaitingDecision);
        self.sessions.pair(conn, target);
        debug!(%conn, %target, "connect request sent");

        vec![
            Delivery::new(
                conn,
                Notice::ConnectReply {
                    status: Status::Sent,
                },
            ),
            Delivery::new(
                target,
                Notice::IncomingConnect {
                    partner: requester_identity,
                },
            ),
        ]
    }

    pub fn connect_reject(&mut self, conn: ConnId) -> Vec<Delivery> {
        let Some(partner) = self.deciding_partner(conn, Phase::AwaitingDecision) else {
            return Vec::new();
        };
        self.sessions.unpair(conn);
        self.sessions.set_phase(partner, Phase::Idle);
        self.sessions.set_phase(conn, Phase::Idle);
        debug!(%conn, %partner, "connect request rejected");
        vec![Delivery::new(
            partner,
            Notice::ConnectReply {
                status: Status::Rejected,
            },
        )]
    }

    pub fn connect_accept(&mut self, conn: ConnId) -> Vec<Delivery> {
        let Some(partner) = self.deciding_partner(conn, Phase::AwaitingDecision) else {
            return Vec::new();
        };
        self.sessions.set_phase(partner, Phase::Bonded);
        self.sessions.set_phase(conn, Phase::Bonded);
        info!(%conn, %partner, "parties bonded");
        vec![
            Delivery::new(
                partner,
                Notice::ConnectReply {
                    status: Status::Accepted,
                },
            ),
            Delivery::new(
                conn,
                Notice::ConnectReply {
                    status: Status::Confirmed,
                },
            ),
        ]
    }

    pub fn transfer_request(&mut self, conn: ConnId, file: FileMeta) -> Vec<Delivery> {
        let Some(state) = self.sessions.get(conn) else {
            return Vec::new();
        };
        if state.phase != Phase::Bonded {
            debug!(%conn, phase = ?state.phase, "transfer request while not bonded ignored");
            return Vec::new();
        }
        let Some(partner_ref) = state.partner else {
            return Vec::new();
        };

        let reply = |status| {
            vec![Delivery::new(
                conn,
                Notice::TransferReply {
                    status,
                    tunnel_id: None,
                },
            )]
        };

        let Some(partner) = self.sessions.get(partner_ref) else {
            // Partner vanished without the disconnect reaching us first.
            self.sessions.reset(conn);
            return reply(Status::NotFound);
        };
        if partner.phase != Phase::Bonded || partner.partner != Some(conn) {
            debug!(%conn, partner = %partner_ref, phase = ?partner.phase, "partner not bonded");
            return reply(Status::InvalidPartnerState);
        }

        self.sessions.set_phase(conn, Phase::Negotiating);
        self.sessions.set_phase(partner_ref, Phase::Negotiating);
        if let Some(state) = self.sessions.get_mut(conn) {
            state.pending_file = Some(file.clone());
        }
        debug!(%conn, partner = %partner_ref, file = %file.name, size = file.size, "file offered");

        vec![
            Delivery::new(
                conn,
                Notice::TransferReply {
                    status: Status::Sent,
                    tunnel_id: None,
                },
            ),
            Delivery::new(partner_ref, Notice::IncomingTransfer(file)),
        ]
    }

    pub fn transfer_reject(&mut self, conn: ConnId) -> Vec<Delivery> {
        let Some(uploader) = self.offering_partner(conn) else {
            return Vec::new();
        };
        if let Some(state) = self.sessions.get_mut(uploader) {
            state.phase = Phase::Bonded;
            state.pending_file = None;
        }
        self.sessions.set_phase(conn, Phase::Bonded);
        debug!(%conn, partner = %uploader, "file offer rejected");
        vec![Delivery::new(
            uploader,
            Notice::TransferReply {
                status: Status::Rejected,
                tunnel_id: None,
            },
        )]
    }

    pub fn transfer_accept(&mut self, conn: ConnId) -> Result<Vec<Delivery>, RelayError> {
        let Some(uploader) = self.offering_partner(conn) else {
            return Ok(Vec::new());
        };
        let Some(file) = self
            .sessions
            .get_mut(uploader)
            .and_then(|s| s.pending_file.take())
        else {
            return Ok(Vec::new());
        };

        let tunnel_id = match self.tunnels.create(uploader, conn, file.clone()) {
            Ok(id) => id,
            Err(e) => {
                // Put the offer back so the parties can retry.
                if let Some(state) = self.sessions.get_mut(uploader) {
                    state.pending_file = Some(file);
                }
                return Err(e);
            }
        };

        for party in [uploader, conn] {
            if let Some(state) = self.sessions.get_mut(party) {
                state.phase = Phase::Streaming;
                state.tunnel_id = Some(tunnel_id.clone());
            }
        }
        info!(tunnel = %tunnel_id, %uploader, downloader = %conn, file = %file.name, "transfer accepted");

        Ok(vec![
            Delivery::new(
                uploader,
                Notice::TransferReply {
                    status: Status::Accepted,
                    tunnel_id: None,
                },
            ),
            Delivery::new(
                conn,
                Notice::TransferReply {
                    status: Status::Confirmed,
                    tunnel_id: Some(tunnel_id),
                },
            ),
        ])
    }

    /// Releases everything `conn` owned and tells its partner to start over.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<Delivery> {
        let Some(state) = self.sessions.remove(conn) else {
            debug!(%conn, "untracked connection disconnected");
            return Vec::new();
        };
        self.identities.release(&state.identity);
        info!(%conn, identity = %state.identity, "party disconnected");

        // Only a partner that still points back at us is told to refresh.
        let partner = state.partner.filter(|p| {
            self.sessions
                .get(*p)
                .is_some_and(|s| s.partner == Some(conn))
        });

        let mut deliveries = Vec::new();

        if let Some(tunnel_id) = &state.tunnel_id {
            if let Some(tunnel) = self.tunnels.get(tunnel_id.as_str()) {
                tunnel.abort();
                // Without a download attached there is no relay loop to
                // tear the tunnel down, so do it here.
                if !tunnel.is_listening() {
                    deliveries.extend(self.finish_tunnel(tunnel_id.as_str(), RelayOutcome::Aborted));
                }
            }
        }

        if let Some(partner) = partner {
            if let Some(partner_state) = self.sessions.get_mut(partner) {
                // A partner still streaming is reset by the tunnel teardown.
                if partner_state.tunnel_id.is_none() {
                    partner_state.reset();
                }
            }
            deliveries.push(Delivery::new(
                partner,
                Notice::ForceRefresh {
                    reason: PARTNER_LEFT.into(),
                },
            ));
        }

        deliveries
    }

    /// Destroys the tunnel and resets both parties. Only the first call for
    /// a given tunnel does anything.
    pub fn finish_tunnel(&mut self, tunnel_id: &str, outcome: RelayOutcome) -> Vec<Delivery> {
        let Some(tunnel) = self.tunnels.destroy(tunnel_id) else {
            return Vec::new();
        };
        let notice = match outcome {
            RelayOutcome::Completed => Notice::TunnelClosed,
            RelayOutcome::Aborted => Notice::TunnelAborted,
        };
        info!(tunnel = tunnel_id, ?outcome, "tunnel finished");

        let mut deliveries = Vec::new();
        for party in [tunnel.uploader(), tunnel.downloader()] {
            let Some(state) = self.sessions.get_mut(party) else {
                continue;
            };
            if state.tunnel_id.as_ref().map(TunnelId::as_str) != Some(tunnel_id) {
                continue;
            }
            state.reset();
            deliveries.push(Delivery::new(party, notice.clone()));
        }
        deliveries
    }

    /// Partner of `conn` when `conn` is in `phase` and the partner is live.
    fn deciding_partner(&self, conn: ConnId, phase: Phase) -> Option<ConnId> {
        if self.sessions.phase(conn) != Some(phase) {
            return None;
        }
        self.sessions.live_partner(conn)
    }

    /// The partner that offered a file to `conn`, if `conn` is negotiating.
    fn offering_partner(&self, conn: ConnId) -> Option<ConnId> {
        let partner = self.deciding_partner(conn, Phase::Negotiating)?;
        let offered = self
            .sessions
            .get(partner)
            .is_some_and(|s| s.phase == Phase::Negotiating && s.pending_file.is_some());
        offered.then_some(partner)
    }
}
