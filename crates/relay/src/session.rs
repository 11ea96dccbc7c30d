//! Per-connection negotiation state.

use std::collections::HashMap;

use tunnelshare_protocol::FileMeta;

use crate::{ConnId, Identity, TunnelId};

/// Step a party has reached in the pairing/transfer handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    /// Sent a connect request, waiting for the target's decision.
    Requesting,
    /// Received a connect request, has to accept or reject it.
    AwaitingDecision,
    /// Paired with a partner.
    Bonded,
    /// A file offer is in flight between the partners.
    Negotiating,
    /// A tunnel is open between the partners.
    Streaming,
}

impl Phase {
    /// Numeric phase as exchanged with clients (`state_reply`).
    pub fn code(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Requesting => 1,
            Phase::AwaitingDecision => 2,
            Phase::Bonded => 3,
            Phase::Negotiating => 4,
            Phase::Streaming => 5,
        }
    }
}

/// Mutable negotiation record of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub identity: Identity,
    pub phase: Phase,
    /// The other party. A handle into the store, never an owner.
    pub partner: Option<ConnId>,
    /// File this party offered and the partner has not answered yet.
    pub pending_file: Option<FileMeta>,
    pub tunnel_id: Option<TunnelId>,
}

impl ConnectionState {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            phase: Phase::Idle,
            partner: None,
            pending_file: None,
            tunnel_id: None,
        }
    }

    /// Back to Idle with every relation cleared.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.partner = None;
        self.pending_file = None;
        self.tunnel_id = None;
    }
}

/// All live connection states, keyed by connection.
#[derive(Debug, Default)]
pub struct SessionStore {
    states: HashMap<ConnId, ConnectionState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh Idle state. Returns `false` if `conn` already had one.
    pub fn insert(&mut self, conn: ConnId, identity: Identity) -> bool {
        if self.states.contains_key(&conn) {
            return false;
        }
        self.states.insert(conn, ConnectionState::new(identity));
        true
    }

    pub fn get(&self, conn: ConnId) -> Option<&ConnectionState> {
        self.states.get(&conn)
    }

    pub fn get_mut(&mut self, conn: ConnId) -> Option<&mut ConnectionState> {
        self.states.get_mut(&conn)
    }

    pub fn remove(&mut self, conn: ConnId) -> Option<ConnectionState> {
        self.states.remove(&conn)
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.states.contains_key(&conn)
    }

    pub fn phase(&self, conn: ConnId) -> Option<Phase> {
        self.states.get(&conn).map(|s| s.phase)
    }

    /// Sets the phase of `conn` if it exists.
    pub fn set_phase(&mut self, conn: ConnId, phase: Phase) {
        if let Some(state) = self.states.get_mut(&conn) {
            state.phase = phase;
        }
    }

    /// Returns `conn`'s partner if that partner still has a state.
    pub fn live_partner(&self, conn: ConnId) -> Option<ConnId> {
        self.states
            .get(&conn)
            .and_then(|s| s.partner)
            .filter(|p| self.states.contains_key(p))
    }

    /// Points `a` and `b` at each other.
    pub fn pair(&mut self, a: ConnId, b: ConnId) {
        if let Some(state) = self.states.get_mut(&a) {
            state.partner = Some(b);
        }
        if let Some(state) = self.states.get_mut(&b) {
            state.partner = Some(a);
        }
    }

    /// Clears the partner link on both ends. The other end is only
    /// touched if it still points back at `conn`.
    pub fn unpair(&mut self, conn: ConnId) {
        let Some(partner) = self.states.get_mut(&conn).and_then(|s| s.partner.take()) else {
            return;
        };
        if let Some(state) = self.states.get_mut(&partner) {
            if state.partner == Some(conn) {
                state.partner = None;
            }
        }
    }

    /// Resets `conn` to Idle, clearing partner, pending file and tunnel.
    pub fn reset(&mut self, conn: ConnId) {
        if let Some(state) = self.states.get_mut(&conn) {
            state.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(code: &str) -> Identity {
        Identity(code.into())
    }

    #[test]
    fn new_state_is_idle() {
        let state = ConnectionState::new(ident("112233"));
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.partner.is_none());
        assert!(state.pending_file.is_none());
        assert!(state.tunnel_id.is_none());
    }

    #[test]
    fn phase_codes() {
        let codes: Vec<u8> = [
            Phase::Idle,
            Phase::Requesting,
            Phase::AwaitingDecision,
            Phase::Bonded,
            Phase::Negotiating,
            Phase::Streaming,
        ]
        .iter()
        .map(|p| p.code())
        .collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn insert_rejects_duplicate() {
        let mut store = SessionStore::new();
        assert!(store.insert(ConnId(1), ident("111111")));
        assert!(!store.insert(ConnId(1), ident("222222")));
        assert_eq!(store.get(ConnId(1)).unwrap().identity.as_str(), "111111");
    }

    #[test]
    fn pair_is_mutual() {
        let mut store = SessionStore::new();
        store.insert(ConnId(1), ident("111111"));
        store.insert(ConnId(2), ident("222222"));
        store.pair(ConnId(1), ConnId(2));
        assert_eq!(store.get(ConnId(1)).unwrap().partner, Some(ConnId(2)));
        assert_eq!(store.get(ConnId(2)).unwrap().partner, Some(ConnId(1)));
    }

    #[test]
    fn unpair_clears_both_ends() {
        let mut store = SessionStore::new();
        store.insert(ConnId(1), ident("111111"));
        store.insert(ConnId(2), ident("222222"));
        store.insert(ConnId(3), ident("333333"));
        store.pair(ConnId(1), ConnId(2));
        store.unpair(ConnId(2));
        assert_eq!(store.get(ConnId(1)).unwrap().partner, None);
        assert_eq!(store.get(ConnId(2)).unwrap().partner, None);

        // A stale one-sided link leaves the other party alone.
        store.pair(ConnId(2), ConnId(3));
        store.get_mut(ConnId(1)).unwrap().partner = Some(ConnId(3));
        store.unpair(ConnId(1));
        assert_eq!(store.get(ConnId(3)).unwrap().partner, Some(ConnId(2)));
    }

    #[test]
    fn live_partner_ignores_removed() {
        let mut store = SessionStore::new();
        store.insert(ConnId(1), ident("111111"));
        store.insert(ConnId(2), ident("222222"));
        store.pair(ConnId(1), ConnId(2));
        store.remove(ConnId(2));
        assert_eq!(store.live_partner(ConnId(1)), None);
    }

    #[test]
    fn reset_clears_everything() {
        let mut store = SessionStore::new();
        store.insert(ConnId(1), ident("111111"));
        {
            let state = store.get_mut(ConnId(1)).unwrap();
            state.phase = Phase::Streaming;
            state.partner = Some(ConnId(2));
            state.pending_file = Some(FileMeta {
                name: "a".into(),
                size: 1,
                content_type: "text/plain".into(),
            });
            state.tunnel_id = Some(TunnelId("T".into()));
        }
        store.reset(ConnId(1));
        let state = store.get(ConnId(1)).unwrap();
        assert_eq!(*state, ConnectionState::new(ident("111111")));
    }
}
