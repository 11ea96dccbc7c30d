//! Pairing negotiation and tunnel relay.
//!
//! Tracks which party is negotiating with whom, creates a [`Tunnel`] once
//! a transfer is accepted, and moves the uploader's pushed chunks to a
//! pull-based download sink without ever asking for more data than the
//! sink has accepted.
//!
//! Everything here is transport-agnostic: operations return
//! [`Delivery`] lists that the server turns into WebSocket messages.

mod hub;
mod identity;
mod pairing;
mod relay;
mod session;
mod tunnel;

use std::fmt;

pub use hub::{Hub, HubConfig};
pub use identity::IdentityRegistry;
pub use pairing::{Delivery, Notice, PairingEngine};
pub use relay::{RelayOutcome, run_relay};
pub use session::{ConnectionState, Phase, SessionStore};
pub use tunnel::{Tunnel, TunnelRegistry, generate_tunnel_id};

/// Attempts per code width before an allocation widens the code space.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 64;

/// Upper bound on identity width. Allocation fails beyond this.
pub const MAX_IDENTITY_DIGITS: usize = 9;

/// Opaque handle of a party's live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Short public code one party uses to address another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Unique token addressing a tunnel on the download endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelId(String);

impl TunnelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for TunnelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Errors produced by the relay core.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no free identity left (tried up to {0} digits)")]
    IdentitySpaceExhausted(usize),

    #[error("could not generate a unique tunnel id")]
    TunnelIdExhausted,

    #[error("connection already registered: {0}")]
    AlreadyConnected(ConnId),
}
