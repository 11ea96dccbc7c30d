//! Process-wide negotiation service.
//!
//! The [`Hub`] owns the [`PairingEngine`] behind a single mutex so every
//! negotiation event runs as if on one execution context. Tunnel byte
//! traffic is kept off that lock: chunks go straight to the tunnel's own
//! buffer once the tunnel has been looked up.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;
use tunnelshare_protocol::FileMeta;
use tunnelshare_protocol::constants::IDENTITY_DIGITS;

use crate::pairing::{Delivery, PairingEngine};
use crate::relay::RelayOutcome;
use crate::session::ConnectionState;
use crate::tunnel::Tunnel;
use crate::{ConnId, Identity, RelayError};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Digits in a freshly allocated identity.
    pub identity_digits: usize,
    /// Abort a tunnel after this long without progress (`None` = never).
    pub tunnel_idle_timeout: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            identity_digits: IDENTITY_DIGITS,
            tunnel_idle_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Shared service object holding every registry.
pub struct Hub {
    engine: Mutex<PairingEngine>,
    config: HubConfig,
}

impl Hub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            engine: Mutex::new(PairingEngine::new(config.identity_digits)),
            config,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn engine(&self) -> MutexGuard<'_, PairingEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `conn`, returning its identity and the initial state query.
    pub fn connect(&self, conn: ConnId) -> Result<(Identity, Vec<Delivery>), RelayError> {
        self.engine().connect(conn)
    }

    pub fn identity_request(&self, conn: ConnId) -> Vec<Delivery> {
        self.engine().identity_request(conn)
    }

    pub fn state_reply(&self, conn: ConnId, reported: u8) -> Vec<Delivery> {
        self.engine().state_reply(conn, reported)
    }

    pub fn connect_request(&self, conn: ConnId, target_id: &str) -> Vec<Delivery> {
        self.engine().connect_request(conn, target_id)
    }

    pub fn connect_reject(&self, conn: ConnId) -> Vec<Delivery> {
        self.engine().connect_reject(conn)
    }

    pub fn connect_accept(&self, conn: ConnId) -> Vec<Delivery> {
        self.engine().connect_accept(conn)
    }

    pub fn transfer_request(&self, conn: ConnId, file: FileMeta) -> Vec<Delivery> {
        self.engine().transfer_request(conn, file)
    }

    pub fn transfer_reject(&self, conn: ConnId) -> Vec<Delivery> {
        self.engine().transfer_reject(conn)
    }

    pub fn transfer_accept(&self, conn: ConnId) -> Result<Vec<Delivery>, RelayError> {
        self.engine().transfer_accept(conn)
    }

    pub fn disconnect(&self, conn: ConnId) -> Vec<Delivery> {
        self.engine().disconnect(conn)
    }

    /// The tunnel `conn` uploads into, if any.
    fn upload_tunnel(&self, conn: ConnId) -> Option<Arc<Tunnel>> {
        let engine = self.engine();
        let tunnel_id = engine.state(conn)?.tunnel_id.clone()?;
        let tunnel = engine.tunnels().get(tunnel_id.as_str())?;
        (tunnel.uploader() == conn).then_some(tunnel)
    }

    /// Pushes a chunk from `conn` into its tunnel. Ignored unless `conn`
    /// is the uploader of a live tunnel.
    pub fn upload_chunk(&self, conn: ConnId, bytes: Vec<u8>) -> bool {
        match self.upload_tunnel(conn) {
            Some(tunnel) => tunnel.push(bytes),
            None => {
                debug!(%conn, "upload chunk without tunnel ignored");
                false
            }
        }
    }

    /// Marks the upload of `conn` as complete.
    pub fn upload_complete(&self, conn: ConnId) -> bool {
        match self.upload_tunnel(conn) {
            Some(tunnel) => {
                tunnel.finish();
                true
            }
            None => {
                debug!(%conn, "upload complete without tunnel ignored");
                false
            }
        }
    }

    /// Claims the tunnel for a download. `None` if unknown or already claimed.
    pub fn claim_tunnel(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        let engine = self.engine();
        let tunnel = engine.tunnels().get(tunnel_id)?;
        if tunnel.is_aborted() || !tunnel.claim() {
            return None;
        }
        debug!(tunnel = tunnel_id, "tunnel claimed for download");
        Some(tunnel)
    }

    /// Aborts a tunnel that no download has claimed yet. Does nothing once
    /// a download is streaming it or the tunnel is gone.
    pub fn expire_unclaimed(&self, tunnel_id: &str) -> Vec<Delivery> {
        let mut engine = self.engine();
        let Some(tunnel) = engine.tunnels().get(tunnel_id) else {
            return Vec::new();
        };
        if tunnel.is_listening() {
            return Vec::new();
        }
        debug!(tunnel = tunnel_id, "tunnel never downloaded, expiring");
        tunnel.abort();
        engine.finish_tunnel(tunnel_id, RelayOutcome::Aborted)
    }

    /// Tears the tunnel down once its relay has ended.
    pub fn finish_tunnel(&self, tunnel_id: &str, outcome: RelayOutcome) -> Vec<Delivery> {
        self.engine().finish_tunnel(tunnel_id, outcome)
    }

    /// Copy of the state of `conn`.
    pub fn snapshot(&self, conn: ConnId) -> Option<ConnectionState> {
        self.engine().state(conn).cloned()
    }

    pub fn tunnel_exists(&self, tunnel_id: &str) -> bool {
        self.engine().tunnels().get(tunnel_id).is_some()
    }

    pub fn tunnel_count(&self) -> usize {
        self.engine().tunnels().len()
    }

    pub fn connection_count(&self) -> usize {
        self.engine().sessions().len()
    }
}
