//! Tunnels and the registry that owns them.
//!
//! A [`Tunnel`] is the in-memory meeting point of one accepted transfer:
//! the uploader pushes chunks into its buffer and a single download sink
//! drains it through [`run_relay`](crate::run_relay).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;
use tunnelshare_protocol::FileMeta;
use tunnelshare_protocol::constants::{TUNNEL_ID_ALPHABET, TUNNEL_ID_LEN};

use crate::relay::{RelayOutcome, Step};
use crate::{ConnId, MAX_ALLOCATION_ATTEMPTS, RelayError, TunnelId};

/// Generates a random tunnel id of [`TUNNEL_ID_LEN`] characters from `0-9A-Z`.
pub fn generate_tunnel_id() -> String {
    let mut rng = rand::thread_rng();
    (0..TUNNEL_ID_LEN)
        .map(|_| char::from(TUNNEL_ID_ALPHABET[rng.gen_range(0..TUNNEL_ID_ALPHABET.len())]))
        .collect()
}

#[derive(Debug, Default)]
struct TunnelState {
    buffer: VecDeque<Vec<u8>>,
    buffered_bytes: usize,
    complete: bool,
    aborted: bool,
    listening: bool,
}

/// Relay object bridging one transfer's upload and download.
#[derive(Debug)]
pub struct Tunnel {
    id: TunnelId,
    uploader: ConnId,
    downloader: ConnId,
    file: FileMeta,
    state: Mutex<TunnelState>,
    /// Wakes the relay loop when data or completion arrives.
    wake: Notify,
}

impl Tunnel {
    fn new(id: TunnelId, uploader: ConnId, downloader: ConnId, file: FileMeta) -> Self {
        Self {
            id,
            uploader,
            downloader,
            file,
            state: Mutex::new(TunnelState::default()),
            wake: Notify::new(),
        }
    }

    pub fn id(&self) -> &TunnelId {
        &self.id
    }

    pub fn uploader(&self) -> ConnId {
        self.uploader
    }

    pub fn downloader(&self) -> ConnId {
        self.downloader
    }

    pub fn file(&self) -> &FileMeta {
        &self.file
    }

    fn state(&self) -> MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims exclusive draining rights. Only the first caller succeeds.
    pub fn claim(&self) -> bool {
        let mut state = self.state();
        if state.listening {
            return false;
        }
        state.listening = true;
        true
    }

    pub fn is_listening(&self) -> bool {
        self.state().listening
    }

    pub fn is_complete(&self) -> bool {
        self.state().complete
    }

    pub fn is_aborted(&self) -> bool {
        self.state().aborted
    }

    /// Number of chunks waiting to be written to the sink.
    pub fn buffered_chunks(&self) -> usize {
        self.state().buffer.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.state().buffered_bytes
    }

    /// Appends an uploaded chunk. Chunks arriving after completion are dropped.
    pub fn push(&self, bytes: Vec<u8>) -> bool {
        {
            let mut state = self.state();
            if state.complete {
                debug!(tunnel = %self.id, len = bytes.len(), "chunk after completion dropped");
                return false;
            }
            state.buffered_bytes += bytes.len();
            state.buffer.push_back(bytes);
        }
        self.wake.notify_one();
        true
    }

    /// Uploader signalled end of stream.
    pub fn finish(&self) {
        self.state().complete = true;
        self.wake.notify_one();
    }

    /// One side vanished: stop the transfer and let the relay report an abort.
    pub fn abort(&self) {
        {
            let mut state = self.state();
            state.complete = true;
            state.aborted = true;
        }
        self.wake.notify_one();
    }

    /// Decides what the relay loop does next.
    pub(crate) fn next_step(&self) -> Step {
        let mut state = self.state();
        if state.aborted {
            return Step::Done(RelayOutcome::Aborted);
        }
        if let Some(chunk) = state.buffer.pop_front() {
            state.buffered_bytes -= chunk.len();
            return Step::Chunk(chunk);
        }
        if state.complete {
            return Step::Done(RelayOutcome::Completed);
        }
        Step::Wait
    }

    /// Resolves once the tunnel has been woken since the last call.
    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }
}

/// Live tunnels keyed by id.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: HashMap<TunnelId, Arc<Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new tunnel under a fresh, collision-checked id.
    pub fn create(
        &mut self,
        uploader: ConnId,
        downloader: ConnId,
        file: FileMeta,
    ) -> Result<TunnelId, RelayError> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let id = TunnelId(generate_tunnel_id());
            if self.tunnels.contains_key(&id) {
                continue;
            }
            let tunnel = Tunnel::new(id.clone(), uploader, downloader, file);
            self.tunnels.insert(id.clone(), Arc::new(tunnel));
            debug!(tunnel = %id, %uploader, %downloader, "tunnel created");
            return Ok(id);
        }
        Err(RelayError::TunnelIdExhausted)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(id).cloned()
    }

    /// Removes the tunnel. Returns `None` if it was already gone.
    pub fn destroy(&mut self, id: &str) -> Option<Arc<Tunnel>> {
        let removed = self.tunnels.remove(id);
        if removed.is_some() {
            debug!(tunnel = id, "tunnel destroyed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> FileMeta {
        FileMeta {
            name: "x.txt".into(),
            size: 5,
            content_type: "text/plain".into(),
        }
    }

    #[test]
    fn tunnel_id_format() {
        let id = generate_tunnel_id();
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|c| TUNNEL_ID_ALPHABET.contains(&c)));
    }

    #[test]
    fn tunnel_ids_differ() {
        assert_ne!(generate_tunnel_id(), generate_tunnel_id());
    }

    #[test]
    fn create_get_destroy() {
        let mut reg = TunnelRegistry::new();
        let id = reg.create(ConnId(1), ConnId(2), meta()).unwrap();
        let tunnel = reg.get(id.as_str()).unwrap();
        assert_eq!(tunnel.uploader(), ConnId(1));
        assert_eq!(tunnel.downloader(), ConnId(2));
        assert_eq!(tunnel.file(), &meta());

        assert!(reg.destroy(id.as_str()).is_some());
        assert!(reg.destroy(id.as_str()).is_none());
        assert!(reg.get(id.as_str()).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn claim_is_exclusive() {
        let mut reg = TunnelRegistry::new();
        let id = reg.create(ConnId(1), ConnId(2), meta()).unwrap();
        let tunnel = reg.get(id.as_str()).unwrap();
        assert!(!tunnel.is_listening());
        assert!(tunnel.claim());
        assert!(!tunnel.claim());
        assert!(tunnel.is_listening());
    }

    #[test]
    fn steps_follow_push_order() {
        let mut reg = TunnelRegistry::new();
        let id = reg.create(ConnId(1), ConnId(2), meta()).unwrap();
        let tunnel = reg.get(id.as_str()).unwrap();

        assert!(matches!(tunnel.next_step(), Step::Wait));
        tunnel.push(b"he".to_vec());
        tunnel.push(b"llo".to_vec());
        assert_eq!(tunnel.buffered_chunks(), 2);
        assert_eq!(tunnel.buffered_bytes(), 5);
        tunnel.finish();

        assert!(matches!(tunnel.next_step(), Step::Chunk(c) if c == b"he"));
        assert!(matches!(tunnel.next_step(), Step::Chunk(c) if c == b"llo"));
        assert!(matches!(
            tunnel.next_step(),
            Step::Done(RelayOutcome::Completed)
        ));
        assert_eq!(tunnel.buffered_bytes(), 0);
    }

    #[test]
    fn abort_wins_over_buffered_data() {
        let mut reg = TunnelRegistry::new();
        let id = reg.create(ConnId(1), ConnId(2), meta()).unwrap();
        let tunnel = reg.get(id.as_str()).unwrap();
        tunnel.push(b"he".to_vec());
        tunnel.abort();
        assert!(tunnel.is_complete());
        assert!(matches!(tunnel.next_step(), Step::Done(RelayOutcome::Aborted)));
    }

    #[test]
    fn push_after_completion_is_dropped() {
        let mut reg = TunnelRegistry::new();
        let id = reg.create(ConnId(1), ConnId(2), meta()).unwrap();
        let tunnel = reg.get(id.as_str()).unwrap();
        tunnel.finish();
        assert!(!tunnel.push(b"late".to_vec()));
        assert_eq!(tunnel.buffered_chunks(), 0);
    }
}
