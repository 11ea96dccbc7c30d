//! Back-pressured relay loop from a tunnel's buffer to a download sink.
//!
//! The uploader is asked for the next chunk only after the previous one
//! has been written and flushed to the sink, so a well-behaved uploader
//! keeps at most one chunk in flight per tunnel.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::tunnel::Tunnel;

/// How a relay run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The uploader signalled completion and every chunk was delivered.
    Completed,
    /// Either side vanished, the sink failed, or the tunnel went idle.
    Aborted,
}

/// Next action of the relay loop, decided under the tunnel lock.
pub(crate) enum Step {
    Chunk(Vec<u8>),
    Wait,
    Done(RelayOutcome),
}

/// Drains `tunnel` into `sink` until completion or abort.
///
/// `pull_more` asks the uploader for the next chunk. It is called at most
/// once per flushed chunk (plus once at start), never while a chunk is
/// still being written. `idle_timeout` bounds both the wait for the
/// uploader and each sink write; `None` waits forever.
///
/// The caller must have claimed the tunnel with [`Tunnel::claim`].
pub async fn run_relay<W, F>(
    tunnel: &Tunnel,
    sink: &mut W,
    mut pull_more: F,
    idle_timeout: Option<Duration>,
) -> RelayOutcome
where
    W: AsyncWrite + Unpin,
    F: FnMut(),
{
    let mut outstanding = false;
    let mut delivered: u64 = 0;

    loop {
        let wait = match tunnel.next_step() {
            Step::Done(outcome) => {
                debug!(tunnel = %tunnel.id(), delivered, ?outcome, "relay finished");
                return outcome;
            }
            Step::Chunk(bytes) => {
                match with_timeout(idle_timeout, write_chunk(sink, &bytes)).await {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        debug!(tunnel = %tunnel.id(), "sink write failed: {e}");
                        tunnel.abort();
                        return RelayOutcome::Aborted;
                    }
                    None => {
                        warn!(tunnel = %tunnel.id(), "sink stalled, aborting tunnel");
                        tunnel.abort();
                        return RelayOutcome::Aborted;
                    }
                }
                delivered += bytes.len() as u64;
                outstanding = false;
                false
            }
            Step::Wait => true,
        };

        if !outstanding && !tunnel.is_complete() {
            pull_more();
            outstanding = true;
        }

        if wait && with_timeout(idle_timeout, tunnel.woken()).await.is_none() {
            warn!(tunnel = %tunnel.id(), "uploader idle, aborting tunnel");
            tunnel.abort();
            return RelayOutcome::Aborted;
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(sink: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    sink.write_all(bytes).await?;
    sink.flush().await
}

/// Runs `fut`, giving up after `limit`. Returns `None` on timeout.
async fn with_timeout<F: std::future::Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
