//! HTTP side of a tunnel.
//!
//! The listener peeks at the request head to tell a tunnel download from a
//! WebSocket upgrade. A download answers with a single streamed response
//! whose body ends when the connection closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tunnelshare_protocol::FileMeta;
use tunnelshare_protocol::constants::TUNNEL_PATH_PREFIX;
use tunnelshare_relay::{RelayOutcome, Tunnel, run_relay};

use crate::ServerError;

/// Largest request head we are willing to buffer.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Time a client gets to send its full request head.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

const PEEK_RETRY: Duration = Duration::from_millis(10);

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

const NOT_FOUND_BODY: &str = "Invalid Tunnel";

/// RFC 5987 `attr-char`: everything else in a filename gets encoded.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Method and target of an HTTP request, plus the head's size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestHead {
    pub method: String,
    pub path: String,
    pub len: usize,
}

impl RequestHead {
    /// Tunnel id addressed by this request, if it targets the tunnel route.
    pub fn tunnel_id(&self) -> Option<&str> {
        tunnel_id_from_path(&self.path)
    }
}

/// Parses a complete request head out of `buf`.
///
/// Returns `None` while the terminating blank line has not arrived yet.
pub(crate) fn parse_head(buf: &[u8]) -> Option<Result<RequestHead, ServerError>> {
    let end = buf.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = match std::str::from_utf8(&buf[..end]) {
        Ok(head) => head,
        Err(_) => return Some(Err(ServerError::BadRequest("head is not UTF-8".into()))),
    };
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let parsed = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(version)) if version.starts_with("HTTP/") => {
            Ok(RequestHead {
                method: method.to_string(),
                path: path.to_string(),
                len: end,
            })
        }
        _ => Err(ServerError::BadRequest(format!(
            "invalid request line: {request_line:?}"
        ))),
    };
    Some(parsed)
}

/// Peeks at the request head without consuming it, so a WebSocket
/// handshake can still read it afterwards.
pub(crate) async fn peek_head(stream: &TcpStream) -> Result<RequestHead, ServerError> {
    let peek = async {
        let mut buf = vec![0u8; MAX_HEAD_SIZE];
        let mut seen = 0;
        loop {
            let n = stream.peek(&mut buf).await?;
            if n == 0 {
                return Err(ServerError::BadRequest("connection closed".into()));
            }
            if let Some(head) = parse_head(&buf[..n]) {
                return head;
            }
            if n == buf.len() {
                return Err(ServerError::BadRequest("request head too large".into()));
            }
            // Peek returns right away while the partial head sits in the
            // socket buffer; back off until more bytes show up.
            if n == seen {
                tokio::time::sleep(PEEK_RETRY).await;
            }
            seen = n;
        }
    };
    tokio::time::timeout(HEAD_TIMEOUT, peek)
        .await
        .map_err(|_| ServerError::HeadTimeout)?
}

/// Extracts the tunnel id from `/tunnel/{id}` (query string ignored).
pub(crate) fn tunnel_id_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(TUNNEL_PATH_PREFIX)?;
    let id = rest.split('?').next().unwrap_or_default();
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// A claimed-or-not download request handed to the handler.
///
/// The request head has already been consumed from the socket.
pub struct DownloadRequest {
    tunnel_id: String,
    peer: SocketAddr,
    stream: TcpStream,
}

impl DownloadRequest {
    pub(crate) fn new(tunnel_id: String, peer: SocketAddr, stream: TcpStream) -> Self {
        Self {
            tunnel_id,
            peer,
            stream,
        }
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// `Content-Disposition` value forcing a download under the file's name.
pub fn content_disposition(name: &str) -> String {
    format!(
        "attachment; filename*=UTF-8''{}",
        utf8_percent_encode(name, ATTR_CHAR)
    )
}

fn content_type(file: &FileMeta) -> &str {
    let declared = file.content_type.trim();
    if declared.is_empty() || declared.chars().any(char::is_control) {
        FALLBACK_CONTENT_TYPE
    } else {
        declared
    }
}

/// Response head for a tunnel download. The body length is unknown, so
/// the response is delimited by closing the connection.
pub(crate) fn ok_head(file: &FileMeta) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {}\r\n\
         Content-Disposition: {}\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\
         \r\n",
        content_type(file),
        content_disposition(&file.name),
    )
}

async fn write_plain<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: &str,
    extra: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         {extra}\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

/// Answers an unknown or already claimed tunnel.
pub async fn write_not_found<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    write_plain(writer, "404 Not Found", "", NOT_FOUND_BODY).await
}

pub(crate) async fn write_method_not_allowed<W: AsyncWrite + Unpin>(
    writer: &mut W,
) -> std::io::Result<()> {
    write_plain(writer, "405 Method Not Allowed", "Allow: GET\r\n", "").await
}

pub(crate) async fn write_bad_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
) -> std::io::Result<()> {
    write_plain(writer, "400 Bad Request", "", "").await
}

/// Streams a claimed tunnel to the download socket.
///
/// A watcher on the read half aborts the tunnel when the client socket
/// fails, which unblocks a relay waiting for the next chunk. A clean EOF is
/// only a half-close: the client may still be reading the body.
pub(crate) async fn stream_tunnel<F: FnMut()>(
    tunnel: Arc<Tunnel>,
    stream: TcpStream,
    pull_more: F,
    idle_timeout: Option<Duration>,
) -> RelayOutcome {
    let (mut reader, mut writer) = stream.into_split();

    let head = ok_head(tunnel.file());
    if let Err(e) = writer.write_all(head.as_bytes()).await {
        tracing::debug!(tunnel = %tunnel.id(), "download head write failed: {e}");
        tunnel.abort();
        return RelayOutcome::Aborted;
    }

    let watched = Arc::clone(&tunnel);
    let watcher = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!(tunnel = %watched.id(), "download client half-closed");
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(tunnel = %watched.id(), "download client went away: {e}");
                    watched.abort();
                    return;
                }
            }
        }
    });

    let outcome = run_relay(&tunnel, &mut writer, pull_more, idle_timeout).await;
    watcher.abort();
    let _ = writer.shutdown().await;
    outcome
}
