use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the tunnel layers above the KCP engine (smux framing,
/// tunnel composition, bridging, and configuration).
#[derive(Debug, Error)]
pub enum TunnelError {
    /// OS-level socket failure, propagated to the owner that destroys the
    /// affected bridge or session.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The KCP engine itself rejected a segment or datagram.
    #[error("KCP error: {0}")]
    Kcp(#[from] crate::kcp::Error),

    /// A smux frame had a bad cmd, an oversized length, or failed to decode.
    #[error("malformed smux frame: {0}")]
    MalformedFrame(String),

    /// No ingress observed within `3 * keepalive` seconds.
    #[error("smux session {0:?} timed out waiting for keepalive")]
    KeepaliveTimeout(SocketAddr),

    /// KCP exhausted its retransmission budget for a single segment.
    #[error("KCP conversation {0} is a dead link")]
    DeadLink(u32),

    /// An operation was submitted to an object that already tore down.
    #[error("operation submitted to a destroyed {0}")]
    Destroyed(&'static str),

    /// Missing or invalid startup configuration; fatal, the process exits.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
