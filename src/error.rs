use std::net::SocketAddr;
use std::time::Duration;

use crate::messaging::peer_address::PeerId;

/// Failures of a single exchange or of a single socket. Errors that only concern one exchange
///  are delivered to that exchange's caller and nowhere else.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("requested {requested} permits, but the pool has only {max}")]
    AdmissionDenied {
        requested: usize,
        max: usize,
    },

    #[error("no reply from {remote:?} within {timeout:?}")]
    Timeout {
        remote: Option<SocketAddr>,
        timeout: Duration,
    },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("no {kind} socket address known for peer {peer}")]
    NoRoute {
        peer: PeerId,
        kind: &'static str,
    },

    #[error("connection closed: shutting down")]
    ConnectionClosed,

    #[error("tunnel handshake failed: {0}")]
    TunnelHandshakeFailure(String),

    #[error("cancelled by caller")]
    Cancelled,

    #[error("codec error: {0}")]
    Codec(#[source] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this failure counts against the remote peer's reputation. Local causes (shutdown,
    ///  cancellation, misuse of the pool) never do.
    pub fn penalizes_peer(&self) -> bool {
        match self {
            TransportError::Timeout { .. } => true,
            TransportError::ProtocolError(_) => true,
            TransportError::TunnelHandshakeFailure(_) => true,
            TransportError::Io(_) => true,
            TransportError::BindFailure { .. } => false,
            TransportError::AdmissionDenied { .. } => false,
            TransportError::NoRoute { .. } => false,
            TransportError::ConnectionClosed => false,
            TransportError::Cancelled => false,
            TransportError::Codec(_) => false,
        }
    }
}
