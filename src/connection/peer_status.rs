use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::TransportError;
use crate::messaging::peer_address::PeerAddress;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureReason {
    Timeout,
    ProtocolError(String),
    TunnelHandshake(String),
    Io(String),
}

impl FailureReason {
    /// `None` if the error is not the remote peer's fault
    pub fn of(e: &TransportError) -> Option<FailureReason> {
        if !e.penalizes_peer() {
            return None;
        }
        Some(match e {
            TransportError::Timeout { .. } => FailureReason::Timeout,
            TransportError::ProtocolError(msg) => FailureReason::ProtocolError(msg.clone()),
            TransportError::TunnelHandshakeFailure(msg) => FailureReason::TunnelHandshake(msg.clone()),
            other => FailureReason::Io(other.to_string()),
        })
    }
}

/// Receives liveness signals about remote peers, e.g. to maintain a routing table. Callbacks are
///  invoked inline on the transport's tasks and should return quickly.
#[cfg_attr(test, automock)]
pub trait PeerStatusListener: Send + Sync + 'static {
    fn on_peer_found(&self, peer: &PeerAddress);
    fn on_peer_failed(&self, peer: &PeerAddress, reason: &FailureReason);
}

#[derive(Default)]
pub struct PeerStatusListeners {
    listeners: RwLock<Vec<Arc<dyn PeerStatusListener>>>,
}

impl PeerStatusListeners {
    pub async fn add(&self, listener: Arc<dyn PeerStatusListener>) {
        self.listeners.write().await
            .push(listener);
    }

    pub async fn peer_found(&self, peer: &PeerAddress) {
        debug!(?peer, "peer found");
        for l in self.listeners.read().await.iter() {
            l.on_peer_found(peer);
        }
    }

    pub async fn peer_failed(&self, peer: &PeerAddress, reason: FailureReason) {
        debug!(?peer, ?reason, "peer failed");
        for l in self.listeners.read().await.iter() {
            l.on_peer_failed(peer, &reason);
        }
    }

    /// Reports the outcome of an exchange: success marks the peer found, penalizing failures mark
    ///  it failed, and local failures are not reported at all.
    pub async fn report<T>(&self, peer: &PeerAddress, result: &Result<T, TransportError>) {
        match result {
            Ok(_) => self.peer_found(peer).await,
            Err(e) => {
                if let Some(reason) = FailureReason::of(e) {
                    self.peer_failed(peer, reason).await;
                }
            }
        }
    }
}
