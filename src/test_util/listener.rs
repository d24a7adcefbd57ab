use std::sync::Mutex;

use crate::connection::peer_status::{FailureReason, PeerStatusListener};
use crate::messaging::peer_address::PeerAddress;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PeerEvent {
    Found(PeerAddress),
    Failed(PeerAddress, FailureReason),
}

/// remembers every notification for later inspection
#[derive(Default)]
pub struct RecordingPeerStatusListener {
    events: Mutex<Vec<PeerEvent>>,
}

impl RecordingPeerStatusListener {
    pub fn events(&self) -> Vec<PeerEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, event: PeerEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

impl PeerStatusListener for RecordingPeerStatusListener {
    fn on_peer_found(&self, peer: &PeerAddress) {
        self.record(PeerEvent::Found(peer.clone()));
    }

    fn on_peer_failed(&self, peer: &PeerAddress, reason: &FailureReason) {
        self.record(PeerEvent::Failed(peer.clone(), reason.clone()));
    }
}
