use std::sync::Arc;

use crate::config::TransportConfig;
use crate::connection::dispatcher::Dispatcher;
use crate::connection::peer_status::PeerStatusListeners;
use crate::connection::pending_replies::PendingReplyTable;
use crate::error::TransportError;
use crate::messaging::codec::WireCodec;
use crate::messaging::message::Message;
use crate::messaging::peer_address::PeerAddress;
use crate::messaging::signature::KeyPair;
use crate::metrics::MetricsSink;
use crate::tunnel::broker::TunnelBroker;

/// Everything the inbound and the outbound half of a transport share
pub struct TransportContext {
    pub config: TransportConfig,
    pub self_address: PeerAddress,
    pub key_pair: Option<KeyPair>,
    pub codec: Arc<dyn WireCodec>,
    pub dispatcher: Arc<Dispatcher>,
    pub pending: Arc<PendingReplyTable>,
    pub tunnel_broker: Arc<TunnelBroker>,
    pub peer_status: Arc<PeerStatusListeners>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl TransportContext {
    pub fn encode(&self, message: &Message) -> Result<bytes::Bytes, TransportError> {
        self.codec.encode(message, self.key_pair.as_ref())
            .map_err(TransportError::Codec)
    }
}
