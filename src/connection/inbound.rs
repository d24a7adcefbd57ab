use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, trace, warn, Instrument, Span};

use crate::connection::context::TransportContext;
use crate::connection::peer_status::FailureReason;
use crate::connection::socket_endpoint::{DatagramHandler, DatagramSender};
use crate::error::TransportError;
use crate::messaging::codec::{Decoded, ProtocolType};
use crate::messaging::message::{ExchangeKey, Message};
use crate::metrics::{PACKETS_DROPPED, REPLIES_UNMATCHED};

/// Handles everything one UDP endpoint receives: tunnel frames go to the tunnel broker, replies
///  resolve their pending exchange, requests are dispatched on a task of their own and answered
///  through the endpoint they arrived on.
///
/// At most `max_concurrent_requests` requests are handled at a time, requests beyond that are
///  dropped.
pub struct InboundRouter {
    ctx: Arc<TransportContext>,
    endpoint: Arc<dyn DatagramSender>,
    request_permits: Arc<Semaphore>,
}

impl InboundRouter {
    pub fn new(ctx: Arc<TransportContext>, endpoint: Arc<dyn DatagramSender>) -> InboundRouter {
        let request_permits = Arc::new(Semaphore::new(ctx.config.max_concurrent_requests));
        InboundRouter { ctx, endpoint, request_permits }
    }

    async fn on_control_message(&self, from: SocketAddr, buf: &[u8]) {
        let message = match self.ctx.codec.decode(buf, self.endpoint.local_addr(), from) {
            Ok(Decoded::Complete(message)) => message,
            Ok(Decoded::Incomplete) => {
                debug!(?from, len = buf.len(), "incomplete control message - dropping");
                self.ctx.metrics.inc_counter(PACKETS_DROPPED, 1);
                return;
            }
            Err(e) => {
                warn!(?from, "undecodable control message - dropping: {}", e);
                self.ctx.metrics.inc_counter(PACKETS_DROPPED, 1);
                return;
            }
        };
        trace!(?from, ?message, "received");

        if message.message_type.is_request() {
            self.on_request(from, message).await;
        }
        else if message.message_type.is_ack() {
            self.ctx.dispatcher.dispatch(message).await;
        }
        else {
            self.on_reply(message).await;
        }
    }

    async fn on_request(&self, from: SocketAddr, request: Message) {
        let Ok(permit) = self.request_permits.clone().try_acquire_owned() else {
            warn!(?from, ?request, "too many requests in progress - dropping");
            self.ctx.metrics.inc_counter(PACKETS_DROPPED, 1);
            return;
        };

        if request.requires_tunnel && request.version == self.ctx.config.p2p_version {
            self.ctx.tunnel_broker.expect_responder(from, request.message_id).await;
        }

        let ctx = self.ctx.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let Some(reply) = ctx.dispatcher.dispatch(request).await else {
                return;
            };
            send_reply(&ctx, endpoint.as_ref(), from, &reply).await;
        }.instrument(Span::current()));
    }

    async fn on_reply(&self, reply: Message) {
        let key = ExchangeKey::of_reply(&reply);

        if reply.version != self.ctx.config.p2p_version {
            warn!(?reply, "reply has p2p version {}, expected {}", reply.version, self.ctx.config.p2p_version);
            self.ctx.peer_status.peer_failed(&reply.sender, FailureReason::ProtocolError("wrong p2p version".to_string())).await;
            let error = || TransportError::ProtocolError(format!("reply has p2p version {}", reply.version));
            if !self.ctx.pending.fail(&key, error()).await {
                self.ctx.pending.fail(&key.with_zero_recipient(), error()).await;
            }
            return;
        }

        if self.ctx.pending.resolve(&key, reply.clone()).await {
            return;
        }
        // requests to an unknown identity are registered under the zero id
        if self.ctx.pending.resolve(&key.with_zero_recipient(), reply.clone()).await {
            return;
        }

        warn!(?reply, "reply for an exchange that is not pending (any more?) - dropping");
        self.ctx.metrics.inc_counter(REPLIES_UNMATCHED, 1);
    }
}

pub async fn send_reply(ctx: &TransportContext, endpoint: &dyn DatagramSender, to: SocketAddr, reply: &Message) {
    let bytes = match ctx.encode(reply) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(?reply, "could not encode reply: {}", e);
            return;
        }
    };
    if let Err(e) = endpoint.send_datagram(to, &bytes).await {
        warn!(?to, ?reply, "could not send reply: {}", e);
    }
}

#[async_trait]
impl DatagramHandler for InboundRouter {
    async fn on_datagram(&self, from: SocketAddr, buf: &[u8]) {
        match ProtocolType::of_datagram(buf) {
            Some(ProtocolType::ControlMessage) => self.on_control_message(from, buf).await,
            Some(ProtocolType::TunnelPayload) => self.ctx.tunnel_broker.on_frame(from, buf).await,
            None => {
                debug!(?from, "datagram with unknown protocol discriminator - dropping");
                self.ctx.metrics.inc_counter(PACKETS_DROPPED, 1);
            }
        }
    }

    async fn on_poll_tick(&self) {
        let now = Instant::now();
        let num_timed_out = self.ctx.pending.sweep(now).await;
        let num_expired = self.ctx.tunnel_broker.sweep_idle(now).await;
        if num_timed_out > 0 || num_expired > 0 {
            trace!(num_timed_out, num_expired, "housekeeping");
        }
    }
}
