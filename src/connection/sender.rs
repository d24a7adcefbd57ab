use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::{join, select};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::connection::connection_pool::{ChannelKind, ConnectionPool};
use crate::connection::context::TransportContext;
use crate::connection::socket_endpoint::DatagramSender;
use crate::connection::tcp;
use crate::error::TransportError;
use crate::messaging::codec::Decoded;
use crate::messaging::message::{Message, SendMode};
use crate::metrics::{PACKETS_RECEIVED, PACKETS_SENT, REQUESTS_TIMED_OUT};
use crate::tunnel::session::TunnelSession;

/// The outbound half of the transport: admission control, encoding, transmission and waiting
///  for the reply.
///
/// Every exchange reserves a permit from the pool for its channel kind and returns it as soon
///  as the exchange is over, on every path including errors and cancellation.
pub struct Sender {
    ctx: Arc<TransportContext>,
    datagram_sender: Arc<dyn DatagramSender>,
    udp_pool: ConnectionPool,
    tcp_pool: ConnectionPool,
}

pub(crate) struct Exchange {
    pub reply: Option<Message>,
    pub tunnel: Option<Arc<TunnelSession>>,
}

impl Exchange {
    fn without_reply() -> Exchange {
        Exchange { reply: None, tunnel: None }
    }
}

impl Sender {
    /// Creates the connection pools, so this must be called from inside a Tokio runtime
    pub fn new(ctx: Arc<TransportContext>, datagram_sender: Arc<dyn DatagramSender>) -> Sender {
        let udp_pool = ConnectionPool::new(ChannelKind::Udp, ctx.config.max_permits_udp, ctx.metrics.clone());
        let tcp_pool = ConnectionPool::new(ChannelKind::Tcp, ctx.config.max_permits_tcp, ctx.metrics.clone());
        Sender {
            ctx,
            datagram_sender,
            udp_pool,
            tcp_pool,
        }
    }

    pub fn pool(&self, kind: ChannelKind) -> &ConnectionPool {
        match kind {
            ChannelKind::Udp => &self.udp_pool,
            ChannelKind::Tcp => &self.tcp_pool,
        }
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    /// Sends a message. For [SendMode::RequestReply] this returns the verified reply, for the
    ///  other modes `None`.
    pub async fn send(&self, message: Message, mode: SendMode) -> Result<Option<Message>, TransportError> {
        let span = span!(Level::DEBUG, "send", correlation_id = %Uuid::new_v4(), message_id = message.message_id, command = ?message.command);
        async move {
            self.do_send(message, mode).await
                .map(|exchange| exchange.reply)
        }.instrument(span).await
    }

    /// Sends a request and waits for its reply
    pub async fn request(&self, message: Message) -> Result<Message, TransportError> {
        self.send(message, SendMode::RequestReply).await?
            .ok_or_else(|| TransportError::ProtocolError("request was not answered".to_string()))
    }

    /// Like [Sender::send], but gives up when `cancel` is cancelled. Cancellation is the
    ///  caller's decision, so it does not count against the remote peer.
    pub async fn send_cancellable(&self, message: Message, mode: SendMode, cancel: CancellationToken) -> Result<Option<Message>, TransportError> {
        select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("send cancelled by caller");
                Err(TransportError::Cancelled)
            }
            r = self.send(message, mode) => r,
        }
    }

    /// Sends a request that asks the recipient for a tunnel, and completes the tunnel handshake
    ///  after the reply arrived. A failed handshake fails this call and nothing else.
    pub async fn open_tunnel(&self, request: Message) -> Result<(Message, Arc<TunnelSession>), TransportError> {
        let request = request.with_tunnel();
        let exchange = self.do_send(request, SendMode::RequestReply).await?;
        match exchange {
            Exchange { reply: Some(reply), tunnel: Some(tunnel) } => Ok((reply, tunnel)),
            _ => Err(TransportError::TunnelHandshakeFailure("no tunnel session for the exchange".to_string())),
        }
    }

    async fn do_send(&self, mut message: Message, mode: SendMode) -> Result<Exchange, TransportError> {
        message.version = self.ctx.config.p2p_version;
        trace!(?message, ?mode, "sending");

        if mode == SendMode::Broadcast {
            self.broadcast(&message).await?;
            return Ok(Exchange::without_reply());
        }

        if message.recipient.peer_id == self.ctx.self_address.peer_id {
            return self.send_to_self(message, mode).await
                .map(|reply| Exchange { reply, tunnel: None });
        }

        let recipient = message.recipient.clone();
        let result = if message.is_udp {
            self.send_udp(message, mode).await
        }
        else {
            self.send_tcp(message, mode).await
        };

        match &result {
            Ok(Exchange { reply: None, .. }) => {}
            _ => self.ctx.peer_status.report(&recipient, &result).await,
        }
        result
    }

    /// Runs the request through the codec and the dispatcher without touching the network, so
    ///  the handler sees exactly what it would see for a remote request.
    async fn send_to_self(&self, message: Message, mode: SendMode) -> Result<Option<Message>, TransportError> {
        let local = self.ctx.self_address.primary_udp()
            .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));

        let request = self.round_trip(&message, local)?;
        trace!(?request, "sending to self");
        let reply = self.ctx.dispatcher.dispatch(request).await;

        if mode != SendMode::RequestReply || !message.message_type.is_request() {
            return Ok(None);
        }
        let Some(reply) = reply else {
            return Err(TransportError::ProtocolError("local handler sent no reply".to_string()));
        };
        let reply = self.round_trip(&reply, local)?;
        verify_reply(&message, reply).map(Some)
    }

    fn round_trip(&self, message: &Message, local: SocketAddr) -> Result<Message, TransportError> {
        let bytes = self.ctx.encode(message)?;
        match self.ctx.codec.decode(&bytes, local, local) {
            Ok(Decoded::Complete(decoded)) => Ok(decoded),
            Ok(Decoded::Incomplete) => Err(TransportError::ProtocolError("message could not be decoded locally".to_string())),
            Err(e) => Err(TransportError::Codec(e)),
        }
    }

    async fn broadcast(&self, message: &Message) -> Result<(), TransportError> {
        let targets = message.recipient.sockets.iter()
            .map(|s| s.udp())
            .collect::<Vec<_>>();
        if targets.is_empty() {
            return Err(TransportError::NoRoute { peer: message.recipient.peer_id, kind: "UDP" });
        }

        let bytes = self.ctx.encode(message)?;
        let _channel = self.udp_pool.reserve(1).await?;

        let mut last_error = None;
        let mut num_sent = 0;
        for target in targets {
            match self.datagram_sender.send_datagram(target, &bytes).await {
                Ok(_) => num_sent += 1,
                Err(e) => {
                    debug!(?target, "broadcast to target failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if num_sent == 0 => Err(e),
            _ => Ok(()),
        }
    }

    fn reply_timeout(&self, message: &Message) -> Duration {
        if message.recipient.slow {
            self.ctx.config.slow_response_timeout
        }
        else if message.is_udp {
            self.ctx.config.idle_timeout_udp
        }
        else {
            self.ctx.config.idle_timeout_tcp
        }
    }

    async fn send_udp(&self, message: Message, mode: SendMode) -> Result<Exchange, TransportError> {
        // datagrams have no connection to keep alive, so the permit is only held for the exchange
        let _channel = self.udp_pool.reserve(1).await?;
        self.transmit_udp(message, mode).await
    }

    /// Sends a datagram and waits for the reply, without admission control. The caller is
    ///  responsible for holding a permit.
    pub(crate) async fn transmit_udp(&self, message: Message, mode: SendMode) -> Result<Exchange, TransportError> {
        let remote = message.recipient.primary_udp()
            .ok_or(TransportError::NoRoute { peer: message.recipient.peer_id, kind: "UDP" })?;
        let bytes = self.ctx.encode(&message)?;

        let expects_reply = mode == SendMode::RequestReply && message.message_type.is_request();
        let deadline = Instant::now() + self.reply_timeout(&message);

        // registered before the request goes out, so the responder's frames find the session
        let tunnel = if expects_reply && message.requires_tunnel {
            Some(self.ctx.tunnel_broker.prepare(remote, message.message_id).await?)
        }
        else {
            None
        };

        let pending = if expects_reply {
            match self.ctx.pending.register(message.exchange_key(), deadline, Some(remote)).await {
                Ok(pending) => Some(pending),
                Err(e) => {
                    if let Some(tunnel) = &tunnel {
                        self.ctx.tunnel_broker.abandon(tunnel).await;
                    }
                    return Err(e);
                }
            }
        }
        else {
            None
        };

        if let Err(e) = self.datagram_sender.send_datagram(remote, &bytes).await {
            if let Some(pending) = &pending {
                self.ctx.pending.forget(&pending.key()).await;
            }
            if let Some(tunnel) = &tunnel {
                self.ctx.tunnel_broker.abandon(tunnel).await;
            }
            return Err(e);
        }

        let Some(pending) = pending else {
            return Ok(Exchange::without_reply());
        };

        // the receive loop's sweep normally times the exchange out, this is the backstop in case
        //  no receive loop is running
        let key = pending.key();
        let backstop = deadline + self.ctx.config.receive_poll_interval;
        let reply = match timeout_at(backstop, pending.wait()).await {
            Ok(reply) => reply,
            Err(_) => {
                self.ctx.pending.forget(&key).await;
                self.ctx.metrics.inc_counter(REQUESTS_TIMED_OUT, 1);
                Err(TransportError::Timeout { remote: Some(remote), timeout: self.reply_timeout(&message) })
            }
        };

        let reply = match reply.and_then(|reply| verify_reply(&message, reply)) {
            Ok(reply) => reply,
            Err(e) => {
                if let Some(tunnel) = &tunnel {
                    self.ctx.tunnel_broker.abandon(tunnel).await;
                }
                return Err(e);
            }
        };

        if let Some(tunnel) = &tunnel {
            self.ctx.tunnel_broker.handshake(tunnel).await?;
        }

        Ok(Exchange { reply: Some(reply), tunnel })
    }

    async fn send_tcp(&self, message: Message, mode: SendMode) -> Result<Exchange, TransportError> {
        let remote = message.recipient.primary_tcp()
            .ok_or(TransportError::NoRoute { peer: message.recipient.peer_id, kind: "TCP" })?;

        let _channel = self.tcp_pool.reserve(1).await?;
        let mut stream = tcp::connect(remote, self.ctx.config.connect_timeout_tcp).await?;
        let reply = self.exchange_tcp(&mut stream, message, mode).await?;
        Ok(Exchange { reply, tunnel: None })
    }

    /// One exchange on an open TCP stream, without admission control
    pub(crate) async fn exchange_tcp(&self, stream: &mut TcpStream, message: Message, mode: SendMode) -> Result<Option<Message>, TransportError> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;

        let bytes = self.ctx.encode(&message)?;
        tcp::write_frame(stream, &bytes).await?;
        self.ctx.metrics.inc_counter(PACKETS_SENT, 1);

        if mode != SendMode::RequestReply || !message.message_type.is_request() {
            return Ok(None);
        }

        let reply_timeout = self.reply_timeout(&message);
        let frame = match timeout(reply_timeout, tcp::read_frame(stream)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{:?} closed the connection before replying", remote),
            ))),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                self.ctx.metrics.inc_counter(REQUESTS_TIMED_OUT, 1);
                return Err(TransportError::Timeout { remote: Some(remote), timeout: reply_timeout });
            }
        };
        self.ctx.metrics.inc_counter(PACKETS_RECEIVED, 1);

        let reply = tcp::decode_frame(&self.ctx, &frame, local, remote)?;
        if reply.version != self.ctx.config.p2p_version {
            return Err(TransportError::ProtocolError(format!("reply has p2p version {}, expected {}", reply.version, self.ctx.config.p2p_version)));
        }
        verify_reply(&message, reply).map(Some)
    }

    /// Reports an exchange's outcome the same way [Sender::send] does
    pub(crate) async fn report(&self, message: &Message, result: &Result<Option<Message>, TransportError>) {
        match result {
            Ok(None) => {}
            _ => self.ctx.peer_status.report(&message.recipient, result).await,
        }
    }

    /// Rejects new sends on both channel kinds, then waits up to `bound` for the channels that
    ///  are still open. Returns `false` if some were still open when the wait was given up.
    pub async fn shutdown(&self, bound: Duration) -> bool {
        self.udp_pool.close().await;
        self.tcp_pool.close().await;

        let (udp, tcp) = join!(
            timeout(bound, self.udp_pool.wait_for_channels()),
            timeout(bound, self.tcp_pool.wait_for_channels()),
        );
        let mut all_closed = true;
        for (kind, closed) in [(ChannelKind::Udp, udp.is_ok()), (ChannelKind::Tcp, tcp.is_ok())] {
            if !closed {
                warn!("{:?} channels still open after {:?} - not waiting for them any longer", kind, bound);
                all_closed = false;
            }
        }
        all_closed
    }
}

/// A reply is only accepted if it answers the request and the remote peer could process it.
fn verify_reply(request: &Message, reply: Message) -> Result<Message, TransportError> {
    if reply.message_id != request.message_id {
        return Err(TransportError::ProtocolError(format!("reply id {:08x} does not match request id {:08x}", reply.message_id, request.message_id)));
    }
    if reply.message_type.is_error() {
        let reason = String::from_utf8_lossy(&reply.payload);
        return Err(TransportError::ProtocolError(format!("{:?} reply from {:?}: {}", reply.message_type, reply.sender.peer_id, reason)));
    }
    if reply.message_type.is_request() || reply.message_type.is_ack() {
        return Err(TransportError::ProtocolError(format!("expected a reply, got {:?}", reply.message_type)));
    }
    if reply.sender.relayed != request.recipient.relayed {
        return Err(TransportError::ProtocolError(format!(
            "relay flag mismatch: request to relayed={}, reply from relayed={}",
            request.recipient.relayed, reply.sender.relayed,
        )));
    }
    if !reply.message_type.is_ok() && !reply.message_type.is_not_ok() {
        warn!(?reply, "unexpected reply type");
    }
    Ok(reply)
}
