use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, Instrument};

use crate::connection::connection_pool::{ChannelClosed, ChannelHandle, ChannelKind};
use crate::connection::sender::Sender;
use crate::connection::tcp;
use crate::error::TransportError;
use crate::messaging::message::{Command, Message, SendMode};
use crate::messaging::peer_address::PeerAddress;

/// A long-lived channel to one remote peer. It holds its permit for its entire lifetime, so
///  exchanges on it never wait for admission. For TCP, the stream stays open between exchanges.
///
/// With `keep_alive`, a heartbeat pings the peer whenever the connection was idle for the
///  heartbeat interval, and a failed heartbeat closes the connection. Without it, the connection
///  closes itself after being idle for the channel kind's idle timeout.
pub struct PeerConnection {
    sender: Arc<Sender>,
    remote: PeerAddress,
    kind: ChannelKind,
    keep_alive: bool,
    channel: Mutex<Option<ChannelHandle>>,
    channel_closed: ChannelClosed,
    tcp_stream: Mutex<Option<TcpStream>>,
    last_activity: Mutex<Instant>,
    closing: CancellationToken,
}

impl Debug for PeerConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerConnection{{{:?} {:?}{}}}", self.kind, self.remote.peer_id, if self.keep_alive { " keep-alive" } else { "" })
    }
}

impl PeerConnection {
    pub async fn open(sender: Arc<Sender>, remote: PeerAddress, keep_alive: bool) -> Result<Arc<PeerConnection>, TransportError> {
        Self::open_with_kind(sender, remote, ChannelKind::Udp, keep_alive).await
    }

    pub async fn open_tcp(sender: Arc<Sender>, remote: PeerAddress, keep_alive: bool) -> Result<Arc<PeerConnection>, TransportError> {
        Self::open_with_kind(sender, remote, ChannelKind::Tcp, keep_alive).await
    }

    async fn open_with_kind(sender: Arc<Sender>, remote: PeerAddress, kind: ChannelKind, keep_alive: bool) -> Result<Arc<PeerConnection>, TransportError> {
        let channel = sender.pool(kind).reserve(1).await?;

        let tcp_stream = if kind == ChannelKind::Tcp {
            let addr = remote.primary_tcp()
                .ok_or(TransportError::NoRoute { peer: remote.peer_id, kind: "TCP" })?;
            Some(tcp::connect(addr, sender.context().config.connect_timeout_tcp).await?)
        }
        else {
            None
        };

        let connection = Arc::new(PeerConnection {
            channel_closed: channel.close_listener(),
            channel: Mutex::new(Some(channel)),
            tcp_stream: Mutex::new(tcp_stream),
            last_activity: Mutex::new(Instant::now()),
            closing: CancellationToken::new(),
            sender,
            remote,
            kind,
            keep_alive,
        });
        info!(?connection, "opened peer connection");

        tokio::spawn(Self::run_idle_watch(Arc::downgrade(&connection), connection.closing.clone())
            .in_current_span());
        Ok(connection)
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    fn idle_limit(&self) -> Duration {
        let config = &self.sender.context().config;
        match (self.keep_alive, self.kind) {
            (true, _) => config.heartbeat_interval,
            (false, ChannelKind::Udp) => config.idle_timeout_udp,
            (false, ChannelKind::Tcp) => config.idle_timeout_tcp,
        }
    }

    /// Sends a request and waits for the reply. Every message on a peer connection is marked
    ///  keep-alive.
    ///
    /// Exchanges on one connection take turns. Each one holds the connection's permit until it
    ///  completes, and closing the connection aborts an exchange in progress.
    pub async fn send(&self, message: Message) -> Result<Message, TransportError> {
        // close() releases the permit under this lock
        let channel = self.channel.lock().await;
        if channel.is_none() || self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut message = message.with_keep_alive(true);
        message.version = self.sender.context().config.p2p_version;
        message.is_udp = self.kind == ChannelKind::Udp;
        message.recipient = self.remote.clone();

        *self.last_activity.lock().await = Instant::now();
        let exchange = async {
            match self.kind {
                ChannelKind::Udp => self.sender.transmit_udp(message.clone(), SendMode::RequestReply).await
                    .map(|exchange| exchange.reply),
                ChannelKind::Tcp => self.exchange_tcp(message.clone()).await,
            }
        };
        let result = select! {
            result = exchange => result,
            _ = self.closing.cancelled() => Err(TransportError::ConnectionClosed),
        };
        *self.last_activity.lock().await = Instant::now();
        drop(channel);

        self.sender.report(&message, &result).await;
        result?
            .ok_or_else(|| TransportError::ProtocolError("request was not answered".to_string()))
    }

    async fn exchange_tcp(&self, message: Message) -> Result<Option<Message>, TransportError> {
        let mut stream = self.tcp_stream.lock().await;
        let Some(s) = stream.as_mut() else {
            return Err(TransportError::ConnectionClosed);
        };
        let result = self.sender.exchange_tcp(s, message, SendMode::RequestReply).await;
        if result.is_err() {
            // the stream may be out of sync with the remote side
            *stream = None;
        }
        result
    }

    /// Idempotent. The permit is back in the pool before [PeerConnection::closed] completes.
    pub async fn close(&self) {
        if !self.closing.is_cancelled() {
            debug!(connection = ?self, "closing peer connection");
            self.closing.cancel();
        }
        // waits for an aborted exchange to let go of the channel
        let mut channel = self.channel.lock().await;
        self.tcp_stream.lock().await.take();
        if let Some(mut channel) = channel.take() {
            channel.release();
        }
    }

    pub async fn closed(&self) {
        self.channel_closed.clone().wait().await
    }

    async fn run_idle_watch(connection: Weak<PeerConnection>, closing: CancellationToken) {
        loop {
            let Some(c) = connection.upgrade() else {
                return;
            };
            let due = *c.last_activity.lock().await + c.idle_limit();
            drop(c);

            select! {
                _ = closing.cancelled() => return,
                _ = sleep_until(due) => {}
            }

            let Some(c) = connection.upgrade() else {
                return;
            };
            if Instant::now() < *c.last_activity.lock().await + c.idle_limit() {
                continue;
            }

            if !c.keep_alive {
                debug!(connection = ?c, "peer connection idle - closing");
                c.close().await;
                return;
            }

            trace!(connection = ?c, "sending heartbeat");
            let ping = Message::request(c.sender.context().self_address.clone(), c.remote.clone(), Command::PING, Bytes::new());
            if let Err(e) = c.send(ping).await {
                debug!(connection = ?c, "heartbeat failed, closing: {}", e);
                c.close().await;
                return;
            }
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

#[cfg(test)]
mod test {
    use tokio::runtime::Builder;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::sleep;

    use crate::config::TransportConfig;
    use crate::connection::context::TransportContext;
    use crate::connection::dispatcher::Dispatcher;
    use crate::connection::peer_status::{FailureReason, PeerStatusListeners};
    use crate::connection::pending_replies::PendingReplyTable;
    use crate::messaging::codec::{BinaryWireCodec, Decoded};
    use crate::messaging::message::{ExchangeKey, MessageType};
    use crate::messaging::signature::Ed25519SignatureProvider;
    use crate::metrics::NoopMetrics;
    use crate::test_util::datagram::{ChannelDatagramSender, SentDatagram};
    use crate::test_util::listener::{PeerEvent, RecordingPeerStatusListener};
    use crate::test_util::peer::test_peer_address_from_number;
    use crate::tunnel::broker::TunnelBroker;

    use super::*;

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    async fn sender() -> (Arc<Sender>, UnboundedReceiver<SentDatagram>, Arc<RecordingPeerStatusListener>) {
        let config = TransportConfig {
            heartbeat_interval: Duration::from_secs(2),
            idle_timeout_udp: Duration::from_millis(500),
            receive_poll_interval: Duration::from_millis(100),
            max_permits_udp: 1,
            ..TransportConfig::localhost()
        };
        let listener = Arc::new(RecordingPeerStatusListener::default());
        let peer_status = Arc::new(PeerStatusListeners::default());
        peer_status.add(listener.clone()).await;

        let self_address = test_peer_address_from_number(1);
        let (datagram_sender, outbound) = ChannelDatagramSender::new(self_address.primary_udp().unwrap());
        let ctx = Arc::new(TransportContext {
            tunnel_broker: Arc::new(TunnelBroker::new(&config, datagram_sender.clone(), Arc::new(NoopMetrics))),
            dispatcher: Arc::new(Dispatcher::new(config.p2p_version, self_address.peer_id, peer_status.clone())),
            config,
            self_address,
            key_pair: None,
            codec: Arc::new(BinaryWireCodec::new(Arc::new(Ed25519SignatureProvider))),
            pending: Arc::new(PendingReplyTable::new(Arc::new(NoopMetrics))),
            peer_status,
            metrics: Arc::new(NoopMetrics),
        });
        (Arc::new(Sender::new(ctx, datagram_sender)), outbound, listener)
    }

    /// answers every request with `Ok` and forwards its command to the test
    fn answer_requests(ctx: Arc<TransportContext>, mut outbound: UnboundedReceiver<SentDatagram>) -> UnboundedReceiver<(Command, bool)> {
        let (commands_send, commands) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(SentDatagram { from, to, buf }) = outbound.recv().await {
                let Ok(Decoded::Complete(request)) = ctx.codec.decode(&buf, to, from) else {
                    continue;
                };
                commands_send.send((request.command, request.keep_alive)).ok();
                let reply = Message::reply_to(&request, MessageType::Ok);
                ctx.pending.resolve(&ExchangeKey::of_reply(&reply), reply).await;
            }
        });
        commands
    }

    fn request() -> Message {
        Message::request(test_peer_address_from_number(1), test_peer_address_from_number(2), Command(1), "x")
    }

    #[test]
    fn test_holds_permit_until_closed() {
        paused_runtime().block_on(async {
            let (sender, outbound, _) = sender().await;
            let mut commands = answer_requests(sender.context().clone(), outbound);

            let connection = PeerConnection::open(sender.clone(), test_peer_address_from_number(2), true).await.unwrap();
            assert_eq!(sender.pool(ChannelKind::Udp).available(), 0);

            connection.send(request()).await.unwrap();
            assert_eq!(commands.recv().await.unwrap(), (Command(1), true));
            assert_eq!(sender.pool(ChannelKind::Udp).available(), 0);

            connection.close().await;
            connection.close().await;
            connection.closed().await;
            assert_eq!(sender.pool(ChannelKind::Udp).available(), 1);
            assert!(matches!(connection.send(request()).await, Err(TransportError::ConnectionClosed)));
        });
    }

    #[test]
    fn test_heartbeat_when_idle() {
        paused_runtime().block_on(async {
            let (sender, outbound, _) = sender().await;
            let mut commands = answer_requests(sender.context().clone(), outbound);

            let connection = PeerConnection::open(sender.clone(), test_peer_address_from_number(2), true).await.unwrap();
            sleep(Duration::from_millis(1900)).await;
            assert!(commands.try_recv().is_err());

            sleep(Duration::from_millis(200)).await;
            assert_eq!(commands.recv().await.unwrap(), (Command::PING, true));
            assert!(!connection.is_closed());
        });
    }

    #[test]
    fn test_failed_heartbeat_closes_connection() {
        paused_runtime().block_on(async {
            // nobody answers
            let (sender, _outbound, listener) = sender().await;

            let connection = PeerConnection::open(sender.clone(), test_peer_address_from_number(2), true).await.unwrap();
            connection.closed().await;

            assert!(connection.is_closed());
            assert_eq!(sender.pool(ChannelKind::Udp).available(), 1);
            assert_eq!(listener.events(), vec![PeerEvent::Failed(test_peer_address_from_number(2), FailureReason::Timeout)]);
        });
    }

    #[test]
    fn test_idle_connection_without_keep_alive_closes() {
        paused_runtime().block_on(async {
            let (sender, _outbound, _) = sender().await;

            let start = Instant::now();
            let connection = PeerConnection::open(sender.clone(), test_peer_address_from_number(2), false).await.unwrap();
            connection.closed().await;

            assert!(start.elapsed() >= Duration::from_millis(500));
            assert_eq!(sender.pool(ChannelKind::Udp).available(), 1);
        });
    }

    #[test]
    fn test_dropping_releases_permit() {
        paused_runtime().block_on(async {
            let (sender, _outbound, _) = sender().await;
            let connection = PeerConnection::open(sender.clone(), test_peer_address_from_number(2), true).await.unwrap();
            let closed = connection.channel_closed.clone();
            drop(connection);

            closed.wait().await;
            assert_eq!(sender.pool(ChannelKind::Udp).available(), 1);
        });
    }

    #[test]
    fn test_close_aborts_exchange_in_progress() {
        paused_runtime().block_on(async {
            // nobody answers
            let (sender, mut outbound, _) = sender().await;
            let connection = PeerConnection::open(sender.clone(), test_peer_address_from_number(2), true).await.unwrap();

            let in_flight = tokio::spawn({
                let connection = connection.clone();
                async move { connection.send(request()).await }
            });
            sleep(Duration::from_millis(10)).await;
            assert!(outbound.recv().await.is_some());

            let start = Instant::now();
            connection.close().await;
            assert!(start.elapsed() < Duration::from_millis(100));
            assert!(matches!(in_flight.await.unwrap(), Err(TransportError::ConnectionClosed)));
            connection.closed().await;
            assert_eq!(sender.pool(ChannelKind::Udp).available(), 1);

            assert!(matches!(connection.send(request()).await, Err(TransportError::ConnectionClosed)));
            assert!(outbound.try_recv().is_err());
        });
    }
}
