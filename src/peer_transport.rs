use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::TransportConfig;
use crate::connection::bindings::bind_all;
use crate::connection::context::TransportContext;
use crate::connection::dispatcher::{Dispatcher, Handler, Responder};
use crate::connection::inbound::InboundRouter;
use crate::connection::peer_status::PeerStatusListeners;
use crate::connection::pending_replies::PendingReplyTable;
use crate::connection::sender::Sender;
use crate::connection::socket_endpoint::{DatagramSender, SocketEndpoint};
use crate::connection::tcp;
use crate::messaging::codec::BinaryWireCodec;
use crate::messaging::message::{Command, Message, MessageType};
use crate::messaging::peer_address::{PeerAddress, PeerId};
use crate::messaging::signature::{Ed25519SignatureProvider, KeyPair};
use crate::metrics::MetricsSink;
use crate::tunnel::broker::TunnelBroker;

/// Answers pings, so any peer can check whether this one is alive
struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, request: Message, responder: Responder) {
        responder.respond(Message::reply_to(&request, MessageType::Ok));
    }
}

/// A running transport: bound sockets, their receive and accept loops, and the components
///  applications use to send requests and to register handlers.
pub struct PeerTransport {
    ctx: Arc<TransportContext>,
    sender: Arc<Sender>,
    endpoints: Vec<Arc<SocketEndpoint>>,
    tcp_accepting: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl PeerTransport {
    /// Binds all configured addresses and starts serving. Outbound datagrams leave through the
    ///  first bound endpoint, replies to inbound requests through the endpoint the request
    ///  arrived on.
    pub async fn start(config: TransportConfig, self_id: PeerId, key_pair: Option<KeyPair>, metrics: Arc<dyn MetricsSink>) -> anyhow::Result<PeerTransport> {
        config.validate()?;

        let bound = bind_all(&config, metrics.clone())?;
        let primary: Arc<dyn DatagramSender> = bound.first()
            .ok_or_else(|| anyhow!("no endpoint was bound"))?
            .udp.clone();
        let self_address = PeerAddress::new(self_id, bound.iter().map(|b| b.advertised).collect());

        let peer_status = Arc::new(PeerStatusListeners::default());
        let ctx = Arc::new(TransportContext {
            tunnel_broker: Arc::new(TunnelBroker::new(&config, primary.clone(), metrics.clone())),
            dispatcher: Arc::new(Dispatcher::new(config.p2p_version, self_id, peer_status.clone())),
            pending: Arc::new(PendingReplyTable::new(metrics.clone())),
            codec: Arc::new(BinaryWireCodec::new(Arc::new(Ed25519SignatureProvider))),
            config,
            self_address: self_address.clone(),
            key_pair,
            peer_status,
            metrics,
        });
        ctx.dispatcher.register(self_id, self_id, Command::PING, Arc::new(PingHandler)).await;

        let sender = Arc::new(Sender::new(ctx.clone(), primary));

        let tcp_accepting = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut endpoints = Vec::new();
        for b in bound {
            let router = Arc::new(InboundRouter::new(ctx.clone(), b.udp.clone()));
            tasks.push(tokio::spawn(b.udp.clone().run_receive_loop(router)));
            if let Some(listener) = b.tcp {
                tasks.push(tokio::spawn(tcp::run_accept_loop(listener, ctx.clone(), tcp_accepting.clone())));
            }
            endpoints.push(b.udp);
        }

        info!(?self_address, "peer transport started");
        Ok(PeerTransport {
            ctx,
            sender,
            endpoints,
            tcp_accepting,
            tasks: Mutex::new(tasks),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn self_address(&self) -> &PeerAddress {
        &self.ctx.self_address
    }

    pub fn config(&self) -> &TransportConfig {
        &self.ctx.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.ctx.dispatcher
    }

    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    pub fn tunnel_broker(&self) -> &Arc<TunnelBroker> {
        &self.ctx.tunnel_broker
    }

    pub fn peer_status(&self) -> &Arc<PeerStatusListeners> {
        &self.ctx.peer_status
    }

    /// Registers a handler for requests addressed to this peer
    pub async fn register_handler(&self, command: Command, handler: Arc<dyn Handler>) {
        let own_id = self.ctx.self_address.peer_id;
        self.ctx.dispatcher.register(own_id, own_id, command, handler).await;
    }

    /// Stops serving and fails everything that is still in flight. Waiting for open channels is
    ///  bounded. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(self_address = ?self.ctx.self_address, "shutting down peer transport");

        // while the sockets are still open, so the remote sides learn about it
        self.ctx.tunnel_broker.close_all().await;

        self.tcp_accepting.cancel();
        for endpoint in &self.endpoints {
            endpoint.close();
        }
        self.ctx.pending.close().await;

        let bound = self.ctx.config.shutdown_timeout;
        self.sender.shutdown(bound).await;

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            match timeout(bound, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("transport task failed: {}", e),
                Err(_) => warn!("transport task did not terminate within {:?}", bound),
            }
        }
        info!("peer transport shut down");
    }
}
