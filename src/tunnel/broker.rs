use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::connection::socket_endpoint::DatagramSender;
use crate::error::TransportError;
use crate::metrics::{MetricsSink, PACKETS_DROPPED};
use crate::tunnel::frame::TunnelFrame;
use crate::tunnel::session::{Role, SessionState, TunnelSession};

/// Keeps track of tunnel sessions, at most one per remote socket address.
///
/// A session that reached `Closed` is removed and never comes back: the next tunnel to the same
///  address is a fresh session with a fresh id.
pub struct TunnelBroker {
    idle_timeout: Duration,
    handshake_timeout: Duration,
    connect_retry: Duration,
    datagram_sender: Arc<dyn DatagramSender>,
    sessions: RwLock<FxHashMap<SocketAddr, Arc<TunnelSession>>>,
    accepted_send: mpsc::UnboundedSender<Arc<TunnelSession>>,
    accepted: Mutex<mpsc::UnboundedReceiver<Arc<TunnelSession>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl TunnelBroker {
    pub fn new(config: &TransportConfig, datagram_sender: Arc<dyn DatagramSender>, metrics: Arc<dyn MetricsSink>) -> TunnelBroker {
        let (accepted_send, accepted) = mpsc::unbounded_channel();
        TunnelBroker {
            idle_timeout: config.tunnel_idle_timeout,
            handshake_timeout: config.tunnel_handshake_timeout,
            connect_retry: config.tunnel_connect_retry,
            datagram_sender,
            sessions: Default::default(),
            accepted_send,
            accepted: Mutex::new(accepted),
            metrics,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn session(&self, remote: SocketAddr) -> Option<Arc<TunnelSession>> {
        self.sessions.read().await
            .get(&remote)
            .cloned()
    }

    /// Leaves a live session to the same address in place and returns it as the error. Any other
    ///  session to that address is replaced and closed.
    async fn insert(&self, session: Arc<TunnelSession>) -> Result<(), Arc<TunnelSession>> {
        let previous = {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(&session.remote()) {
                if is_live(existing) {
                    return Err(existing.clone());
                }
            }
            sessions.insert(session.remote(), session.clone())
        };
        if let Some(previous) = previous {
            debug!(?previous, "replacing tunnel session");
            previous.close().await;
        }
        Ok(())
    }

    /// Only removes the entry if it is still the given session
    async fn remove(&self, session: &Arc<TunnelSession>) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(&session.remote()).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(&session.remote());
        }
    }

    /// Registers a session for a tunnel this peer is about to request, using the request's
    ///  message id as session id. The session is in `Connecting` state, the handshake starts with
    ///  [TunnelBroker::handshake].
    ///
    /// There is at most one live tunnel per remote address: if a session to `remote` is
    ///  established or closing, this fails and leaves that session alone.
    pub async fn prepare(&self, remote: SocketAddr, session_id: u32) -> Result<Arc<TunnelSession>, TransportError> {
        let session = Arc::new(TunnelSession::new(remote, session_id, Role::Initiator, self.datagram_sender.clone()));
        session.transition(SessionState::Connecting);
        if let Err(existing) = self.insert(session.clone()).await {
            debug!(?existing, "refusing to replace a live tunnel session");
            return Err(TransportError::TunnelHandshakeFailure(format!("a tunnel to {:?} is already {:?}", remote, existing.state())));
        }
        debug!(?session, "prepared tunnel session");
        Ok(session)
    }

    /// Closes a prepared session whose tunnel request failed, and forgets it
    pub async fn abandon(&self, session: &Arc<TunnelSession>) {
        session.close().await;
        self.remove(session).await;
    }

    /// Sends `Connect` frames until the remote side acknowledges or the handshake timeout passes.
    ///  A failed handshake closes and removes the session, and affects nothing else.
    pub async fn handshake(&self, session: &Arc<TunnelSession>) -> Result<(), TransportError> {
        let connect = TunnelFrame::Connect { session_id: session.session_id() };

        let outcome = timeout(self.handshake_timeout, async {
            loop {
                if let Err(e) = session.send_frame(&connect).await {
                    return Err(e);
                }
                select! {
                    state = session.handshake_done() => return Ok(state),
                    _ = sleep(self.connect_retry) => trace!(remote = ?session.remote(), "retrying tunnel connect"),
                }
            }
        }).await;

        let failure = match outcome {
            Ok(Ok(SessionState::Established)) => {
                info!(?session, "tunnel established");
                return Ok(());
            }
            Ok(Ok(state)) => format!("session ended up {:?}", state),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no ack within {:?}", self.handshake_timeout),
        };

        warn!(?session, "tunnel handshake failed: {}", failure);
        session.on_closed().await;
        self.remove(session).await;
        Err(TransportError::TunnelHandshakeFailure(failure))
    }

    /// Registers a responder session for a remote peer that requested a tunnel, with the
    ///  request's message id as session id. It becomes established when the peer's `Connect`
    ///  frame for that id arrives, and is then handed out by [TunnelBroker::accept].
    ///
    /// An established or closing session to the same address stays in place, and no responder
    ///  is registered: the requesting peer's handshake fails.
    pub async fn expect_responder(&self, remote: SocketAddr, session_id: u32) {
        if let Some(existing) = self.session(remote).await {
            if existing.role() == Role::Responder && existing.state() == SessionState::Connecting && existing.session_id() == session_id {
                trace!(?existing, "already expecting this tunnel");
                return;
            }
        }

        let session = Arc::new(TunnelSession::new(remote, session_id, Role::Responder, self.datagram_sender.clone()));
        session.transition(SessionState::Connecting);
        if let Err(existing) = self.insert(session).await {
            warn!(?existing, "tunnel request from an address with a live tunnel - ignoring");
            return;
        }
        debug!(?remote, session_id, "expecting tunnel connect");
    }

    /// Waits for the next tunnel a remote peer established with this peer. Returns `None` once
    ///  the broker is dropped.
    pub async fn accept(&self) -> Option<Arc<TunnelSession>> {
        self.accepted.lock().await
            .recv().await
    }

    pub async fn on_frame(&self, from: SocketAddr, buf: &[u8]) {
        let frame = match TunnelFrame::try_deser(buf) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(?from, "dropping malformed tunnel frame: {}", e);
                self.metrics.inc_counter(PACKETS_DROPPED, 1);
                return;
            }
        };

        let Some(session) = self.session(from).await else {
            warn!(?from, ?frame, "tunnel frame from an address without a session - dropping");
            self.metrics.inc_counter(PACKETS_DROPPED, 1);
            return;
        };

        if session.state() == SessionState::Closed {
            debug!(?session, "tunnel frame for a closed session - dropping");
            self.remove(&session).await;
            self.metrics.inc_counter(PACKETS_DROPPED, 1);
            return;
        }

        if frame.session_id() != session.session_id() {
            warn!(?session, ?frame, "tunnel frame with a foreign session id - dropping");
            self.metrics.inc_counter(PACKETS_DROPPED, 1);
            return;
        }

        session.touch().await;

        match frame {
            TunnelFrame::Connect { session_id } => self.on_connect(&session, session_id).await,
            TunnelFrame::ConnectAck { .. } => {
                if session.role() == Role::Initiator && session.transition(SessionState::Established) {
                    trace!(?session, "received tunnel connect ack");
                }
            }
            TunnelFrame::Data { seq, payload, .. } => {
                if session.state() == SessionState::Established {
                    session.on_data(seq, payload).await;
                }
                else {
                    debug!(?session, "data frame before the tunnel is established - dropping");
                    self.metrics.inc_counter(PACKETS_DROPPED, 1);
                }
            }
            TunnelFrame::Close { .. } => {
                debug!(?session, "remote side closed the tunnel");
                session.on_closed().await;
                self.remove(&session).await;
            }
        }
    }

    async fn on_connect(&self, session: &Arc<TunnelSession>, session_id: u32) {
        if session.role() != Role::Responder {
            warn!(?session, "connect frame for a tunnel this peer initiated - dropping");
            return;
        }

        if session.state() == SessionState::Connecting {
            session.transition(SessionState::Established);
            info!(?session, "tunnel accepted");
            self.accepted_send.send(session.clone()).ok();
        }

        // repeated connects mean our ack got lost
        if let Err(e) = session.send_frame(&TunnelFrame::ConnectAck { session_id }).await {
            warn!(?session, "could not send tunnel connect ack: {}", e);
        }
    }

    /// Closes and removes sessions without inbound traffic for the idle timeout, and removes
    ///  sessions that were closed locally. Returns the number of sessions that expired.
    pub async fn sweep_idle(&self, now: Instant) -> usize {
        let sessions = self.sessions.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut num_expired = 0;
        for session in sessions {
            if session.state() == SessionState::Closed {
                self.remove(&session).await;
            }
            else if session.is_idle(now, self.idle_timeout).await {
                debug!(?session, "tunnel session expired");
                num_expired += 1;
                session.close().await;
                self.remove(&session).await;
            }
        }
        num_expired
    }

    pub async fn close_all(&self) {
        let sessions = self.sessions.write().await
            .drain()
            .map(|(_, s)| s)
            .collect::<Vec<_>>();
        if !sessions.is_empty() {
            info!("closing {} tunnel sessions", sessions.len());
        }
        for session in sessions {
            session.close().await;
        }
    }
}

/// established or closing, i.e. not to be replaced by a new session
fn is_live(session: &TunnelSession) -> bool {
    matches!(session.state(), SessionState::Established | SessionState::Closing)
}
