use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::connection::socket_endpoint::DatagramSender;
use crate::error::TransportError;
use crate::tunnel::frame::TunnelFrame;

/// Out-of-order data frames beyond this are dropped
pub const MAX_REORDER_FRAMES: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Established,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// sent the request that asked for the tunnel, drives the handshake
    Initiator,
    Responder,
}

struct Inbound {
    last_activity: Instant,
    next_expected_seq: u32,
    reorder_buffer: BTreeMap<u32, Bytes>,
    /// `None` once the session is closed, which ends the consumer's stream
    consumer: Option<mpsc::UnboundedSender<Bytes>>,
}

/// A stream of payloads multiplexed into the UDP flow to one remote socket address. Payloads are
///  delivered in the order they were sent, without duplicates. There is no retransmission: a
///  lost data frame leaves a gap that is never filled, and frames behind it stay buffered.
pub struct TunnelSession {
    remote: SocketAddr,
    /// the message id of the request that asked for the tunnel, known to both sides
    session_id: u32,
    role: Role,
    datagram_sender: Arc<dyn DatagramSender>,
    state: watch::Sender<SessionState>,
    next_send_seq: AtomicU32,
    inbound: Mutex<Inbound>,
    received: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl Debug for TunnelSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TunnelSession{{{:?} {:?} #{:08x}: {:?}}}", self.role, self.remote, self.session_id(), self.state())
    }
}

impl TunnelSession {
    pub fn new(remote: SocketAddr, session_id: u32, role: Role, datagram_sender: Arc<dyn DatagramSender>) -> TunnelSession {
        let (consumer, received) = mpsc::unbounded_channel();
        TunnelSession {
            remote,
            session_id,
            role,
            datagram_sender,
            state: watch::Sender::new(SessionState::Uninitialized),
            next_send_seq: AtomicU32::new(0),
            inbound: Mutex::new(Inbound {
                last_activity: Instant::now(),
                next_expected_seq: 0,
                reorder_buffer: BTreeMap::new(),
                consumer: Some(consumer),
            }),
            received: Mutex::new(received),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Moves to a new state. Nothing ever leaves `Closed`, and this returns `false` for an
    ///  attempt to do so.
    pub(crate) fn transition(&self, to: SessionState) -> bool {
        self.transition_from(to).is_some()
    }

    /// Like [TunnelSession::transition], returning the state the session left if it changed.
    fn transition_from(&self, to: SessionState) -> Option<SessionState> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Closed || *state == to {
                return false;
            }
            trace!(remote = ?self.remote, from = ?*state, ?to, "tunnel session state change");
            previous = Some(*state);
            *state = to;
            true
        });
        previous
    }

    /// Waits until the session leaves `Uninitialized` / `Connecting`, returning the state it
    ///  ended up in.
    pub async fn handshake_done(&self) -> SessionState {
        let mut state = self.state.subscribe();
        let result = match state.wait_for(|s| !matches!(s, SessionState::Uninitialized | SessionState::Connecting)).await {
            Ok(s) => *s,
            Err(_) => SessionState::Closed,
        };
        result
    }

    pub async fn touch(&self) {
        self.inbound.lock().await.last_activity = Instant::now();
    }

    pub async fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.inbound.lock().await.last_activity) >= idle_timeout
    }

    pub(crate) async fn send_frame(&self, frame: &TunnelFrame) -> Result<(), TransportError> {
        self.datagram_sender.send_datagram(self.remote, &frame.to_bytes()).await
            .map(|_| ())
    }

    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), TransportError> {
        match self.state() {
            SessionState::Established => {}
            SessionState::Closing | SessionState::Closed => return Err(TransportError::ConnectionClosed),
            other => return Err(TransportError::ProtocolError(format!("tunnel to {:?} is not established: {:?}", self.remote, other))),
        }

        let seq = self.next_send_seq.fetch_add(1, Ordering::AcqRel);
        self.send_frame(&TunnelFrame::Data {
            session_id: self.session_id(),
            seq,
            payload: payload.into(),
        }).await
    }

    /// The next payload in sequence order, or `None` once the session is closed and everything
    ///  received before was consumed.
    pub async fn recv(&self) -> Option<Bytes> {
        self.received.lock().await
            .recv().await
    }

    pub(crate) async fn on_data(&self, seq: u32, payload: Bytes) {
        let mut inbound = self.inbound.lock().await;
        inbound.last_activity = Instant::now();

        // sequence numbers wrap around, so 'ahead' and 'behind' are relative to the expected one
        let ahead = seq.wrapping_sub(inbound.next_expected_seq) as i32;
        if ahead < 0 || inbound.reorder_buffer.contains_key(&seq) {
            debug!(remote = ?self.remote, seq, "duplicate tunnel frame - dropping");
            return;
        }
        if ahead > 0 {
            if inbound.reorder_buffer.len() >= MAX_REORDER_FRAMES {
                warn!(remote = ?self.remote, seq, expected = inbound.next_expected_seq, "tunnel reorder buffer is full - dropping frame");
                return;
            }
            inbound.reorder_buffer.insert(seq, payload);
            return;
        }

        let Inbound { next_expected_seq, reorder_buffer, consumer, .. } = &mut *inbound;
        let Some(consumer) = consumer else {
            return;
        };
        consumer.send(payload).ok();
        *next_expected_seq = next_expected_seq.wrapping_add(1);
        while let Some(buffered) = reorder_buffer.remove(next_expected_seq) {
            consumer.send(buffered).ok();
            *next_expected_seq = next_expected_seq.wrapping_add(1);
        }
    }

    /// Closes the session locally, notifying the remote side unless it initiated the close.
    ///  Idempotent.
    pub async fn close(&self) {
        let notify_remote = match self.transition_from(SessionState::Closing) {
            Some(previous) => matches!(previous, SessionState::Connecting | SessionState::Established),
            // already closing: whoever moved it there sends the close frame
            None if self.state() == SessionState::Closing => false,
            None => return,
        };
        if notify_remote {
            if let Err(e) = self.send_frame(&TunnelFrame::Close { session_id: self.session_id() }).await {
                debug!(remote = ?self.remote, "could not send tunnel close frame: {}", e);
            }
        }
        self.on_closed().await;
    }

    pub(crate) async fn on_closed(&self) {
        self.transition(SessionState::Closed);
        let mut inbound = self.inbound.lock().await;
        inbound.consumer = None;
        inbound.reorder_buffer.clear();
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use rstest::rstest;
    use tokio::join;
    use tokio::runtime::Builder;
    use tokio::time::sleep;

    use crate::connection::socket_endpoint::MockDatagramSender;

    use super::*;

    fn remote() -> SocketAddr {
        SocketAddr::from_str("127.0.0.1:9000").unwrap()
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    fn session(datagram_sender: MockDatagramSender) -> TunnelSession {
        let session = TunnelSession::new(remote(), 5, Role::Initiator, Arc::new(datagram_sender));
        session.transition(SessionState::Connecting);
        session.transition(SessionState::Established);
        session
    }

    #[test]
    fn test_in_order_delivery() {
        paused_runtime().block_on(async {
            let session = session(MockDatagramSender::new());
            session.on_data(1, Bytes::from_static(b"b")).await;
            session.on_data(0, Bytes::from_static(b"a")).await;
            session.on_data(0, Bytes::from_static(b"a")).await;
            session.on_data(3, Bytes::from_static(b"d")).await;
            session.on_data(2, Bytes::from_static(b"c")).await;
            session.on_data(1, Bytes::from_static(b"b")).await;

            for expected in ["a", "b", "c", "d"] {
                assert_eq!(session.recv().await.unwrap().as_ref(), expected.as_bytes());
            }

            session.on_closed().await;
            assert_eq!(session.recv().await, None);
        });
    }

    #[test]
    fn test_reorder_buffer_is_bounded() {
        paused_runtime().block_on(async {
            let session = session(MockDatagramSender::new());
            for seq in 1..=(MAX_REORDER_FRAMES as u32 + 10) {
                session.on_data(seq, Bytes::from_static(b"x")).await;
            }
            assert_eq!(session.inbound.lock().await.reorder_buffer.len(), MAX_REORDER_FRAMES);

            session.on_data(0, Bytes::from_static(b"x")).await;
            assert_eq!(session.inbound.lock().await.next_expected_seq, MAX_REORDER_FRAMES as u32 + 1);
        });
    }

    #[test]
    fn test_send_numbers_frames() {
        paused_runtime().block_on(async {
            let mut datagram_sender = MockDatagramSender::new();
            datagram_sender.expect_send_datagram()
                .withf(|to, buf| *to == remote() && TunnelFrame::try_deser(buf).unwrap() == TunnelFrame::Data { session_id: 5, seq: 0, payload: Bytes::from_static(b"first") })
                .times(1)
                .returning(|_, buf| Ok(buf.len()));
            datagram_sender.expect_send_datagram()
                .withf(|_, buf| TunnelFrame::try_deser(buf).unwrap() == TunnelFrame::Data { session_id: 5, seq: 1, payload: Bytes::from_static(b"second") })
                .times(1)
                .returning(|_, buf| Ok(buf.len()));

            let session = session(datagram_sender);
            session.send("first").await.unwrap();
            session.send("second").await.unwrap();
        });
    }

    #[test]
    fn test_send_requires_established() {
        paused_runtime().block_on(async {
            let session = TunnelSession::new(remote(), 5, Role::Initiator, Arc::new(MockDatagramSender::new()));
            assert!(matches!(session.send("x").await, Err(TransportError::ProtocolError(_))));

            session.on_closed().await;
            assert!(matches!(session.send("x").await, Err(TransportError::ConnectionClosed)));
        });
    }

    #[test]
    fn test_closed_is_terminal() {
        paused_runtime().block_on(async {
            let mut datagram_sender = MockDatagramSender::new();
            datagram_sender.expect_send_datagram()
                .withf(|_, buf| TunnelFrame::try_deser(buf).unwrap() == TunnelFrame::Close { session_id: 5 })
                .times(1)
                .returning(|_, buf| Ok(buf.len()));

            let session = session(datagram_sender);
            session.close().await;
            session.close().await;
            assert_eq!(session.state(), SessionState::Closed);

            assert!(!session.transition(SessionState::Established));
            assert_eq!(session.state(), SessionState::Closed);
            assert_eq!(session.handshake_done().await, SessionState::Closed);
        });
    }

    #[test]
    fn test_sequence_numbers_wrap_around() {
        paused_runtime().block_on(async {
            let session = session(MockDatagramSender::new());
            session.inbound.lock().await.next_expected_seq = u32::MAX - 1;

            session.on_data(0, Bytes::from_static(b"c")).await;
            session.on_data(u32::MAX, Bytes::from_static(b"b")).await;
            session.on_data(u32::MAX - 1, Bytes::from_static(b"a")).await;
            session.on_data(u32::MAX, Bytes::from_static(b"b")).await;
            session.on_data(1, Bytes::from_static(b"d")).await;

            for expected in ["a", "b", "c", "d"] {
                assert_eq!(session.recv().await.unwrap().as_ref(), expected.as_bytes());
            }
            let inbound = session.inbound.lock().await;
            assert_eq!(inbound.next_expected_seq, 2);
            assert!(inbound.reorder_buffer.is_empty());
        });
    }

    #[test]
    fn test_send_sequence_wraps_around() {
        paused_runtime().block_on(async {
            let mut datagram_sender = MockDatagramSender::new();
            datagram_sender.expect_send_datagram()
                .withf(|_, buf| TunnelFrame::try_deser(buf).unwrap() == TunnelFrame::Data { session_id: 5, seq: u32::MAX, payload: Bytes::from_static(b"last") })
                .times(1)
                .returning(|_, buf| Ok(buf.len()));
            datagram_sender.expect_send_datagram()
                .withf(|_, buf| TunnelFrame::try_deser(buf).unwrap() == TunnelFrame::Data { session_id: 5, seq: 0, payload: Bytes::from_static(b"wrapped") })
                .times(1)
                .returning(|_, buf| Ok(buf.len()));

            let session = session(datagram_sender);
            session.next_send_seq.store(u32::MAX, Ordering::Release);
            session.send("last").await.unwrap();
            session.send("wrapped").await.unwrap();
        });
    }

    #[rstest]
    #[case::connecting(SessionState::Connecting, 1)]
    #[case::established(SessionState::Established, 1)]
    #[case::closing(SessionState::Closing, 0)]
    #[case::uninitialized(SessionState::Uninitialized, 0)]
    fn test_close_notifies_remote_once(#[case] from: SessionState, #[case] num_close_frames: usize) {
        paused_runtime().block_on(async {
            let mut datagram_sender = MockDatagramSender::new();
            datagram_sender.expect_send_datagram()
                .withf(|_, buf| TunnelFrame::try_deser(buf).unwrap() == TunnelFrame::Close { session_id: 5 })
                .times(num_close_frames)
                .returning(|_, buf| Ok(buf.len()));

            let session = TunnelSession::new(remote(), 5, Role::Initiator, Arc::new(datagram_sender));
            if from != SessionState::Uninitialized {
                session.transition(SessionState::Connecting);
                session.transition(from);
            }

            join!(session.close(), session.close());
            session.close().await;
            assert_eq!(session.state(), SessionState::Closed);
        });
    }

    #[test]
    fn test_idle_tracking() {
        paused_runtime().block_on(async {
            let session = session(MockDatagramSender::new());
            sleep(Duration::from_secs(2)).await;
            assert!(session.is_idle(Instant::now(), Duration::from_secs(1)).await);

            session.on_data(0, Bytes::from_static(b"x")).await;
            assert!(!session.is_idle(Instant::now(), Duration::from_secs(1)).await);
        });
    }
}
