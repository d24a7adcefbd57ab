use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::metrics::{MetricsSink, PACKETS_DROPPED, PACKETS_RECEIVED, PACKETS_SENT};

/// This is an abstraction for sending a datagram, introduced to facilitate mocking the I/O part
///  away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSender: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> Result<usize, TransportError>;

    fn local_addr(&self) -> SocketAddr;
}

/// Processes what a [SocketEndpoint]'s receive loop picks up. It is called inline from the
///  receive loop, so anything non-trivial should be offloaded to a separate task.
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, from: SocketAddr, buf: &[u8]);

    /// called at least once per poll interval, regardless of traffic
    async fn on_poll_tick(&self);
}

#[derive(Debug, Eq, PartialEq)]
pub enum Received {
    Datagram { from: SocketAddr, len: usize },
    /// the datagram did not fit into the buffer and was cut off by the platform
    Truncated { from: SocketAddr },
    Timeout,
    Closed,
}

/// Owns one bound UDP socket. Receiving never waits longer than the poll interval, so the
///  receive loop regularly gets a chance to do housekeeping and to notice shutdown.
pub struct SocketEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    receive_buffer_size: usize,
    poll_interval: Duration,
    closed: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
}

impl SocketEndpoint {
    /// Binds a UDP socket to `addr`, optionally with the broadcast flag set. This must be called
    ///  from inside a Tokio runtime.
    pub fn bind(addr: SocketAddr, broadcast: bool, config: &TransportConfig, metrics: Arc<dyn MetricsSink>) -> Result<SocketEndpoint, TransportError> {
        let socket = Self::create_socket(addr, broadcast)
            .and_then(UdpSocket::from_std)
            .map_err(|source| TransportError::BindFailure { addr, source })?;
        let local_addr = socket.local_addr()?;

        info!("bound UDP socket to {:?}{}", local_addr, if broadcast { " (broadcast)" } else { "" });

        Ok(SocketEndpoint {
            socket,
            local_addr,
            receive_buffer_size: config.receive_buffer_size,
            poll_interval: config.receive_poll_interval,
            closed: CancellationToken::new(),
            metrics,
        })
    }

    fn create_socket(addr: SocketAddr, broadcast: bool) -> std::io::Result<std::net::UdpSocket> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if broadcast {
            socket.set_broadcast(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        Ok(socket.into())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Waits for a single datagram, for at most the poll interval. A datagram that fills the
    ///  entire buffer is reported as truncated.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<Received, TransportError> {
        if self.closed.is_cancelled() {
            return Ok(Received::Closed);
        }

        select! {
            _ = self.closed.cancelled() => Ok(Received::Closed),
            r = timeout(self.poll_interval, self.socket.recv_from(buf)) => match r {
                Err(_) => Ok(Received::Timeout),
                Ok(Ok((len, from))) if len >= buf.len() => Ok(Received::Truncated { from }),
                Ok(Ok((len, from))) => Ok(Received::Datagram { from, len }),
                Ok(Err(e)) => Err(e.into()),
            }
        }
    }

    /// Idempotent. Wakes up the receive loop, and sends that are still in progress fail.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            info!("closing UDP socket {:?}", self.local_addr);
            self.closed.cancel();
        }
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub async fn run_receive_loop(self: Arc<Self>, handler: Arc<dyn DatagramHandler>) {
        let mut buf = vec![0u8; self.receive_buffer_size];
        let mut last_tick = Instant::now();

        debug!("starting UDP receive loop on {:?}", self.local_addr);

        loop {
            match self.receive(&mut buf).await {
                Ok(Received::Datagram { from, len }) => {
                    self.metrics.inc_counter(PACKETS_RECEIVED, 1);
                    let span = span!(Level::TRACE, "datagram", correlation_id = %Uuid::new_v4());
                    trace!(parent: &span, ?from, len, "received datagram");
                    handler.on_datagram(from, &buf[..len])
                        .instrument(span)
                        .await;
                }
                Ok(Received::Truncated { from }) => {
                    self.metrics.inc_counter(PACKETS_DROPPED, 1);
                    warn!("received a datagram from {:?} exceeding the receive buffer of {} bytes - skipping", from, self.receive_buffer_size);
                }
                Ok(Received::Timeout) => {}
                Ok(Received::Closed) => break,
                Err(e) => {
                    error!(error = ?e, "error receiving from datagram socket");
                }
            }

            if last_tick.elapsed() >= self.poll_interval {
                handler.on_poll_tick().await;
                last_tick = Instant::now();
            }
        }

        info!("shutting down UDP receive loop on {:?}", self.local_addr);
    }
}

#[async_trait]
impl DatagramSender for SocketEndpoint {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> Result<usize, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        select! {
            _ = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            r = self.socket.send_to(buf, to) => match r {
                Ok(n) if n == buf.len() => {
                    trace!(?to, n, "sent datagram");
                    self.metrics.inc_counter(PACKETS_SENT, 1);
                    Ok(n)
                }
                Ok(n) => Err(TransportError::Io(std::io::Error::new(
                    ErrorKind::WriteZero,
                    format!("partial datagram write to {:?}: {} of {} bytes", to, n, buf.len()),
                ))),
                Err(e) => Err(e.into()),
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
