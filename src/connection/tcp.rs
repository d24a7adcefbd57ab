//! TCP carries the same encoded control messages as UDP, each prefixed with its length as a
//!  big-endian `u32`.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::MAX_MESSAGE_SIZE;
use crate::connection::context::TransportContext;
use crate::error::TransportError;
use crate::messaging::codec::Decoded;
use crate::messaging::message::Message;
use crate::metrics::{PACKETS_DROPPED, PACKETS_RECEIVED, PACKETS_SENT};

pub async fn connect(remote: SocketAddr, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    match timeout(connect_timeout, TcpStream::connect(remote)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            trace!(?remote, "connected");
            Ok(stream)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::Timeout { remote: Some(remote), timeout: connect_timeout }),
    }
}

pub async fn write_frame(stream: &mut (impl AsyncWrite + Unpin), frame: &[u8]) -> Result<(), TransportError> {
    if frame.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::ProtocolError(format!("frame of {} bytes exceeds the maximum of {}", frame.len(), MAX_MESSAGE_SIZE)));
    }
    stream.write_u32(frame.len() as u32).await?;
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

/// `None` if the stream ended cleanly between frames
pub async fn read_frame(stream: &mut (impl AsyncRead + Unpin)) -> Result<Option<Bytes>, TransportError> {
    let len = match stream.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::ProtocolError(format!("announced frame of {} bytes exceeds the maximum of {}", len, MAX_MESSAGE_SIZE)));
    }

    let mut buf = BytesMut::zeroed(len);
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}

pub fn decode_frame(ctx: &TransportContext, frame: &[u8], local: SocketAddr, remote: SocketAddr) -> Result<Message, TransportError> {
    match ctx.codec.decode(frame, local, remote) {
        Ok(Decoded::Complete(message)) => Ok(message),
        Ok(Decoded::Incomplete) => Err(TransportError::ProtocolError("incomplete message in TCP frame".to_string())),
        Err(e) => Err(TransportError::Codec(e)),
    }
}

/// Accepts connections until `closed` is cancelled, serving each on a task of its own.
pub async fn run_accept_loop(listener: TcpListener, ctx: Arc<TransportContext>, closed: CancellationToken) {
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("TCP listener has no local address - not accepting connections: {}", e);
            return;
        }
    };
    debug!("starting TCP accept loop on {:?}", local_addr);

    loop {
        select! {
            _ = closed.cancelled() => break,
            r = listener.accept() => match r {
                Ok((stream, remote)) => {
                    let span = span!(Level::TRACE, "tcp_connection", correlation_id = %Uuid::new_v4(), ?remote);
                    tokio::spawn(serve_connection(stream, local_addr, remote, ctx.clone(), closed.clone()).instrument(span));
                }
                Err(e) => warn!("error accepting TCP connection on {:?}: {}", local_addr, e),
            }
        }
    }

    info!("shutting down TCP accept loop on {:?}", local_addr);
}

/// Requests on one connection are handled one after the other. A connection without a frame for
///  the TCP idle timeout is closed; keep-alive peers prevent that with their heartbeats.
async fn serve_connection(mut stream: TcpStream, local: SocketAddr, remote: SocketAddr, ctx: Arc<TransportContext>, closed: CancellationToken) {
    stream.set_nodelay(true).ok();
    let idle_timeout = ctx.config.idle_timeout_tcp;

    loop {
        let frame = select! {
            _ = closed.cancelled() => break,
            r = timeout(idle_timeout, read_frame(&mut stream)) => match r {
                Err(_) => {
                    debug!(?remote, "closing idle TCP connection");
                    break;
                }
                Ok(Ok(None)) => {
                    trace!(?remote, "TCP connection closed by peer");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(?remote, "closing TCP connection after read error: {}", e);
                    ctx.metrics.inc_counter(PACKETS_DROPPED, 1);
                    break;
                }
                Ok(Ok(Some(frame))) => frame,
            }
        };
        ctx.metrics.inc_counter(PACKETS_RECEIVED, 1);

        let message = match decode_frame(&ctx, &frame, local, remote) {
            Ok(message) => message,
            Err(e) => {
                warn!(?remote, "closing TCP connection after undecodable frame: {}", e);
                ctx.metrics.inc_counter(PACKETS_DROPPED, 1);
                break;
            }
        };

        if !message.message_type.is_request() && !message.message_type.is_ack() {
            debug!(?remote, ?message, "unsolicited reply on an inbound TCP connection - ignoring");
            continue;
        }

        let Some(reply) = ctx.dispatcher.dispatch(message).await else {
            continue;
        };

        let result = match ctx.encode(&reply) {
            Ok(bytes) => write_frame(&mut stream, &bytes).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => ctx.metrics.inc_counter(PACKETS_SENT, 1),
            Err(e) => {
                warn!(?remote, "closing TCP connection, sending reply failed: {}", e);
                break;
            }
        }
    }
}
