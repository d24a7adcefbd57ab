use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::socket_endpoint::DatagramSender;
use crate::error::TransportError;

#[derive(Debug)]
pub struct SentDatagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub buf: Vec<u8>,
}

/// Hands sent datagrams to the test through a channel instead of a socket
pub struct ChannelDatagramSender {
    local: SocketAddr,
    outbound: mpsc::UnboundedSender<SentDatagram>,
}

impl ChannelDatagramSender {
    pub fn new(local: SocketAddr) -> (Arc<ChannelDatagramSender>, mpsc::UnboundedReceiver<SentDatagram>) {
        let (outbound, outbound_recv) = mpsc::unbounded_channel();
        (Arc::new(ChannelDatagramSender { local, outbound }), outbound_recv)
    }
}

#[async_trait]
impl DatagramSender for ChannelDatagramSender {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> Result<usize, TransportError> {
        self.outbound.send(SentDatagram { from: self.local, to, buf: buf.to_vec() })
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}
