use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::VarIntSupportMut;
use sha2::{Digest, Sha256};

use crate::util::buf_ext::BufExt;

/// A peer's identity in the overlay: 160 bits, independent of the network address the peer is
///  currently reachable at.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct PeerId(pub [u8; PeerId::LEN]);

impl PeerId {
    pub const LEN: usize = 20;

    /// Addressing a request to this id means "whoever listens on the recipient's socket". It is
    ///  used to ping peers whose identity is not known yet.
    pub const ZERO: PeerId = PeerId([0; PeerId::LEN]);

    pub fn random() -> PeerId {
        PeerId(rand::random())
    }

    pub fn from_public_key(encoded_key: &[u8]) -> PeerId {
        let digest = Sha256::digest(encoded_key);
        let mut id = [0u8; PeerId::LEN];
        id.copy_from_slice(&digest[..PeerId::LEN]);
        PeerId(id)
    }

    pub fn is_zero(&self) -> bool {
        *self == PeerId::ZERO
    }
}

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        let mut id = [0u8; PeerId::LEN];
        id[PeerId::LEN - 8..].copy_from_slice(&value.to_be_bytes());
        PeerId(id)
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// One IP address a peer listens on, with its UDP and TCP ports
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerSocketAddress {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Debug for PeerSocketAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.udp_port, self.tcp_port)
    }
}

impl PeerSocketAddress {
    pub fn udp(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn tcp(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self.ip {
            IpAddr::V4(ip) => {
                buf.put_u8(4);
                buf.put_u32(ip.to_bits());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(6);
                buf.put_u128(ip.to_bits());
            }
        }
        buf.put_u16(self.udp_port);
        buf.put_u16(self.tcp_port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerSocketAddress> {
        let ip = match buf.try_get_u8()? {
            4 => IpAddr::V4(Ipv4Addr::from_bits(buf.try_get_u32()?)),
            6 => IpAddr::V6(Ipv6Addr::from_bits(buf.try_get_u128()?)),
            n => return Err(anyhow!("invalid socket address discriminator: {}", n)),
        };
        let udp_port = buf.try_get_u16()?;
        let tcp_port = buf.try_get_u16()?;
        Ok(PeerSocketAddress { ip, udp_port, tcp_port })
    }
}

/// Identity, reachable sockets and capability flags of a peer. This is an immutable value that
///  peers exchange and cache, so it is cloned freely.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct PeerAddress {
    pub peer_id: PeerId,
    pub sockets: Vec<PeerSocketAddress>,
    /// the peer is only reachable through a relay
    pub relayed: bool,
    /// the peer may take a long time to answer, e.g. a mobile device woken up by its relay
    pub slow: bool,
    pub firewalled_udp: bool,
    pub firewalled_tcp: bool,
}

impl Debug for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}@{:?}", self.peer_id, self.sockets)?;
        if self.relayed {
            write!(f, " relayed")?;
        }
        if self.slow {
            write!(f, " slow")?;
        }
        write!(f, "]")
    }
}

const FLAG_RELAYED: u8 = 1;
const FLAG_SLOW: u8 = 2;
const FLAG_FIREWALLED_UDP: u8 = 4;
const FLAG_FIREWALLED_TCP: u8 = 8;

/// a peer address with more sockets than this is malformed
const MAX_SOCKETS: usize = 16;

impl PeerAddress {
    pub fn new(peer_id: PeerId, sockets: Vec<PeerSocketAddress>) -> PeerAddress {
        PeerAddress {
            peer_id,
            sockets,
            relayed: false,
            slow: false,
            firewalled_udp: false,
            firewalled_tcp: false,
        }
    }

    pub fn from_socket_addr(peer_id: PeerId, addr: SocketAddr) -> PeerAddress {
        PeerAddress::new(peer_id, vec![PeerSocketAddress {
            ip: addr.ip(),
            udp_port: addr.port(),
            tcp_port: addr.port(),
        }])
    }

    pub fn primary_udp(&self) -> Option<SocketAddr> {
        self.sockets.first().map(|s| s.udp())
    }

    pub fn primary_tcp(&self) -> Option<SocketAddr> {
        self.sockets.first().map(|s| s.tcp())
    }

    pub fn with_relayed(mut self, relayed: bool) -> PeerAddress {
        self.relayed = relayed;
        self
    }

    pub fn with_slow(mut self, slow: bool) -> PeerAddress {
        self.slow = slow;
        self
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.peer_id.0);

        let mut flags = 0;
        if self.relayed { flags |= FLAG_RELAYED; }
        if self.slow { flags |= FLAG_SLOW; }
        if self.firewalled_udp { flags |= FLAG_FIREWALLED_UDP; }
        if self.firewalled_tcp { flags |= FLAG_FIREWALLED_TCP; }
        buf.put_u8(flags);

        buf.put_usize_varint(self.sockets.len());
        for s in &self.sockets {
            s.ser(buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerAddress> {
        let peer_id = PeerId(buf.try_get_array()?);
        let flags = buf.try_get_u8()?;

        let num_sockets = buf.try_get_len_varint()?;
        if num_sockets > MAX_SOCKETS {
            return Err(anyhow!("peer address with {} sockets exceeds the maximum of {}", num_sockets, MAX_SOCKETS));
        }
        let mut sockets = Vec::with_capacity(num_sockets);
        for _ in 0..num_sockets {
            sockets.push(PeerSocketAddress::try_deser(buf)?);
        }

        Ok(PeerAddress {
            peer_id,
            sockets,
            relayed: flags & FLAG_RELAYED != 0,
            slow: flags & FLAG_SLOW != 0,
            firewalled_udp: flags & FLAG_FIREWALLED_UDP != 0,
            firewalled_tcp: flags & FLAG_FIREWALLED_TCP != 0,
        })
    }
}
