use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::bail;

/// Upper bound for a single encoded control message, UDP or TCP.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Messages carrying a different version tag are rejected, and the sending peer is reported
    ///  as faulty. Peers of different overlays can share ports without seeing each other's
    ///  traffic that way.
    pub p2p_version: u32,

    /// The resolved list of local addresses to bind. Discovering interfaces is the caller's
    ///  business; the transport binds exactly what it is given.
    pub bind_addresses: Vec<IpAddr>,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub enable_tcp: bool,

    /// Try a broadcast-enabled wildcard socket first for IPv4 addresses, and fall back to a plain
    ///  socket on the specific address if that fails.
    pub try_broadcast_bind: bool,

    /// Size of the datagram receive buffer. Larger datagrams are truncated by the platform and
    ///  dropped by the receive loop.
    pub receive_buffer_size: usize,

    /// The receive loop never waits longer than this for a datagram. Every time it wakes up
    ///  without one, it sweeps expired pending replies and idle tunnel sessions.
    pub receive_poll_interval: Duration,

    pub idle_timeout_udp: Duration,
    pub idle_timeout_tcp: Duration,
    pub connect_timeout_tcp: Duration,

    /// Reply timeout for recipients flagged as `slow`: they may answer much later than regular
    ///  peers, e.g. because they are only woken up by a relay
    pub slow_response_timeout: Duration,

    pub max_permits_udp: usize,
    pub max_permits_tcp: usize,

    pub heartbeat_interval: Duration,

    pub tunnel_idle_timeout: Duration,
    pub tunnel_handshake_timeout: Duration,
    pub tunnel_connect_retry: Duration,

    /// Upper bound for each waiting step of a shutdown: open channels, background tasks
    pub shutdown_timeout: Duration,

    /// Inbound requests being handled concurrently per UDP socket. Datagrams carrying further
    ///  requests are dropped until a handler finishes.
    pub max_concurrent_requests: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            p2p_version: 1,
            bind_addresses: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            udp_port: 0,
            tcp_port: 0,
            enable_tcp: true,
            try_broadcast_bind: true,
            receive_buffer_size: 64 * 1024,
            receive_poll_interval: Duration::from_millis(100),
            idle_timeout_udp: Duration::from_secs(5),
            idle_timeout_tcp: Duration::from_secs(5),
            connect_timeout_tcp: Duration::from_secs(3),
            slow_response_timeout: Duration::from_secs(60),
            max_permits_udp: 250,
            max_permits_tcp: 250,
            heartbeat_interval: Duration::from_secs(2),
            tunnel_idle_timeout: Duration::from_secs(30),
            tunnel_handshake_timeout: Duration::from_secs(3),
            tunnel_connect_retry: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(5),
            max_concurrent_requests: 1024,
        }
    }
}

impl TransportConfig {
    /// loopback only, ephemeral ports
    pub fn localhost() -> TransportConfig {
        TransportConfig {
            bind_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            try_broadcast_bind: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addresses.is_empty() {
            bail!("at least one bind address is required");
        }
        if self.max_permits_udp == 0 || self.max_permits_tcp == 0 {
            bail!("permit pools must allow at least one channel");
        }
        if self.max_concurrent_requests == 0 {
            bail!("at least one inbound request must be allowed at a time");
        }
        if self.receive_buffer_size < 1024 || self.receive_buffer_size > 64 * 1024 {
            bail!("receive buffer size must be between 1 KiB and 64 KiB, was {}", self.receive_buffer_size);
        }
        for (name, d) in [
            ("receive_poll_interval", self.receive_poll_interval),
            ("idle_timeout_udp", self.idle_timeout_udp),
            ("idle_timeout_tcp", self.idle_timeout_tcp),
            ("connect_timeout_tcp", self.connect_timeout_tcp),
            ("slow_response_timeout", self.slow_response_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("tunnel_idle_timeout", self.tunnel_idle_timeout),
            ("tunnel_handshake_timeout", self.tunnel_handshake_timeout),
            ("tunnel_connect_retry", self.tunnel_connect_retry),
            ("shutdown_timeout", self.shutdown_timeout),
        ] {
            if d.is_zero() {
                bail!("{} must not be zero", name);
            }
        }
        Ok(())
    }
}
