use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::connection::socket_endpoint::SocketEndpoint;
use crate::error::TransportError;
use crate::messaging::peer_address::PeerSocketAddress;
use crate::metrics::MetricsSink;

/// Sockets bound for one configured address
pub struct BoundEndpoint {
    pub udp: Arc<SocketEndpoint>,
    pub tcp: Option<TcpListener>,
    /// what peers are told to use to reach these sockets
    pub advertised: PeerSocketAddress,
}

/// The bind attempts for one configured address, in order: a broadcast-enabled wildcard socket
///  (IPv4 only, if configured), the specific address, a plain wildcard socket.
fn bind_attempts(ip: IpAddr, port: u16, try_broadcast: bool) -> Vec<(SocketAddr, bool)> {
    let wildcard = match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    let mut result = Vec::new();
    if try_broadcast && ip.is_ipv4() {
        result.push((SocketAddr::new(wildcard, port), true));
    }
    if !ip.is_unspecified() {
        result.push((SocketAddr::new(ip, port), false));
    }
    result.push((SocketAddr::new(wildcard, port), false));
    result
}

/// Binds every configured address. A failure for one address is logged and does not prevent the
///  others from being bound; the call only fails if nothing could be bound at all.
///
/// Must be called from inside a Tokio runtime.
pub fn bind_all(config: &TransportConfig, metrics: Arc<dyn MetricsSink>) -> Result<Vec<BoundEndpoint>, TransportError> {
    let mut result = Vec::new();
    let mut last_error = None;
    let mut wildcard_v4_bound = false;
    let mut wildcard_v6_bound = false;

    for &ip in &config.bind_addresses {
        if (ip.is_ipv4() && wildcard_v4_bound) || (ip.is_ipv6() && wildcard_v6_bound) {
            debug!("{} is covered by a wildcard socket that is already bound", ip);
            continue;
        }

        let mut bound = None;
        for (addr, broadcast) in bind_attempts(ip, config.udp_port, config.try_broadcast_bind) {
            match SocketEndpoint::bind(addr, broadcast, config, metrics.clone()) {
                Ok(endpoint) => {
                    bound = Some(endpoint);
                    break;
                }
                Err(e) => {
                    warn!("binding {:?} failed, trying the next option: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        let Some(udp) = bound else {
            continue;
        };

        let udp_addr = udp.local_addr();
        if udp_addr.ip().is_unspecified() {
            if udp_addr.is_ipv4() { wildcard_v4_bound = true; } else { wildcard_v6_bound = true; }
        }

        let tcp = if config.enable_tcp {
            match bind_tcp(udp_addr.ip(), config.tcp_port, udp_addr.port()) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    warn!("binding TCP for {} failed, continuing with UDP only: {}", udp_addr.ip(), e);
                    None
                }
            }
        }
        else {
            None
        };

        let advertised = PeerSocketAddress {
            ip: advertised_ip(ip, udp_addr.ip()),
            udp_port: udp_addr.port(),
            tcp_port: tcp.as_ref()
                .and_then(|l| l.local_addr().ok())
                .map(|a| a.port())
                .unwrap_or(0),
        };
        info!(?advertised, "bound endpoint");

        result.push(BoundEndpoint {
            udp: Arc::new(udp),
            tcp,
            advertised,
        });
    }

    if result.is_empty() {
        return Err(last_error.unwrap_or(TransportError::BindFailure {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.udp_port),
            source: std::io::Error::other("no address could be bound"),
        }));
    }
    Ok(result)
}

/// With an ephemeral TCP port, the UDP port is tried first so that both share a port number.
fn bind_tcp(ip: IpAddr, tcp_port: u16, udp_port: u16) -> Result<TcpListener, TransportError> {
    let mut ports = vec![tcp_port];
    if tcp_port == 0 {
        ports.insert(0, udp_port);
    }

    let mut last_error = None;
    for port in ports {
        let addr = SocketAddr::new(ip, port);
        match std::net::TcpListener::bind(addr)
            .and_then(|l| l.set_nonblocking(true).map(|_| l))
            .and_then(TcpListener::from_std)
        {
            Ok(listener) => return Ok(listener),
            Err(source) => last_error = Some(TransportError::BindFailure { addr, source }),
        }
    }
    Err(last_error.unwrap_or(TransportError::ConnectionClosed))
}

/// Wildcard sockets cannot tell peers where to go. For those, the configured address is
///  advertised if it is a specific one, loopback otherwise.
fn advertised_ip(configured: IpAddr, bound: IpAddr) -> IpAddr {
    if !bound.is_unspecified() {
        return bound;
    }
    if !configured.is_unspecified() {
        return configured;
    }
    match configured {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use rstest::rstest;
    use tokio::runtime::Builder;

    use crate::metrics::NoopMetrics;

    use super::*;

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    #[rstest]
    #[case::v4_broadcast("10.0.0.1", true, vec![(addr("0.0.0.0:7000"), true), (addr("10.0.0.1:7000"), false), (addr("0.0.0.0:7000"), false)])]
    #[case::v4_plain("10.0.0.1", false, vec![(addr("10.0.0.1:7000"), false), (addr("0.0.0.0:7000"), false)])]
    #[case::v4_wildcard("0.0.0.0", false, vec![(addr("0.0.0.0:7000"), false)])]
    #[case::v6_ignores_broadcast("::1", true, vec![(addr("[::1]:7000"), false), (addr("[::]:7000"), false)])]
    fn test_bind_attempts(#[case] ip: &str, #[case] try_broadcast: bool, #[case] expected: Vec<(SocketAddr, bool)>) {
        assert_eq!(bind_attempts(IpAddr::from_str(ip).unwrap(), 7000, try_broadcast), expected);
    }

    #[rstest]
    #[case::specific("10.0.0.1", "10.0.0.1", "10.0.0.1")]
    #[case::wildcard_with_specific_config("10.0.0.1", "0.0.0.0", "10.0.0.1")]
    #[case::wildcard("0.0.0.0", "0.0.0.0", "127.0.0.1")]
    fn test_advertised_ip(#[case] configured: &str, #[case] bound: &str, #[case] expected: &str) {
        assert_eq!(advertised_ip(IpAddr::from_str(configured).unwrap(), IpAddr::from_str(bound).unwrap()), IpAddr::from_str(expected).unwrap());
    }

    #[test]
    fn test_bind_localhost() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let bound = bind_all(&TransportConfig::localhost(), Arc::new(NoopMetrics)).unwrap();
            assert_eq!(bound.len(), 1);
            assert_eq!(bound[0].advertised.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
            assert_ne!(bound[0].advertised.udp_port, 0);
            assert!(bound[0].tcp.is_some());
            assert_ne!(bound[0].advertised.tcp_port, 0);
        });
    }

    #[test]
    fn test_bind_without_tcp() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let config = TransportConfig { enable_tcp: false, ..TransportConfig::localhost() };
            let bound = bind_all(&config, Arc::new(NoopMetrics)).unwrap();
            assert!(bound[0].tcp.is_none());
            assert_eq!(bound[0].advertised.tcp_port, 0);
        });
    }

    #[test]
    fn test_bind_fails_if_port_taken_everywhere() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let first = bind_all(&TransportConfig::localhost(), Arc::new(NoopMetrics)).unwrap();
            let port = first[0].advertised.udp_port;

            let config = TransportConfig { udp_port: port, ..TransportConfig::localhost() };
            // the plain wildcard attempt may still succeed on some platforms, so only check that
            //  the specific address is not bound twice
            match bind_all(&config, Arc::new(NoopMetrics)) {
                Ok(bound) => assert!(bound[0].udp.local_addr().ip().is_unspecified()),
                Err(e) => assert!(matches!(e, TransportError::BindFailure { .. })),
            }
        });
    }
}
