//! A peer-to-peer transport core: identity-addressed request/reply messaging over UDP and TCP,
//!  bounded channel pools, a request dispatcher with handler registration, and reliable tunnels
//!  multiplexed over the UDP sockets.
//!
//! [peer_transport::PeerTransport] wires the parts together. It binds the configured sockets,
//!  runs the receive and accept loops, and hands out the [connection::sender::Sender] for
//!  outbound traffic and the [connection::dispatcher::Dispatcher] for inbound requests.

pub mod config;
pub mod connection;
pub mod error;
pub mod messaging;
pub mod metrics;
pub mod peer_transport;
pub mod test_util;
pub mod tunnel;
pub mod util;
