use std::net::{IpAddr, Ipv4Addr};

use crate::messaging::peer_address::{PeerAddress, PeerId, PeerSocketAddress};

/// convenience method for unit test code: create a [PeerAddress] based on a number, the same
///  number generating the same address and different numbers different addresses
pub fn test_peer_address_from_number(number: u16) -> PeerAddress {
    PeerAddress::new(PeerId::from(number as u64), vec![PeerSocketAddress {
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        udp_port: number,
        tcp_port: number,
    }])
}
