pub mod codec;
pub mod message;
pub mod peer_address;
pub mod signature;
