pub mod bindings;
pub mod connection_pool;
pub mod context;
pub mod dispatcher;
pub mod inbound;
pub mod peer_connection;
pub mod peer_status;
pub mod pending_replies;
pub mod sender;
pub mod socket_endpoint;
pub mod tcp;
