//! Helpers for testing code built on the transport: in-memory datagram senders, canned request
//!  handlers and a peer status listener that records what it sees. They are part of the regular
//!  (non-#[cfg(test)]) code so applications can use them in their own tests.

pub mod datagram;
pub mod handler;
pub mod listener;
pub mod peer;
