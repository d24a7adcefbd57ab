//! Stream-like channels multiplexed into the UDP flow that carries control messages, e.g. for
//!  bulk transfer through a NAT hole that was punched for control traffic.

pub mod broker;
pub mod frame;
pub mod session;
