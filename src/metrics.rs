//! Counters and gauges are reported through an injected [MetricsSink] rather than global state,
//!  so that several transports in one process (e.g. in tests) keep separate numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use rustc_hash::FxHashMap;

pub const PACKETS_SENT: &str = "packets_sent";
pub const PACKETS_RECEIVED: &str = "packets_received";
pub const PACKETS_DROPPED: &str = "packets_dropped";
pub const REPLIES_UNMATCHED: &str = "replies_unmatched";
pub const REQUESTS_TIMED_OUT: &str = "requests_timed_out";

pub const UDP_PERMITS_AVAILABLE: &str = "udp_permits_available";
pub const TCP_PERMITS_AVAILABLE: &str = "tcp_permits_available";
pub const PENDING_REPLIES: &str = "pending_replies";

pub trait MetricsSink: Send + Sync + 'static {
    fn inc_counter(&self, name: &'static str, by: u64);
    fn set_gauge(&self, name: &'static str, value: u64);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_counter(&self, _name: &'static str, _by: u64) {}
    fn set_gauge(&self, _name: &'static str, _value: u64) {}
}

/// Keeps every counter and gauge in memory. Values are read with [CountingMetrics::get].
#[derive(Default)]
pub struct CountingMetrics {
    values: RwLock<FxHashMap<&'static str, AtomicU64>>,
}

impl CountingMetrics {
    pub fn get(&self, name: &str) -> u64 {
        match self.values.read() {
            Ok(values) => values.get(name)
                .map(|v| v.load(Ordering::Relaxed))
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn update(&self, name: &'static str, f: impl Fn(&AtomicU64)) {
        if let Ok(values) = self.values.read() {
            if let Some(v) = values.get(name) {
                f(v);
                return;
            }
        }
        if let Ok(mut values) = self.values.write() {
            f(values.entry(name).or_default());
        }
    }
}

impl MetricsSink for CountingMetrics {
    fn inc_counter(&self, name: &'static str, by: u64) {
        self.update(name, |v| { v.fetch_add(by, Ordering::Relaxed); });
    }

    fn set_gauge(&self, name: &'static str, value: u64) {
        self.update(name, |v| v.store(value, Ordering::Relaxed));
    }
}
