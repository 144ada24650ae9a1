//! Lightweight Prometheus-compatible metrics for the relay.
//!
//! Uses atomic counters for lock-free instrumentation from every worker.
//! Renders metrics in Prometheus text exposition format for scraping on the
//! metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for the relay.
#[derive(Debug)]
pub struct Metrics {
    /// Live allocations across all workers (gauge)
    pub allocations_active: AtomicU64,
    /// Allocations granted (counter)
    pub allocations_total: AtomicU64,
    /// Allocate requests refused for quota or rate reasons (counter)
    pub allocation_rejections_total: AtomicU64,
    /// Allocations removed on expiry (counter)
    pub allocations_expired_total: AtomicU64,
    /// Datagrams forwarded in either direction (counter)
    pub datagrams_relayed_total: AtomicU64,
    /// Payload bytes forwarded in either direction (counter)
    pub relay_bytes_total: AtomicU64,
    /// Datagrams dropped because the peer had no permission (counter)
    pub dropped_no_permission_total: AtomicU64,
    /// Datagrams dropped because the allocation was unknown or expired (counter)
    pub dropped_no_allocation_total: AtomicU64,
    /// ChannelData dropped for an unbound channel (counter)
    pub dropped_unbound_channel_total: AtomicU64,
    /// Datagrams dropped on an exhausted byte quota (counter)
    pub dropped_quota_total: AtomicU64,
    /// Datagrams dropped because a worker queue was full (counter)
    pub dropped_worker_queue_total: AtomicU64,
    /// Undecodable datagrams (counter)
    pub malformed_total: AtomicU64,
    /// Binding requests answered (counter)
    pub binding_requests_total: AtomicU64,
    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            allocations_active: AtomicU64::new(0),
            allocations_total: AtomicU64::new(0),
            allocation_rejections_total: AtomicU64::new(0),
            allocations_expired_total: AtomicU64::new(0),
            datagrams_relayed_total: AtomicU64::new(0),
            relay_bytes_total: AtomicU64::new(0),
            dropped_no_permission_total: AtomicU64::new(0),
            dropped_no_allocation_total: AtomicU64::new(0),
            dropped_unbound_channel_total: AtomicU64::new(0),
            dropped_quota_total: AtomicU64::new(0),
            dropped_worker_queue_total: AtomicU64::new(0),
            malformed_total: AtomicU64::new(0),
            binding_requests_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self, bytes: usize) {
        self.datagrams_relayed_total.fetch_add(1, Ordering::Relaxed);
        self.relay_bytes_total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP relay_allocations_active Current number of live allocations\n\
             # TYPE relay_allocations_active gauge\n\
             relay_allocations_active {}\n\
             # HELP relay_allocations_total Total allocations granted\n\
             # TYPE relay_allocations_total counter\n\
             relay_allocations_total {}\n\
             # HELP relay_allocation_rejections_total Total allocate requests refused (quota or throttle)\n\
             # TYPE relay_allocation_rejections_total counter\n\
             relay_allocation_rejections_total {}\n\
             # HELP relay_allocations_expired_total Total allocations removed on expiry\n\
             # TYPE relay_allocations_expired_total counter\n\
             relay_allocations_expired_total {}\n\
             # HELP relay_datagrams_relayed_total Total datagrams relayed\n\
             # TYPE relay_datagrams_relayed_total counter\n\
             relay_datagrams_relayed_total {}\n\
             # HELP relay_bytes_total Total payload bytes relayed\n\
             # TYPE relay_bytes_total counter\n\
             relay_bytes_total {}\n\
             # HELP relay_dropped_no_permission_total Datagrams dropped without a peer permission\n\
             # TYPE relay_dropped_no_permission_total counter\n\
             relay_dropped_no_permission_total {}\n\
             # HELP relay_dropped_no_allocation_total Datagrams dropped for an unknown or expired allocation\n\
             # TYPE relay_dropped_no_allocation_total counter\n\
             relay_dropped_no_allocation_total {}\n\
             # HELP relay_dropped_unbound_channel_total ChannelData dropped for an unbound channel\n\
             # TYPE relay_dropped_unbound_channel_total counter\n\
             relay_dropped_unbound_channel_total {}\n\
             # HELP relay_dropped_quota_total Datagrams dropped on an exhausted byte quota\n\
             # TYPE relay_dropped_quota_total counter\n\
             relay_dropped_quota_total {}\n\
             # HELP relay_dropped_worker_queue_total Datagrams dropped on a full worker queue\n\
             # TYPE relay_dropped_worker_queue_total counter\n\
             relay_dropped_worker_queue_total {}\n\
             # HELP relay_malformed_total Undecodable datagrams\n\
             # TYPE relay_malformed_total counter\n\
             relay_malformed_total {}\n\
             # HELP relay_binding_requests_total Binding requests answered\n\
             # TYPE relay_binding_requests_total counter\n\
             relay_binding_requests_total {}\n\
             # HELP relay_uptime_seconds Server uptime in seconds\n\
             # TYPE relay_uptime_seconds gauge\n\
             relay_uptime_seconds {}\n",
            self.allocations_active.load(Ordering::Relaxed),
            self.allocations_total.load(Ordering::Relaxed),
            self.allocation_rejections_total.load(Ordering::Relaxed),
            self.allocations_expired_total.load(Ordering::Relaxed),
            self.datagrams_relayed_total.load(Ordering::Relaxed),
            self.relay_bytes_total.load(Ordering::Relaxed),
            self.dropped_no_permission_total.load(Ordering::Relaxed),
            self.dropped_no_allocation_total.load(Ordering::Relaxed),
            self.dropped_unbound_channel_total.load(Ordering::Relaxed),
            self.dropped_quota_total.load(Ordering::Relaxed),
            self.dropped_worker_queue_total.load(Ordering::Relaxed),
            self.malformed_total.load(Ordering::Relaxed),
            self.binding_requests_total.load(Ordering::Relaxed),
            uptime,
        )
    }

    /// HTTP/1.1 response carrying the rendered metrics
    pub fn http_response(&self) -> Vec<u8> {
        let body = self.render();
        format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }
}
