//! Path liveness for established connections
//!
//! Tracks traffic on a peer's selected path and decides when to send a
//! keepalive, when the path is dead, and when the connection is idle.
//!
//! # Keepalive
//!
//! Keepalives are empty authenticated data packets. One goes out after
//! `keepalive_interval` without sending anything, which keeps NAT
//! mappings open and gives the peer something to hear.
//!
//! # Timers
//!
//! ```text
//! last_sent ──────── + keepalive_interval ──► send keepalive
//! last_received ──── + liveness_timeout ───► path dead (renegotiate)
//! last_activity ──── + idle_timeout ───────► tear down
//! ```
//!
//! Keepalives count toward liveness but not toward activity, so a
//! connection carrying nothing but keepalives eventually goes idle.

use std::time::{Duration, Instant};

/// Send a keepalive after this much send silence
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Path considered dead after this much receive silence
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(45);

/// Connection torn down after this long without user traffic
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct PathMonitor {
    keepalive_interval: Duration,
    liveness_timeout: Duration,
    idle_timeout: Duration,
    last_sent: Instant,
    last_received: Instant,
    /// Last non-keepalive packet in either direction
    last_activity: Instant,
    keepalives_sent: u64,
}

impl PathMonitor {
    pub fn new(now: Instant) -> Self {
        Self::with_timeouts(now, KEEPALIVE_INTERVAL, LIVENESS_TIMEOUT, IDLE_TIMEOUT)
    }

    pub fn with_timeouts(
        now: Instant,
        keepalive_interval: Duration,
        liveness_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            keepalive_interval,
            liveness_timeout,
            idle_timeout,
            last_sent: now,
            last_received: now,
            last_activity: now,
            keepalives_sent: 0,
        }
    }

    pub fn record_sent(&mut self, now: Instant, is_keepalive: bool) {
        self.last_sent = now;
        if is_keepalive {
            self.keepalives_sent += 1;
        } else {
            self.last_activity = now;
        }
    }

    pub fn record_received(&mut self, now: Instant, is_keepalive: bool) {
        self.last_received = now;
        if !is_keepalive {
            self.last_activity = now;
        }
    }

    /// A new path was adopted: restart the liveness clock
    pub fn reset_liveness(&mut self, now: Instant) {
        self.last_sent = now;
        self.last_received = now;
    }

    pub fn needs_keepalive(&self, now: Instant) -> bool {
        now >= self.last_sent + self.keepalive_interval
    }

    pub fn is_path_dead(&self, now: Instant) -> bool {
        now >= self.last_received + self.liveness_timeout
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now >= self.last_activity + self.idle_timeout
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn keepalives_sent(&self) -> u64 {
        self.keepalives_sent
    }

    /// Earliest instant one of the checks above can change its answer
    pub fn next_deadline(&self) -> Instant {
        (self.last_sent + self.keepalive_interval)
            .min(self.last_received + self.liveness_timeout)
            .min(self.last_activity + self.idle_timeout)
    }
}

// ============================================================================
// Tests
// ============================================================================
