//! Per-bridge transfer statistics
//!
//! Lock-free counters updated from both the send path and the completion
//! dispatcher. The allocation/free pairs let teardown prove nothing leaked.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transfer counters for a single bridge
#[derive(Debug, Default)]
pub struct BridgeStats {
    /// Sends accepted by the bus
    sends: AtomicU64,
    /// Send completions reported through `data_sent`
    completions: AtomicU64,
    /// Send completions with a non-success status
    send_failures: AtomicU64,
    /// Outbound requests allocated beyond the fixed pool
    overflow_allocs: AtomicU64,
    /// CPort frames delivered upward
    frames_received: AtomicU64,
    /// Inbound frames dropped (empty or malformed)
    frames_dropped: AtomicU64,
    /// SVC messages delivered upward
    svc_messages: AtomicU64,
    /// Receive completions absorbed as transient faults
    transient_faults: AtomicU64,
    requests_allocated: AtomicU64,
    requests_freed: AtomicU64,
    buffers_allocated: AtomicU64,
    buffers_freed: AtomicU64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_submitted(&self) {
        self.sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reported send completion
    pub fn send_completed(&self, success: bool) {
        self.completions.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn overflow_allocated(&self) {
        self.overflow_allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn svc_received(&self) {
        self.svc_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transient_fault(&self) {
        self.transient_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_allocated(&self) {
        self.requests_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_freed(&self) {
        self.requests_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the fixed outbound pool being created
    pub fn pool_created(&self, slots: u64) {
        self.requests_allocated.fetch_add(slots, Ordering::Relaxed);
    }

    /// Record the fixed outbound pool being retired
    pub fn pool_retired(&self, slots: u64) {
        self.requests_freed.fetch_add(slots, Ordering::Relaxed);
    }

    pub fn buffer_allocated(&self) {
        self.buffers_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_freed(&self) {
        self.buffers_freed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sends: self.sends.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            overflow_allocs: self.overflow_allocs.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            svc_messages: self.svc_messages.load(Ordering::Relaxed),
            transient_faults: self.transient_faults.load(Ordering::Relaxed),
            requests_allocated: self.requests_allocated.load(Ordering::Relaxed),
            requests_freed: self.requests_freed.load(Ordering::Relaxed),
            buffers_allocated: self.buffers_allocated.load(Ordering::Relaxed),
            buffers_freed: self.buffers_freed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BridgeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sends: u64,
    pub completions: u64,
    pub send_failures: u64,
    pub overflow_allocs: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub svc_messages: u64,
    pub transient_faults: u64,
    pub requests_allocated: u64,
    pub requests_freed: u64,
    pub buffers_allocated: u64,
    pub buffers_freed: u64,
}

impl StatsSnapshot {
    /// Requests allocated but never freed
    pub fn leaked_requests(&self) -> u64 {
        self.requests_allocated.saturating_sub(self.requests_freed)
    }

    /// Receive buffers allocated but never freed
    pub fn leaked_buffers(&self) -> u64 {
        self.buffers_allocated.saturating_sub(self.buffers_freed)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sends={} completions={} failures={} overflow={} rx={} dropped={} svc={} transient={}",
            self.sends,
            self.completions,
            self.send_failures,
            self.overflow_allocs,
            self.frames_received,
            self.frames_dropped,
            self.svc_messages,
            self.transient_faults,
        )
    }
}
