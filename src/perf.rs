//! Endpoint-group performance tracker.
//!
//! Read-mostly metrics sink shared by every handler in an endpoint
//! group. Handlers record samples through `&self`; aggregation and
//! export live outside this crate, which only guarantees the counters
//! are cheap and safe to bump from any thread.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters for one endpoint group.
#[derive(Debug, Default)]
pub struct EndpointGroupPerfTracker {
    /// Inbound connections accepted.
    connections_accepted: AtomicU64,
    /// Handlers that completed shutdown.
    handlers_shutdown: AtomicU64,
    /// Dialogs dispatched to a handler.
    dialogs_dispatched: AtomicU64,
    /// Dialogs rejected: type never registered.
    dialogs_rejected_unknown: AtomicU64,
    /// Dialogs rejected: type deregistered (shutdown race).
    dialogs_rejected_inactive: AtomicU64,
    /// Dialogs dropped at the concurrency limit.
    dialogs_rejected_capacity: AtomicU64,
    /// Raw bytes received across all endpoints.
    bytes_received: AtomicU64,
}

impl EndpointGroupPerfTracker {
    /// Create a tracker with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted inbound connection.
    #[inline]
    pub fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed handler shutdown.
    #[inline]
    pub fn record_handler_shutdown(&self) {
        self.handlers_shutdown.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dialog handed to its handler.
    #[inline]
    pub fn record_dialog_dispatched(&self) {
        self.dialogs_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dialog rejected because its type was never registered.
    #[inline]
    pub fn record_dialog_rejected_unknown(&self) {
        self.dialogs_rejected_unknown.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dialog rejected in a shutdown race.
    #[inline]
    pub fn record_dialog_rejected_inactive(&self) {
        self.dialogs_rejected_inactive.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dialog dropped at the concurrency limit.
    #[inline]
    pub fn record_dialog_rejected_capacity(&self) {
        self.dialogs_rejected_capacity.fetch_add(1, Ordering::Relaxed);
    }

    /// Record received bytes.
    #[inline]
    pub fn record_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Consistent-enough snapshot of all counters for logs/inspection.
    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            handlers_shutdown: self.handlers_shutdown.load(Ordering::Relaxed),
            dialogs_dispatched: self.dialogs_dispatched.load(Ordering::Relaxed),
            dialogs_rejected_unknown: self.dialogs_rejected_unknown.load(Ordering::Relaxed),
            dialogs_rejected_inactive: self.dialogs_rejected_inactive.load(Ordering::Relaxed),
            dialogs_rejected_capacity: self.dialogs_rejected_capacity.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the tracker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfSnapshot {
    /// Inbound connections accepted.
    pub connections_accepted: u64,
    /// Handlers that completed shutdown.
    pub handlers_shutdown: u64,
    /// Dialogs dispatched to a handler.
    pub dialogs_dispatched: u64,
    /// Dialogs rejected: type never registered.
    pub dialogs_rejected_unknown: u64,
    /// Dialogs rejected: type deregistered.
    pub dialogs_rejected_inactive: u64,
    /// Dialogs dropped at the concurrency limit.
    pub dialogs_rejected_capacity: u64,
    /// Raw bytes received.
    pub bytes_received: u64,
}
