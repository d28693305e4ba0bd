//! Endpoint handler manager.
//!
//! An [`EndpointGroup`] owns the endpoint handlers of one listener (or
//! one outbound connection pool): it tracks them while they live,
//! absorbs their shutdown notifications, and exposes the group's shared
//! performance tracker.
//!
//! Shutdown notifications arrive on two racing paths: the manager's own
//! forced teardown and the handler's self-initiated teardown on an I/O
//! error. Both paths may fire for the same handler, so
//! [`EndpointHandlerManager::on_handler_shutdown`] must be idempotent -
//! the tracked set is decremented exactly once per handler no matter
//! how many notifications arrive.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::perf::EndpointGroupPerfTracker;

/// One endpoint handler: the owner of a single physical connection.
pub trait EndpointHandler: Send + Sync {
    /// Stable identifier within the owning group (0 is reserved).
    fn id(&self) -> u64;

    /// Remote address of the connection.
    fn peer_addr(&self) -> SocketAddr;

    /// Ask the handler to shut down. `force` drops in-flight dialogs
    /// immediately; otherwise they are drained first. Returns without
    /// waiting; the handler reports back through
    /// [`EndpointHandlerManager::on_handler_shutdown`].
    fn begin_shutdown(&self, force: bool);

    /// Whether the handler has terminated.
    fn is_shutdown(&self) -> bool;
}

/// Owner of a set of endpoint handlers.
pub trait EndpointHandlerManager: Send + Sync {
    /// Notification that a handler terminated, either because this
    /// manager initiated shutdown or because the handler hit an
    /// unrecoverable error on its own. Safe to deliver more than once
    /// per handler.
    fn on_handler_shutdown(&self, handler: &dyn EndpointHandler);

    /// Shared performance tracker for the group.
    fn perf_tracker(&self) -> Arc<EndpointGroupPerfTracker>;

    /// Shut down the manager and every owned handler. `detail` is a
    /// human-readable reason for logs only.
    fn shutdown(&self, detail: &str, force: bool);
}

/// Concrete endpoint-handler manager for one endpoint group.
pub struct EndpointGroup {
    /// Live handlers by id.
    handlers: DashMap<u64, Arc<dyn EndpointHandler>>,
    /// Shared metrics sink.
    perf: Arc<EndpointGroupPerfTracker>,
    /// Next handler id to allocate (0 reserved).
    next_handler_id: AtomicU64,
    /// Set once shutdown has been initiated.
    shutdown: AtomicBool,
}

impl EndpointGroup {
    /// Create an empty group.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
            perf: Arc::new(EndpointGroupPerfTracker::new()),
            next_handler_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Allocate a fresh handler id.
    pub fn allocate_handler_id(&self) -> u64 {
        self.next_handler_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start tracking a handler.
    pub fn register_handler(&self, handler: Arc<dyn EndpointHandler>) {
        self.perf.record_connection_accepted();
        self.handlers.insert(handler.id(), handler);
    }

    /// Number of currently tracked handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Whether shutdown has been initiated.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl EndpointHandlerManager for EndpointGroup {
    fn on_handler_shutdown(&self, handler: &dyn EndpointHandler) {
        // The atomic remove is the idempotence guard: only the first
        // notification for a given handler finds the entry.
        if self.handlers.remove(&handler.id()).is_some() {
            self.perf.record_handler_shutdown();
            tracing::debug!(
                handler_id = handler.id(),
                peer = %handler.peer_addr(),
                "endpoint handler shut down"
            );
        } else {
            tracing::trace!(
                handler_id = handler.id(),
                "duplicate handler shutdown notification ignored"
            );
        }
    }

    fn perf_tracker(&self) -> Arc<EndpointGroupPerfTracker> {
        self.perf.clone()
    }

    fn shutdown(&self, detail: &str, force: bool) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            tracing::trace!(detail, "endpoint group already shutting down");
            return;
        }

        tracing::info!(detail, force, "shutting down endpoint group");

        // Snapshot first: handlers call back into on_handler_shutdown
        // while we iterate.
        let handlers: Vec<_> = self.handlers.iter().map(|e| e.value().clone()).collect();
        for handler in handlers {
            handler.begin_shutdown(force);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubHandler {
        id: u64,
        shutdown_forced: AtomicBool,
        shutdown_requested: AtomicBool,
    }

    impl StubHandler {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                shutdown_forced: AtomicBool::new(false),
                shutdown_requested: AtomicBool::new(false),
            })
        }
    }

    impl EndpointHandler for StubHandler {
        fn id(&self) -> u64 {
            self.id
        }

        fn peer_addr(&self) -> SocketAddr {
            "127.0.0.1:4500".parse().unwrap()
        }

        fn begin_shutdown(&self, force: bool) {
            self.shutdown_requested.store(true, Ordering::SeqCst);
            if force {
                self.shutdown_forced.store(true, Ordering::SeqCst);
            }
        }

        fn is_shutdown(&self) -> bool {
            self.shutdown_requested.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_register_and_count() {
        let group = EndpointGroup::new();

        group.register_handler(StubHandler::new(group.allocate_handler_id()));
        group.register_handler(StubHandler::new(group.allocate_handler_id()));

        assert_eq!(group.handler_count(), 2);
        assert_eq!(group.perf_tracker().snapshot().connections_accepted, 2);
    }

    #[test]
    fn test_duplicate_shutdown_notification_decrements_once() {
        let group = EndpointGroup::new();
        let keep = StubHandler::new(group.allocate_handler_id());
        let victim = StubHandler::new(group.allocate_handler_id());
        group.register_handler(keep);
        group.register_handler(victim.clone());
        assert_eq!(group.handler_count(), 2);

        group.on_handler_shutdown(victim.as_ref());
        group.on_handler_shutdown(victim.as_ref());

        assert_eq!(group.handler_count(), 1);
        assert_eq!(group.perf_tracker().snapshot().handlers_shutdown, 1);
    }

    #[test]
    fn test_shutdown_reaches_every_handler() {
        let group = EndpointGroup::new();
        let a = StubHandler::new(group.allocate_handler_id());
        let b = StubHandler::new(group.allocate_handler_id());
        group.register_handler(a.clone());
        group.register_handler(b.clone());

        group.shutdown("test teardown", true);

        assert!(group.is_shutdown());
        assert!(a.shutdown_forced.load(Ordering::SeqCst));
        assert!(b.shutdown_forced.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let group = EndpointGroup::new();
        let handler = StubHandler::new(group.allocate_handler_id());
        group.register_handler(handler);

        group.shutdown("first", false);
        group.shutdown("second", true);

        assert!(group.is_shutdown());
    }

    #[test]
    fn test_handler_ids_are_unique_and_nonzero() {
        let group = EndpointGroup::new();

        let ids: Vec<u64> = (0..16).map(|_| group.allocate_handler_id()).collect();

        for (i, id) in ids.iter().enumerate() {
            assert_ne!(*id, 0);
            assert!(!ids[..i].contains(id));
        }
    }
}
