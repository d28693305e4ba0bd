//! Endpoint listener: accepts inbound connections and binds them to
//! the dialog dispatch path.
//!
//! Lifecycle: `Unbound -> Listening -> ShuttingDown -> Shutdown`. The
//! listener owns the listening socket, spawns one
//! [`DialogEndpointHandler`] per accepted connection, registers it with
//! the endpoint group, and tracks the resulting
//! [`ResponderEndpoint`]s. Only dialog-capable connections are tracked
//! for connection management; others are served but excluded from that
//! accounting.
//!
//! # Example
//!
//! ```ignore
//! let group = EndpointGroup::new();
//! let factories = Arc::new(DialogFactoryMap::new());
//! let listener = DialogListener::new(service, factories, group, ListenerConfig::default());
//! let addr = listener.bind("127.0.0.1:0".parse()?).await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::buffer::{BlockPool, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_POOLED};
use crate::dialog::DialogFactoryMap;
use crate::error::{MeshwireError, Result};

use super::handler::{DialogEndpointHandler, EndpointConfig, EndpointRuntime};
use super::manager::{EndpointGroup, EndpointHandler, EndpointHandlerManager};

/// Delay before retrying accept after a transient error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Configuration for a dialog listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Configuration applied to each accepted endpoint.
    pub endpoint: EndpointConfig,
    /// Size of pooled receive blocks.
    pub read_block_size: usize,
    /// Expose the listening socket to non-dialog (legacy synchronous)
    /// consumers via [`DialogListener::socket_prepared`].
    pub expose_prepared_socket: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            read_block_size: DEFAULT_BLOCK_SIZE,
            expose_prepared_socket: false,
        }
    }
}

/// An accepted inbound connection as tracked by the listener.
pub struct ResponderEndpoint {
    /// Handler id within the endpoint group.
    id: u64,
    /// Remote address.
    peer: SocketAddr,
    /// Whether this connection speaks the dialog protocol. Non-dialog
    /// connections are served but not tracked.
    dialog_capable: bool,
    /// The handler serving the connection.
    handler: Arc<dyn EndpointHandler>,
}

impl ResponderEndpoint {
    /// Create an endpoint record for an accepted connection.
    pub fn new(
        id: u64,
        peer: SocketAddr,
        dialog_capable: bool,
        handler: Arc<dyn EndpointHandler>,
    ) -> Self {
        Self {
            id,
            peer,
            dialog_capable,
            handler,
        }
    }

    /// Handler id within the endpoint group.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address.
    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether this connection is dialog-capable.
    #[inline]
    pub fn is_dialog_capable(&self) -> bool {
        self.dialog_capable
    }

    /// The handler serving this connection.
    pub fn handler(&self) -> &Arc<dyn EndpointHandler> {
        &self.handler
    }
}

impl std::fmt::Debug for ResponderEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponderEndpoint")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("dialog_capable", &self.dialog_capable)
            .finish()
    }
}

/// Cloned handle to the listening socket for non-dialog consumers.
///
/// Present only when enabled in [`ListenerConfig`] and after a
/// successful bind; absence means synchronous-connection fallback is
/// unsupported on this listener. The underlying socket was put into
/// non-blocking mode at bind time.
#[derive(Debug, Clone)]
pub struct PreparedSocket {
    inner: Arc<std::net::TcpListener>,
}

impl PreparedSocket {
    fn new(listener: std::net::TcpListener) -> Self {
        Self {
            inner: Arc::new(listener),
        }
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Borrow the underlying std listener.
    pub fn as_std(&self) -> &std::net::TcpListener {
        &self.inner
    }

    /// Clone the underlying socket handle.
    pub fn try_clone_std(&self) -> std::io::Result<std::net::TcpListener> {
        self.inner.try_clone()
    }
}

/// Listener lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Unbound,
    Listening(SocketAddr),
    ShuttingDown,
    Shutdown,
}

/// Accepts inbound connections and dispatches their dialogs.
pub struct DialogListener<S> {
    state: RwLock<ListenerState>,
    service: Arc<S>,
    factories: Arc<DialogFactoryMap<S>>,
    group: Arc<EndpointGroup>,
    pool: Arc<BlockPool>,
    /// Tracked dialog-capable endpoints by handler id.
    endpoints: DashMap<u64, Arc<ResponderEndpoint>>,
    config: ListenerConfig,
    prepared: Mutex<Option<PreparedSocket>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S> DialogListener<S>
where
    S: Send + Sync + 'static,
{
    /// Create an unbound listener.
    pub fn new(
        service: Arc<S>,
        factories: Arc<DialogFactoryMap<S>>,
        group: Arc<EndpointGroup>,
        config: ListenerConfig,
    ) -> Arc<Self> {
        let pool = BlockPool::with_config(config.read_block_size, DEFAULT_MAX_POOLED);
        Arc::new(Self {
            state: RwLock::new(ListenerState::Unbound),
            service,
            factories,
            group,
            pool,
            endpoints: DashMap::new(),
            config,
            prepared: Mutex::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// Bind the listening socket and start accepting.
    ///
    /// Transitions `Unbound -> Listening`; the returned address carries
    /// the actual port when binding to port 0.
    ///
    /// # Errors
    ///
    /// `Io` on bind failure, `Protocol` if already bound,
    /// `ListenerShutdown` after shutdown.
    pub async fn bind(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let mut state = self.state.write();
        match *state {
            ListenerState::Unbound => {}
            ListenerState::Listening(_) => {
                return Err(MeshwireError::Protocol("listener already bound".to_string()));
            }
            ListenerState::ShuttingDown | ListenerState::Shutdown => {
                return Err(MeshwireError::ListenerShutdown);
            }
        }

        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local = std_listener.local_addr()?;

        if self.config.expose_prepared_socket {
            let clone = std_listener.try_clone()?;
            *self.prepared.lock() = Some(PreparedSocket::new(clone));
        }

        let listener = tokio::net::TcpListener::from_std(std_listener)?;
        *state = ListenerState::Listening(local);
        drop(state);

        let task = tokio::spawn(accept_loop(self.clone(), listener));
        *self.accept_task.lock() = Some(task);

        tracing::info!(%local, "dialog listener bound");
        Ok(local)
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// `NotBound` before the first successful bind,
    /// `ListenerShutdown` afterwards.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match *self.state.read() {
            ListenerState::Unbound => Err(MeshwireError::NotBound),
            ListenerState::Listening(addr) => Ok(addr),
            ListenerState::ShuttingDown | ListenerState::Shutdown => {
                Err(MeshwireError::ListenerShutdown)
            }
        }
    }

    /// The registry inbound dialogs are dispatched through.
    pub fn dialog_factory_map(&self) -> &Arc<DialogFactoryMap<S>> {
        &self.factories
    }

    /// The endpoint group owning this listener's handlers.
    pub fn endpoint_group(&self) -> &Arc<EndpointGroup> {
        &self.group
    }

    /// Listening-socket handle for non-dialog consumers, if enabled.
    pub fn socket_prepared(&self) -> Option<PreparedSocket> {
        self.prepared.lock().clone()
    }

    /// Track an accepted responder endpoint.
    ///
    /// Non-dialog connections are accepted but excluded from the
    /// tracked set (connection limits and health checks do not apply to
    /// them).
    pub fn accept_responder_endpoint(&self, endpoint: Arc<ResponderEndpoint>) {
        if !endpoint.is_dialog_capable() {
            tracing::debug!(
                peer = %endpoint.peer_addr(),
                "non-dialog connection accepted; not tracked"
            );
            return;
        }
        self.endpoints.insert(endpoint.id(), endpoint);
    }

    /// Stop tracking an endpoint. Tolerates duplicate removal: the
    /// endpoint may be dropped by both its handler's own teardown and
    /// the listener's shutdown sweep.
    pub fn remove_responder_endpoint(&self, endpoint: &ResponderEndpoint) {
        self.remove_endpoint_by_id(endpoint.id());
    }

    fn remove_endpoint_by_id(&self, id: u64) {
        if self.endpoints.remove(&id).is_some() {
            tracing::debug!(endpoint_id = id, "responder endpoint removed");
        } else {
            tracing::trace!(endpoint_id = id, "duplicate endpoint removal ignored");
        }
    }

    /// Number of currently tracked dialog-capable endpoints.
    pub fn tracked_endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Report a listening-channel-level error (distinct from
    /// per-connection errors). `channel_closed` says whether the
    /// channel already closed itself: if so the listener cleans up,
    /// otherwise the error is logged and accepting continues.
    pub fn on_channel_error(&self, error: &std::io::Error, channel_closed: bool) {
        if channel_closed {
            tracing::error!(%error, "listening channel closed; shutting listener down");
            self.shutdown(false);
        } else {
            tracing::warn!(%error, "listening channel error");
        }
    }

    /// Shut the listener down. `force` drops in-flight dialogs on
    /// tracked endpoints immediately; otherwise they drain.
    pub fn shutdown(&self, force: bool) {
        {
            let mut state = self.state.write();
            if matches!(
                *state,
                ListenerState::ShuttingDown | ListenerState::Shutdown
            ) {
                return;
            }
            *state = ListenerState::ShuttingDown;
        }

        tracing::info!(force, "dialog listener shutting down");

        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }

        let endpoints: Vec<_> = self.endpoints.iter().map(|e| e.value().clone()).collect();
        self.endpoints.clear();
        for endpoint in endpoints {
            endpoint.handler().begin_shutdown(force);
        }

        *self.prepared.lock() = None;
        *self.state.write() = ListenerState::Shutdown;
    }

    /// Whether the listener has reached its terminal state.
    pub fn is_shutdown(&self) -> bool {
        matches!(*self.state.read(), ListenerState::Shutdown)
    }

    fn is_terminating(&self) -> bool {
        matches!(
            *self.state.read(),
            ListenerState::ShuttingDown | ListenerState::Shutdown
        )
    }

    /// Wire one accepted connection into the dispatch path.
    fn handle_accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.group.allocate_handler_id();
        let runtime = EndpointRuntime {
            service: self.service.clone(),
            factories: self.factories.clone(),
            manager: self.group.clone() as Arc<dyn EndpointHandlerManager>,
            executor: Handle::current(),
            pool: self.pool.clone(),
            config: self.config.endpoint.clone(),
        };

        let weak = Arc::downgrade(self);
        let on_close = Box::new(move || {
            if let Some(listener) = weak.upgrade() {
                listener.remove_endpoint_by_id(id);
            }
        }) as Box<dyn FnOnce() + Send>;

        match DialogEndpointHandler::spawn(stream, id, runtime, Some(on_close)) {
            Ok(handler) => {
                self.group.register_handler(handler.clone());
                let endpoint = Arc::new(ResponderEndpoint::new(id, peer, true, handler));
                self.accept_responder_endpoint(endpoint);
                tracing::debug!(%peer, handler_id = id, "accepted dialog endpoint");
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "failed to start endpoint handler");
            }
        }
    }
}

/// Accept loop task: one per bound listener.
async fn accept_loop<S>(this: Arc<DialogListener<S>>, listener: tokio::net::TcpListener)
where
    S: Send + Sync + 'static,
{
    loop {
        if this.is_terminating() {
            break;
        }

        match listener.accept().await {
            Ok((stream, peer)) => {
                if this.group.is_shutdown() {
                    tracing::debug!(%peer, "dropping connection accepted during shutdown");
                    continue;
                }
                this.handle_accept(stream, peer);
            }
            Err(e) => {
                this.on_channel_error(&e, false);
                if this.is_terminating() {
                    break;
                }
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    struct StubHandler {
        id: u64,
        shutdown_requested: AtomicBool,
    }

    impl EndpointHandler for StubHandler {
        fn id(&self) -> u64 {
            self.id
        }

        fn peer_addr(&self) -> SocketAddr {
            "127.0.0.1:4500".parse().unwrap()
        }

        fn begin_shutdown(&self, _force: bool) {
            self.shutdown_requested.store(true, Ordering::SeqCst);
        }

        fn is_shutdown(&self) -> bool {
            self.shutdown_requested.load(Ordering::SeqCst)
        }
    }

    fn stub_endpoint(id: u64, dialog_capable: bool) -> Arc<ResponderEndpoint> {
        let handler = Arc::new(StubHandler {
            id,
            shutdown_requested: AtomicBool::new(false),
        });
        Arc::new(ResponderEndpoint::new(
            id,
            "127.0.0.1:4500".parse().unwrap(),
            dialog_capable,
            handler,
        ))
    }

    fn make_listener(config: ListenerConfig) -> Arc<DialogListener<()>> {
        DialogListener::new(
            Arc::new(()),
            Arc::new(DialogFactoryMap::new()),
            EndpointGroup::new(),
            config,
        )
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_local_addr_guard() {
        let listener = make_listener(ListenerConfig::default());

        assert!(matches!(
            listener.local_addr(),
            Err(MeshwireError::NotBound)
        ));

        let addr = listener.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);
        assert_ne!(addr.port(), 0);

        listener.shutdown(false);
        assert!(matches!(
            listener.local_addr(),
            Err(MeshwireError::ListenerShutdown)
        ));
    }

    #[tokio::test]
    async fn test_double_bind_rejected() {
        let listener = make_listener(ListenerConfig::default());
        listener.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let result = listener.bind("127.0.0.1:0".parse().unwrap()).await;

        assert!(matches!(result, Err(MeshwireError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_accept_tracks_dialog_endpoint() {
        let listener = make_listener(ListenerConfig::default());
        let addr = listener.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();

        let tracker = listener.clone();
        wait_for(move || tracker.tracked_endpoint_count() == 1).await;
        assert_eq!(listener.endpoint_group().handler_count(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_removal_tolerates_duplicates() {
        let listener = make_listener(ListenerConfig::default());
        let endpoint = stub_endpoint(1, true);

        listener.accept_responder_endpoint(endpoint.clone());
        assert_eq!(listener.tracked_endpoint_count(), 1);

        listener.remove_responder_endpoint(&endpoint);
        listener.remove_responder_endpoint(&endpoint);
        assert_eq!(listener.tracked_endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_non_dialog_endpoint_not_tracked() {
        let listener = make_listener(ListenerConfig::default());

        listener.accept_responder_endpoint(stub_endpoint(1, false));

        assert_eq!(listener.tracked_endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_prepared_socket_follows_config() {
        let plain = make_listener(ListenerConfig::default());
        plain.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(plain.socket_prepared().is_none());

        let exposing = make_listener(ListenerConfig {
            expose_prepared_socket: true,
            ..ListenerConfig::default()
        });
        let addr = exposing.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let prepared = exposing.socket_prepared().expect("prepared socket");
        assert_eq!(prepared.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_prepared_socket_absent_before_bind() {
        let listener = make_listener(ListenerConfig {
            expose_prepared_socket: true,
            ..ListenerConfig::default()
        });

        assert!(listener.socket_prepared().is_none());
    }

    #[tokio::test]
    async fn test_channel_error_closed_triggers_cleanup() {
        let listener = make_listener(ListenerConfig::default());
        listener.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let endpoint = stub_endpoint(7, true);
        listener.accept_responder_endpoint(endpoint.clone());

        let error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel gone");
        listener.on_channel_error(&error, true);

        assert!(listener.is_shutdown());
        assert_eq!(listener.tracked_endpoint_count(), 0);
        assert!(endpoint.handler().is_shutdown());
    }

    #[tokio::test]
    async fn test_channel_error_open_only_logs() {
        let listener = make_listener(ListenerConfig::default());
        let addr = listener.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let error = std::io::Error::new(std::io::ErrorKind::WouldBlock, "transient");
        listener.on_channel_error(&error, false);

        assert!(!listener.is_shutdown());
        assert_eq!(listener.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let listener = make_listener(ListenerConfig::default());
        listener.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        listener.shutdown(true);
        listener.shutdown(false);

        assert!(listener.is_shutdown());
    }
}
