//! Per-connection dialog endpoint handler.
//!
//! A [`DialogEndpointHandler`] owns one accepted connection: it pulls
//! pooled receive blocks off the socket, scans them into dialog frames,
//! classifies each frame through the factory map, and spawns the
//! matching handler future on the caller-supplied executor. Service
//! logic therefore never runs on the endpoint's I/O task.
//!
//! Shutdown is dual-path: the owning manager may request it
//! ([`EndpointHandler::begin_shutdown`]) or the read loop terminates on
//! its own (peer close, I/O error, protocol violation). Both paths end
//! in the same notification to the manager, which tolerates the
//! duplicate delivery.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::buffer::{BlockPool, BufSlice};
use crate::dialog::{DialogContext, DialogDispatch, DialogFactoryMap};
use crate::error::{MeshwireError, Result};
use crate::protocol::{flags, DialogFrame, DialogHeader, FrameScanner, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

use super::manager::{EndpointHandler, EndpointHandlerManager};

/// Default maximum concurrent dialogs per endpoint.
pub const DEFAULT_MAX_CONCURRENT_DIALOGS: usize = 256;

/// Default time allowed for in-flight dialogs to drain on graceful
/// shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between drain re-checks.
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for one endpoint handler.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Maximum allowed inbound payload size.
    pub max_payload_size: u32,
    /// Maximum dialogs running concurrently on this endpoint. Further
    /// requests are rejected until permits free up.
    pub max_concurrent_dialogs: usize,
    /// How long graceful shutdown waits for in-flight dialogs.
    pub drain_timeout: Duration,
    /// Outbound writer configuration.
    pub writer: WriterConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_concurrent_dialogs: DEFAULT_MAX_CONCURRENT_DIALOGS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            writer: WriterConfig::default(),
        }
    }
}

/// Everything an endpoint handler shares with its siblings: the service
/// instance, the dispatch registry, the owning manager, the executor
/// for dialog futures, and the receive-block pool.
pub struct EndpointRuntime<S> {
    /// Service instance handlers are bound to.
    pub service: Arc<S>,
    /// Dispatch registry for inbound dialog types.
    pub factories: Arc<DialogFactoryMap<S>>,
    /// Owning manager, notified on handler shutdown.
    pub manager: Arc<dyn EndpointHandlerManager>,
    /// Executor dialog handler futures are spawned on.
    pub executor: Handle,
    /// Pool receive blocks are drawn from.
    pub pool: Arc<BlockPool>,
    /// Per-endpoint configuration.
    pub config: EndpointConfig,
}

impl<S> Clone for EndpointRuntime<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            factories: self.factories.clone(),
            manager: self.manager.clone(),
            executor: self.executor.clone(),
            pool: self.pool.clone(),
            config: self.config.clone(),
        }
    }
}

/// Handler for one accepted dialog-capable connection.
pub struct DialogEndpointHandler {
    /// Id within the owning group.
    id: u64,
    /// Remote address.
    peer: SocketAddr,
    /// Outbound writer shared with every dialog on this endpoint.
    writer: WriterHandle,
    /// Shutdown request channel; the value carries the force flag.
    shutdown_tx: watch::Sender<Option<bool>>,
    /// Set once the run loop has fully terminated.
    terminated: AtomicBool,
}

impl DialogEndpointHandler {
    /// Take ownership of an accepted connection and start serving it.
    ///
    /// `on_close` runs after the handler has terminated and the manager
    /// has been notified; the listener uses it to drop its endpoint
    /// tracking entry.
    pub fn spawn<S>(
        stream: TcpStream,
        id: u64,
        runtime: EndpointRuntime<S>,
        on_close: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<Arc<Self>>
    where
        S: Send + Sync + 'static,
    {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (writer, writer_task) = spawn_writer_task(write_half, runtime.config.writer.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(None);

        let handler = Arc::new(Self {
            id,
            peer,
            writer,
            shutdown_tx,
            terminated: AtomicBool::new(false),
        });

        let executor = runtime.executor.clone();
        executor.spawn(run(
            handler.clone(),
            read_half,
            runtime,
            shutdown_rx,
            writer_task,
            on_close,
        ));

        Ok(handler)
    }

    /// Outbound writer for this endpoint (e.g. for server-push frames).
    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }
}

impl EndpointHandler for DialogEndpointHandler {
    fn id(&self) -> u64 {
        self.id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn begin_shutdown(&self, force: bool) {
        self.shutdown_tx.send_replace(Some(force));
    }

    fn is_shutdown(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for DialogEndpointHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogEndpointHandler")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("terminated", &self.is_shutdown())
            .finish()
    }
}

/// Read loop: blocks off the socket, frames out of the scanner, dialog
/// futures onto the executor.
async fn run<S>(
    this: Arc<DialogEndpointHandler>,
    mut read_half: OwnedReadHalf,
    runtime: EndpointRuntime<S>,
    mut shutdown_rx: watch::Receiver<Option<bool>>,
    writer_task: JoinHandle<Result<()>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
) where
    S: Send + Sync + 'static,
{
    use tokio::io::AsyncReadExt;

    let config = runtime.config.clone();
    let perf = runtime.manager.perf_tracker();
    let mut scanner = FrameScanner::with_max_payload(config.max_payload_size);
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_dialogs));
    let mut force_close = false;

    loop {
        let mut block = runtime.pool.acquire();

        tokio::select! {
            _ = shutdown_rx.changed() => {
                let force = (*shutdown_rx.borrow_and_update()).unwrap_or(false);
                tracing::debug!(peer = %this.peer, force, "endpoint shutdown requested");
                force_close = force;
                break;
            }

            read = read_half.read_buf(&mut block) => {
                match read {
                    Ok(0) => {
                        tracing::debug!(peer = %this.peer, "peer closed connection");
                        break;
                    }
                    Ok(n) => {
                        perf.record_bytes_received(n as u64);
                        let mut root = BufSlice::root_pooled(
                            block.freeze(),
                            runtime.pool.clone(),
                            "receive block",
                        );
                        match scanner.push(&mut root) {
                            Ok(frames) => {
                                for frame in frames {
                                    dispatch_frame(frame, &this, &runtime, &semaphore);
                                }
                                root.mark_free();
                            }
                            Err(e) => {
                                tracing::error!(
                                    peer = %this.peer,
                                    error = %e,
                                    "protocol violation; closing endpoint"
                                );
                                root.mark_free();
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %this.peer, error = %e, "endpoint read error");
                        break;
                    }
                }
            }
        }
    }

    if !force_close {
        let deadline = Instant::now() + config.drain_timeout;
        let drained = wait_until(deadline, || {
            semaphore.available_permits() == config.max_concurrent_dialogs
        })
        .await;
        if !drained {
            tracing::warn!(peer = %this.peer, "drain timeout; dropping in-flight dialogs");
        }
        // Give queued responses a chance to reach the wire.
        let _ = wait_until(deadline, || this.writer.pending_count() == 0).await;
    }
    writer_task.abort();

    this.terminated.store(true, Ordering::SeqCst);
    runtime.manager.on_handler_shutdown(this.as_ref());
    if let Some(callback) = on_close {
        callback();
    }
}

/// Classify one inbound frame and hand it to its handler.
fn dispatch_frame<S>(
    frame: DialogFrame,
    this: &Arc<DialogEndpointHandler>,
    runtime: &EndpointRuntime<S>,
    semaphore: &Arc<Semaphore>,
) where
    S: Send + Sync + 'static,
{
    let header = frame.header;
    let perf = runtime.manager.perf_tracker();

    if header.is_response() {
        tracing::warn!(
            dialog_type = header.dialog_type,
            dialog_id = header.dialog_id,
            "unexpected response frame on responder endpoint"
        );
        return;
    }

    match runtime.factories.classify(header.dialog_type) {
        DialogDispatch::Active(factory) => {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    perf.record_dialog_rejected_capacity();
                    tracing::warn!(
                        dialog_type = header.dialog_type,
                        dialog_id = header.dialog_id,
                        "dialog capacity reached, rejecting request"
                    );
                    send_reject(&this.writer, &header, "dialog capacity exceeded");
                    return;
                }
            };

            perf.record_dialog_dispatched();
            let span = tracing::info_span!(
                "dialog",
                dialog_type = header.dialog_type,
                dialog_id = header.dialog_id,
                peer = %this.peer,
            );
            let handler = factory.create_dialog_handler(
                runtime.service.clone(),
                runtime.executor.clone(),
                span.clone(),
            );
            let ctx =
                DialogContext::with_writer(header.dialog_type, header.dialog_id, this.writer.clone());
            let err_ctx = ctx.clone();
            let payload = frame.into_payload();

            runtime.executor.spawn(
                async move {
                    // Permit is held until the dialog completes.
                    let _permit = permit;
                    if let Err(e) = handler.handle(payload, ctx).await {
                        tracing::error!(error = %e, "dialog handler failed");
                        let _ = err_ctx.error(&e.to_string()).await;
                    }
                }
                .instrument(span),
            );
        }

        DialogDispatch::Inactive => {
            // Benign race with service deregistration; reject quietly.
            perf.record_dialog_rejected_inactive();
            tracing::debug!(
                dialog_type = header.dialog_type,
                dialog_id = header.dialog_id,
                "dialog type no longer active, rejecting"
            );
            let err = MeshwireError::DialogTypeInactive(header.dialog_type);
            send_reject(&this.writer, &header, &err.to_string());
        }

        DialogDispatch::Unknown => {
            perf.record_dialog_rejected_unknown();
            tracing::error!(
                dialog_type = header.dialog_type,
                dialog_id = header.dialog_id,
                active = %runtime.factories.describe_active_dialog_types(),
                "unknown dialog type: protocol bug or version mismatch"
            );
            let err = MeshwireError::UnknownDialogType(header.dialog_type);
            send_reject(&this.writer, &header, &err.to_string());
        }
    }
}

/// Best-effort error frame for a rejected dialog; never blocks the read
/// loop.
fn send_reject(writer: &WriterHandle, header: &DialogHeader, message: &str) {
    let reply = DialogHeader::new(
        header.dialog_type,
        flags::ERROR_RESPONSE,
        header.dialog_id,
        message.len() as u32,
    );
    let frame = OutboundFrame::new(&reply, Bytes::copy_from_slice(message.as_bytes()));
    if let Err(e) = writer.try_send(frame) {
        tracing::debug!(error = %e, "failed to send rejection frame");
    }
}

/// Poll `done` until it holds or the deadline passes.
async fn wait_until(deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(DRAIN_CHECK_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_config_defaults() {
        let config = EndpointConfig::default();

        assert_eq!(config.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
        assert_eq!(config.max_concurrent_dialogs, DEFAULT_MAX_CONCURRENT_DIALOGS);
        assert_eq!(config.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
    }

    #[tokio::test]
    async fn test_wait_until_observes_condition() {
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(wait_until(deadline, || true).await);

        let deadline = Instant::now() + Duration::from_millis(5);
        assert!(!wait_until(deadline, || false).await);
    }
}
