//! Dialog handler and factory traits.
//!
//! A [`ResponderDialogFactory`] builds one [`DialogHandler`] per
//! inbound dialog of its type, bound to exactly the (service, executor,
//! span) triple it is given. Factories are pure: no blocking, no I/O,
//! no stored per-dialog state. The executor is the runtime handle the
//! handler future is spawned on, keeping service logic off the
//! endpoint's I/O task; the span is the injected logging context for
//! the dialog.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::Span;

use crate::buffer::BufSlice;
use crate::error::Result;

use super::context::DialogContext;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler for a single inbound dialog.
///
/// Consumes the request payload slice; releasing it (explicitly or by
/// drop) is what lets the underlying receive block return to the pool.
pub trait DialogHandler: Send {
    /// Run the dialog against the given payload and context.
    fn handle(self: Box<Self>, payload: BufSlice, ctx: DialogContext) -> BoxFuture<'static, Result<()>>;
}

/// Factory building dialog handlers for one dialog type.
pub trait ResponderDialogFactory<S>: Send + Sync {
    /// Build a handler bound to this service instance, executor, and
    /// logging span. Called once per inbound dialog of the matching
    /// type; must not block or perform I/O.
    fn create_dialog_handler(
        &self,
        service: Arc<S>,
        executor: Handle,
        span: Span,
    ) -> Box<dyn DialogHandler>;
}

/// Wrapper turning an async closure into a [`DialogHandler`].
pub struct FnDialogHandler<F, Fut>
where
    F: FnOnce(BufSlice, DialogContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnDialogHandler<F, Fut>
where
    F: FnOnce(BufSlice, DialogContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    /// Wrap an async closure as a handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> DialogHandler for FnDialogHandler<F, Fut>
where
    F: FnOnce(BufSlice, DialogContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(self: Box<Self>, payload: BufSlice, ctx: DialogContext) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.handler)(payload, ctx))
    }
}

/// Factory backed by a closure over the (service, executor, span) triple.
///
/// # Example
///
/// ```ignore
/// let factory = FnDialogFactory::new(|service: Arc<Store>, _executor, _span| {
///     Box::new(FnDialogHandler::new(move |payload, ctx| async move {
///         let value = service.get(payload.buf());
///         ctx.complete_bytes(value).await
///     })) as Box<dyn DialogHandler>
/// });
/// ```
pub struct FnDialogFactory<F> {
    create: F,
}

impl<F> FnDialogFactory<F> {
    /// Wrap a closure as a factory.
    pub fn new(create: F) -> Self {
        Self { create }
    }
}

impl<S, F> ResponderDialogFactory<S> for FnDialogFactory<F>
where
    F: Fn(Arc<S>, Handle, Span) -> Box<dyn DialogHandler> + Send + Sync,
{
    fn create_dialog_handler(
        &self,
        service: Arc<S>,
        executor: Handle,
        span: Span,
    ) -> Box<dyn DialogHandler> {
        (self.create)(service, executor, span)
    }
}
