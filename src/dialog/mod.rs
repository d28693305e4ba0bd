//! Dialog module - handler factories, dispatch registry, and context.
//!
//! A dialog is one logical request/response exchange multiplexed over a
//! shared endpoint. Inbound dialogs are routed by type through the
//! [`DialogFactoryMap`] to a fresh handler built by a
//! [`ResponderDialogFactory`]; the handler runs on a caller-supplied
//! executor and answers through its [`DialogContext`].
//!
//! # Example
//!
//! ```ignore
//! let factories = DialogFactoryMap::new();
//! factories.put(
//!     ECHO_DIALOG_TYPE,
//!     Arc::new(FnDialogFactory::new(|_service: Arc<()>, _executor, _span| {
//!         Box::new(FnDialogHandler::new(|payload, ctx| async move {
//!             let echo = Bytes::copy_from_slice(payload.buf());
//!             ctx.complete_bytes(echo).await
//!         })) as Box<dyn DialogHandler>
//!     })),
//! );
//! ```

mod context;
mod factory;
mod factory_map;

pub use context::DialogContext;
pub use factory::{BoxFuture, DialogHandler, FnDialogFactory, FnDialogHandler, ResponderDialogFactory};
pub use factory_map::{DialogDispatch, DialogFactoryMap};
