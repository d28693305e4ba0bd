//! # meshwire
//!
//! Asynchronous dialog-multiplexing RPC transport core for node-to-node
//! communication in a distributed system.
//!
//! ## Architecture
//!
//! - **Buffers** (`buffer`): received bytes live in pooled blocks
//!   wrapped in fork-capable [`BufSlice`] views; a block returns to the
//!   pool exactly when every derived slice has been released.
//! - **Protocol** (`protocol`): 11-byte framing that multiplexes many
//!   dialogs (logical request/response exchanges) over one connection.
//! - **Dialogs** (`dialog`): inbound dialogs are routed by type through
//!   a concurrent [`DialogFactoryMap`] to a fresh handler built by a
//!   [`ResponderDialogFactory`], running on a caller-supplied executor.
//! - **Endpoints** (`endpoint`): a [`DialogListener`] accepts
//!   connections, one [`DialogEndpointHandler`] serves each, and an
//!   [`EndpointGroup`] tracks them through the shutdown races.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use meshwire::{
//!     DialogFactoryMap, DialogListener, EndpointGroup, FnDialogFactory,
//!     FnDialogHandler, ListenerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> meshwire::Result<()> {
//!     let factories = Arc::new(DialogFactoryMap::new());
//!     factories.put(1, Arc::new(FnDialogFactory::new(|_svc: Arc<()>, _exec, _span| {
//!         Box::new(FnDialogHandler::new(|payload, ctx| async move {
//!             let echo = bytes::Bytes::copy_from_slice(payload.buf());
//!             ctx.complete_bytes(echo).await
//!         })) as Box<dyn meshwire::DialogHandler>
//!     })));
//!
//!     let listener = DialogListener::new(
//!         Arc::new(()),
//!         factories,
//!         EndpointGroup::new(),
//!         ListenerConfig::default(),
//!     );
//!     let addr = listener.bind("127.0.0.1:0".parse().unwrap()).await?;
//!     println!("listening on {addr}");
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod dialog;
pub mod endpoint;
pub mod error;
pub mod perf;
pub mod protocol;
pub mod timeout;
pub mod writer;

pub use buffer::{BlockPool, BufSlice};
pub use dialog::{
    DialogContext, DialogDispatch, DialogFactoryMap, DialogHandler, FnDialogFactory,
    FnDialogHandler, ResponderDialogFactory,
};
pub use endpoint::{
    DialogEndpointHandler, DialogListener, EndpointGroup, EndpointHandler,
    EndpointHandlerManager, ListenerConfig, ResponderEndpoint,
};
pub use error::{MeshwireError, Result};
pub use perf::EndpointGroupPerfTracker;
pub use timeout::TimedRemote;
