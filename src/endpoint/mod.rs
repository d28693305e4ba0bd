//! Endpoint module - connection lifecycle, dispatch, and management.
//!
//! Provides:
//! - [`EndpointGroup`] / [`EndpointHandlerManager`] - owns a set of
//!   endpoint handlers and absorbs their shutdown notifications
//! - [`DialogEndpointHandler`] - serves one accepted connection
//! - [`DialogListener`] - accepts inbound connections and binds them to
//!   the dialog dispatch path

mod handler;
mod listener;
mod manager;

pub use handler::{
    DialogEndpointHandler, EndpointConfig, EndpointRuntime, DEFAULT_DRAIN_TIMEOUT,
    DEFAULT_MAX_CONCURRENT_DIALOGS,
};
pub use listener::{
    DialogListener, ListenerConfig, PreparedSocket, ResponderEndpoint,
};
pub use manager::{EndpointGroup, EndpointHandler, EndpointHandlerManager};
