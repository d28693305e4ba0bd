//! Buffer module - pooled receive blocks and fork-capable slices.
//!
//! Received bytes live in blocks acquired from a [`BlockPool`]. Each
//! block is wrapped in a root [`BufSlice`]; the scanner and dialog
//! handlers fork child slices out of it for zero-copy dispatch. A block
//! returns to the pool exactly when the root and every descendant slice
//! have been released.

mod pool;
mod slice;

pub use pool::{BlockPool, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_POOLED};
pub use slice::BufSlice;
