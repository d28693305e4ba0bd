//! Reference-counted, fork-capable buffer slices.
//!
//! A [`BufSlice`] is a view over a region of received bytes. Handlers
//! split a slice into child slices with [`BufSlice::fork_and_advance`]
//! (consume forward from the read cursor) or
//! [`BufSlice::fork_backwards`] (re-capture bytes just behind the
//! cursor). Each fork registers a live child on the parent; a slice's
//! backing region is released only when the slice itself has been freed
//! AND every child has been released, so no bytes disappear while a
//! derived view is still reachable.
//!
//! Freeing is bottom-up: releasing the last child of a freed parent
//! collects the parent, recursively up to the root. Collecting a pooled
//! root returns its block to the [`BlockPool`].
//!
//! `mark_free` consumes the slice, so the "free exactly once" contract
//! is enforced by ownership; dropping a slice without an explicit
//! `mark_free` releases it the same way.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::pool::BlockPool;
use crate::error::{MeshwireError, Result};

/// Backing block of a pooled root slice, surrendered to the pool on
/// collection.
struct RootBlock {
    block: Mutex<Option<Bytes>>,
    pool: Arc<BlockPool>,
}

/// Shared accounting node for one slice in the fork tree.
struct SliceNode {
    /// Diagnostic label supplied at fork/creation time.
    label: &'static str,
    /// Set once the owning `BufSlice` has been freed or dropped.
    freed: AtomicBool,
    /// Set once this node's region has been released; dedups the two
    /// racing collection triggers (own free vs. last-child release).
    collected: AtomicBool,
    /// Number of forked children not yet collected.
    live_children: AtomicUsize,
    parent: Option<Arc<SliceNode>>,
    root: Option<RootBlock>,
}

/// A view over a shared byte region with a fork cursor.
///
/// Not `Clone`: exactly one owner per slice. Sharing bytes without
/// lifetime accounting is possible via [`BufSlice::bytes`], which pins
/// the underlying allocation but plays no part in free propagation.
pub struct BufSlice {
    /// This slice's bytes. Cleared on drop before accounting runs so a
    /// pooled root block is unshared by the time it is reclaimed.
    view: Bytes,
    /// Fork cursor, in bytes from the start of `view`.
    cursor: usize,
    node: Arc<SliceNode>,
}

impl BufSlice {
    /// Create a root slice over an unpooled byte region.
    pub fn root(block: Bytes, label: &'static str) -> Self {
        Self {
            view: block,
            cursor: 0,
            node: Arc::new(SliceNode {
                label,
                freed: AtomicBool::new(false),
                collected: AtomicBool::new(false),
                live_children: AtomicUsize::new(0),
                parent: None,
                root: None,
            }),
        }
    }

    /// Create a root slice whose block returns to `pool` on collection.
    pub fn root_pooled(block: Bytes, pool: Arc<BlockPool>, label: &'static str) -> Self {
        Self {
            view: block.clone(),
            cursor: 0,
            node: Arc::new(SliceNode {
                label,
                freed: AtomicBool::new(false),
                collected: AtomicBool::new(false),
                live_children: AtomicUsize::new(0),
                parent: None,
                root: Some(RootBlock {
                    block: Mutex::new(Some(block)),
                    pool,
                }),
            }),
        }
    }

    /// This slice's bytes. Callers must not index past [`BufSlice::len`].
    #[inline]
    pub fn buf(&self) -> &[u8] {
        &self.view
    }

    /// Cheap shared handle to this slice's bytes.
    ///
    /// The returned `Bytes` pins the underlying allocation until it is
    /// dropped but does not participate in free propagation.
    #[inline]
    pub fn bytes(&self) -> Bytes {
        self.view.clone()
    }

    /// Slice length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.view.len()
    }

    /// Whether the slice covers zero bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Current fork cursor position.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes between the cursor and the end of the slice.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.view.len() - self.cursor
    }

    /// Diagnostic label supplied at creation.
    #[inline]
    pub fn label(&self) -> &'static str {
        self.node.label
    }

    /// Number of forked children not yet released.
    pub fn live_children(&self) -> usize {
        self.node.live_children.load(Ordering::SeqCst)
    }

    /// Fork a child covering `[cursor, cursor + len)` and advance the
    /// cursor past it.
    ///
    /// # Errors
    ///
    /// `InvalidLength` if `len` is zero or exceeds the bytes remaining
    /// ahead of the cursor.
    pub fn fork_and_advance(&mut self, len: usize, label: &'static str) -> Result<BufSlice> {
        let available = self.remaining();
        if len == 0 || len > available {
            return Err(MeshwireError::InvalidLength {
                requested: len,
                available,
            });
        }

        let view = self.view.slice(self.cursor..self.cursor + len);
        self.cursor += len;
        Ok(self.adopt(view, label))
    }

    /// Fork a child covering `[cursor - len, cursor)`; the cursor does
    /// not move. Used to re-capture bytes that were already consumed,
    /// e.g. the header of a frame being rejected.
    ///
    /// # Errors
    ///
    /// `InvalidLength` if `len` is zero or exceeds the cursor position.
    pub fn fork_backwards(&mut self, len: usize, label: &'static str) -> Result<BufSlice> {
        let available = self.cursor;
        if len == 0 || len > available {
            return Err(MeshwireError::InvalidLength {
                requested: len,
                available,
            });
        }

        let view = self.view.slice(self.cursor - len..self.cursor);
        Ok(self.adopt(view, label))
    }

    /// Release this slice.
    ///
    /// Consuming `self` makes a second free unrepresentable. The backing
    /// region is collected once every forked child has been released
    /// too; collection propagates to the parent chain.
    pub fn mark_free(self) {
        drop(self);
    }

    fn adopt(&self, view: Bytes, label: &'static str) -> BufSlice {
        self.node.live_children.fetch_add(1, Ordering::SeqCst);
        BufSlice {
            view,
            cursor: 0,
            node: Arc::new(SliceNode {
                label,
                freed: AtomicBool::new(false),
                collected: AtomicBool::new(false),
                live_children: AtomicUsize::new(0),
                parent: Some(self.node.clone()),
                root: None,
            }),
        }
    }
}

impl Drop for BufSlice {
    fn drop(&mut self) {
        // Drop the view before accounting: by the time the root block
        // reaches the pool, this handle no longer shares the allocation.
        self.view = Bytes::new();
        release(&self.node);
    }
}

impl std::fmt::Debug for BufSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufSlice")
            .field("label", &self.node.label)
            .field("len", &self.view.len())
            .field("cursor", &self.cursor)
            .field("live_children", &self.live_children())
            .finish()
    }
}

/// Mark a node freed and collect it if no children remain.
///
/// SeqCst throughout: the freed flag and child count are checked
/// cross-wise from two racing paths (own free vs. last-child release),
/// and both must agree on who collects.
fn release(node: &Arc<SliceNode>) {
    if node.freed.swap(true, Ordering::SeqCst) {
        return;
    }
    if node.live_children.load(Ordering::SeqCst) == 0 {
        collect(node.clone());
    }
}

/// Release a node's region and propagate up the parent chain.
fn collect(mut node: Arc<SliceNode>) {
    loop {
        if node.collected.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(root) = &node.root {
            if let Some(block) = root.block.lock().take() {
                root.pool.recycle(block);
            }
        }

        let Some(parent) = node.parent.clone() else {
            return;
        };

        let prev = parent.live_children.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "live-child count underflow");
        if prev == 1 && parent.freed.load(Ordering::SeqCst) {
            node = parent;
            continue;
        }
        return;
    }
}
