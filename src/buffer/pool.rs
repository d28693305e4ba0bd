//! Receive-block pool backing the buffer slice tree.
//!
//! Endpoint read loops acquire blocks from the pool, fill them from the
//! socket, and hand them to [`BufSlice::root_pooled`](super::BufSlice).
//! When a root slice is fully collected its block comes back here and is
//! reclaimed on the next acquire via `Bytes::try_into_mut`, which only
//! succeeds once every derived view has been dropped. A block that is
//! still shared (e.g. a reader torn down mid-collection) is discarded
//! rather than reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Default receive block size (matches the read loop's buffer size).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default maximum number of idle blocks retained by the pool.
pub const DEFAULT_MAX_POOLED: usize = 32;

/// Pool of reusable receive blocks.
///
/// Cheap to share: the free list is behind a short non-async lock, the
/// counters are atomics.
pub struct BlockPool {
    /// Blocks returned by collected root slices, awaiting reuse.
    free: Mutex<Vec<Bytes>>,
    /// Capacity every acquired block is guaranteed to have.
    block_size: usize,
    /// Cap on the free list; excess blocks are dropped.
    max_pooled: usize,
    /// Blocks reclaimed from the free list.
    reclaimed: AtomicU64,
    /// Blocks freshly allocated.
    allocated: AtomicU64,
}

impl BlockPool {
    /// Create a pool with default block size and retention.
    pub fn new() -> Arc<Self> {
        Self::with_config(DEFAULT_BLOCK_SIZE, DEFAULT_MAX_POOLED)
    }

    /// Create a pool with custom block size and retention cap.
    pub fn with_config(block_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            block_size,
            max_pooled,
            reclaimed: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        })
    }

    /// Acquire a writable block with at least `block_size` capacity.
    ///
    /// Prefers reclaiming an idle block; falls back to a fresh
    /// allocation when the free list is empty or every idle block is
    /// still shared.
    pub fn acquire(&self) -> BytesMut {
        loop {
            let candidate = self.free.lock().pop();
            let Some(block) = candidate else { break };

            match block.try_into_mut() {
                Ok(mut buf) => {
                    buf.clear();
                    buf.reserve(self.block_size);
                    self.reclaimed.fetch_add(1, Ordering::Relaxed);
                    return buf;
                }
                // Still referenced somewhere; not safe to reuse.
                Err(_shared) => continue,
            }
        }

        self.allocated.fetch_add(1, Ordering::Relaxed);
        BytesMut::with_capacity(self.block_size)
    }

    /// Return a collected root block to the free list.
    pub(crate) fn recycle(&self, block: Bytes) {
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(block);
        }
    }

    /// Block capacity this pool hands out.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of idle blocks currently held by the pool.
    pub fn pooled_blocks(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of blocks reclaimed from the free list so far.
    pub fn reclaimed_blocks(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// Number of blocks freshly allocated so far.
    pub fn allocated_blocks(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("block_size", &self.block_size)
            .field("pooled", &self.pooled_blocks())
            .field("reclaimed", &self.reclaimed_blocks())
            .field("allocated", &self.allocated_blocks())
            .finish()
    }
}
