//! Refcounted byte buffers drawn from a recycling pool.
//!
//! A [`Blockpool`] hands out fixed-size buffers and takes them back when the
//! last [`Block`] view referencing them drops. Pools only grow: when the
//! free list runs dry another chunk of buffers is allocated.

use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;

struct PoolShared {
    element_size: usize,
    elements_per_chunk: usize,
    free: SegQueue<Box<[u8]>>,
    allocated: AtomicUsize,
}

/// Fixed-size allocator producing recyclable [`Block`]s.
///
/// Cloning a pool clones the handle; all clones share one free list. Blocks
/// may outlive every pool handle, in which case their storage is simply
/// freed instead of recycled.
#[derive(Clone)]
pub struct Blockpool {
    shared: Arc<PoolShared>,
}

/// Live/free accounting for a pool, for memory probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStat {
    pub element_size: usize,
    pub allocated: usize,
    pub free: usize,
}

impl Blockpool {
    /// `element_size` is the byte size of every block; `elements_per_chunk`
    /// how many buffers are allocated in one go when the free list is empty.
    /// Callers handing out very large blocks (tens of MiB) should keep the
    /// chunk count small.
    pub fn new(element_size: usize, elements_per_chunk: usize) -> Self {
        Blockpool {
            shared: Arc::new(PoolShared {
                element_size,
                elements_per_chunk: elements_per_chunk.max(1),
                free: SegQueue::new(),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    pub fn element_size(&self) -> usize {
        self.shared.element_size
    }

    /// Take a block from the free list, growing the pool by one chunk if
    /// nothing is free. The returned block is zero-filled only on first
    /// allocation; recycled blocks keep their previous contents.
    pub fn get(&self) -> Block {
        let mem = match self.shared.free.pop() {
            Some(mem) => mem,
            None => {
                // grow by one chunk, keep one buffer for ourselves
                let n = self.shared.elements_per_chunk;
                for _ in 1..n {
                    self.shared
                        .free
                        .push(vec![0u8; self.shared.element_size].into_boxed_slice());
                }
                self.shared.allocated.fetch_add(n, Ordering::Relaxed);
                vec![0u8; self.shared.element_size].into_boxed_slice()
            }
        };
        let len = mem.len();
        Block {
            inner: Arc::new(BlockInner {
                mem: ManuallyDrop::new(mem),
                pool: Arc::downgrade(&self.shared),
            }),
            off: 0,
            len,
        }
    }

    pub fn memstat(&self) -> MemStat {
        MemStat {
            element_size: self.shared.element_size,
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            free: self.shared.free.len(),
        }
    }
}

struct BlockInner {
    mem: ManuallyDrop<Box<[u8]>>,
    pool: Weak<PoolShared>,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        // Safety: `mem` is taken exactly once, here, and never touched again.
        let mem = unsafe { ManuallyDrop::take(&mut self.mem) };
        if let Some(pool) = self.pool.upgrade() {
            pool.free.push(mem);
        }
    }
}

/// Shared view into a pool-backed byte buffer.
///
/// `sub()` returns a narrower view sharing the same refcount; the buffer
/// returns to its pool when the last view drops. Mutable access is only
/// available while the view is unique.
pub struct Block {
    inner: Arc<BlockInner>,
    off: usize,
    len: usize,
}

impl Block {
    /// A block backed by plain heap memory, not tied to any pool. Used for
    /// one-off buffers (file reads, protocol scratch space).
    pub fn heap(size: usize) -> Block {
        Block {
            inner: Arc::new(BlockInner {
                mem: ManuallyDrop::new(vec![0u8; size].into_boxed_slice()),
                pool: Weak::new(),
            }),
            off: 0,
            len: size,
        }
    }

    /// Wrap an existing byte vector.
    pub fn from_vec(v: Vec<u8>) -> Block {
        let len = v.len();
        Block {
            inner: Arc::new(BlockInner {
                mem: ManuallyDrop::new(v.into_boxed_slice()),
                pool: Weak::new(),
            }),
            off: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Narrower view sharing the underlying buffer and refcount.
    pub fn sub(&self, off: usize, len: usize) -> Block {
        assert!(off + len <= self.len, "sub-slice out of range");
        Block {
            inner: Arc::clone(&self.inner),
            off: self.off + off,
            len,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner.mem[self.off..self.off + self.len]
    }

    /// Mutable access; available only while no other view shares the buffer.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let off = self.off;
        let len = self.len;
        Arc::get_mut(&mut self.inner).map(|inner| &mut inner.mem[off..off + len])
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl Clone for Block {
    fn clone(&self) -> Self {
        Block {
            inner: Arc::clone(&self.inner),
            off: self.off,
            len: self.len,
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("off", &self.off)
            .field("len", &self.len)
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl AsRef<[u8]> for Block {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
