//! Per-session scratch buffer pool.
//!
//! Many engine paths need a short-lived byte buffer: packing a cookie,
//! staging a block write, encoding a log record. Allocating fresh
//! buffers for each is wasteful, so every session owns a small pool of
//! reusable buffers. Scratch buffers are allocated by a single thread
//! of control, so the pool needs no locking.

/// A reusable scratch buffer slot.
#[derive(Debug, Default)]
struct Slot {
    buf: Vec<u8>,
    in_use: bool,
}

/// A growable pool of reusable byte buffers.
///
/// `alloc` hands out the smallest free buffer with at least the
/// requested capacity; if none is large enough it grows the largest
/// free buffer, and only when every slot is busy does it add a new
/// slot. `free` returns a buffer without deallocating so its capacity
/// is retained for the next caller.
#[derive(Debug, Default)]
pub struct ScratchPool {
    slots: Vec<Slot>,
}

/// A handle to a checked-out scratch buffer.
///
/// The handle indexes into the owning pool; the caller returns it with
/// [`ScratchPool::free`] when done. Dropping a handle without freeing
/// it is caught by [`ScratchPool::discard`] in debug builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchHandle(usize);

impl ScratchPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        ScratchPool::default()
    }

    /// Check out a buffer with capacity for at least `size` bytes.
    ///
    /// The returned buffer is cleared but keeps whatever capacity the
    /// slot accumulated across earlier uses.
    pub fn alloc(&mut self, size: usize) -> ScratchHandle {
        // Smallest sufficient buffer wins; otherwise remember the
        // largest free buffer and grow it.
        let mut best: Option<usize> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.in_use {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let bcap = self.slots[b].buf.capacity();
                    let cap = slot.buf.capacity();
                    // Prefer the smallest buffer that fits; among
                    // too-small buffers prefer the largest.
                    let better = if cap >= size && bcap >= size {
                        cap < bcap
                    } else if cap >= size {
                        true
                    } else if bcap >= size {
                        false
                    } else {
                        cap > bcap
                    };
                    Some(if better { i } else { b })
                }
            };
        }

        let idx = match best {
            Some(i) => i,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[idx];
        slot.buf.clear();
        if slot.buf.capacity() < size {
            slot.buf.reserve(size - slot.buf.capacity());
        }
        slot.in_use = true;
        ScratchHandle(idx)
    }

    /// Access the buffer behind a handle.
    pub fn get_mut(&mut self, handle: ScratchHandle) -> &mut Vec<u8> {
        debug_assert!(self.slots[handle.0].in_use);
        &mut self.slots[handle.0].buf
    }

    /// Access the buffer behind a handle read-only.
    pub fn get(&self, handle: ScratchHandle) -> &Vec<u8> {
        debug_assert!(self.slots[handle.0].in_use);
        &self.slots[handle.0].buf
    }

    /// Return a buffer to the pool without releasing its memory.
    pub fn free(&mut self, handle: ScratchHandle) {
        self.slots[handle.0].in_use = false;
    }

    /// Release all pooled memory at session close.
    ///
    /// Buffers still checked out at this point are leaks in the caller.
    pub fn discard(&mut self) {
        for slot in &self.slots {
            debug_assert!(!slot.in_use, "scratch buffer allocated and never freed");
            if slot.in_use {
                tracing::warn!(target: "shale::core", "scratch buffer leaked at discard");
            }
        }
        self.slots.clear();
        self.slots.shrink_to_fit();
    }

    /// Number of slots currently in the pool.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool holds no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_reuses_slot() {
        let mut pool = ScratchPool::new();
        let h = pool.alloc(128);
        pool.get_mut(h).extend_from_slice(b"abc");
        pool.free(h);

        let h2 = pool.alloc(64);
        assert_eq!(pool.len(), 1, "freed slot should be reused");
        assert!(pool.get(h2).is_empty(), "reused buffer must be cleared");
        pool.free(h2);
    }

    #[test]
    fn test_concurrent_checkouts_get_distinct_slots() {
        let mut pool = ScratchPool::new();
        let a = pool.alloc(16);
        let b = pool.alloc(16);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        pool.get_mut(a).push(1);
        pool.get_mut(b).push(2);
        assert_eq!(pool.get(a), &vec![1]);
        assert_eq!(pool.get(b), &vec![2]);
        pool.free(a);
        pool.free(b);
    }

    #[test]
    fn test_smallest_sufficient_buffer_wins() {
        let mut pool = ScratchPool::new();
        let big = pool.alloc(4096);
        let small = pool.alloc(8);
        pool.free(big);
        pool.free(small);

        // A tiny request should land on the small slot, not the big one.
        let h = pool.alloc(4);
        assert!(pool.get(h).capacity() < 4096);
        pool.free(h);
    }

    #[test]
    fn test_grow_largest_when_none_fit() {
        let mut pool = ScratchPool::new();
        let a = pool.alloc(8);
        let b = pool.alloc(64);
        pool.free(a);
        pool.free(b);

        // Neither slot fits; the larger one is grown rather than adding
        // a third slot.
        let h = pool.alloc(1024);
        assert_eq!(pool.len(), 2);
        assert!(pool.get(h).capacity() >= 1024);
        pool.free(h);
    }

    #[test]
    fn test_discard_releases_everything() {
        let mut pool = ScratchPool::new();
        let h = pool.alloc(32);
        pool.free(h);
        pool.discard();
        assert!(pool.is_empty());
    }
}
