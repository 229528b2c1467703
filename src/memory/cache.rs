//! Size-indexed inventory of free GPU buffers
//!
//! Freed buffers are retained here instead of being handed back to the
//! driver; a later allocation of a similar size reuses one instead of
//! paying for a driver call. Reuse is best-fit bounded by a 2x slack
//! ceiling, eviction is LRU from the least recently recycled end.
//!
//! Holders live in an index-addressed arena; the size index and the
//! recency list both store arena indices, so unlinking a holder from one
//! structure never invalidates the other. Eviction detaches holders and
//! returns the buffers to the caller, which releases them through the
//! driver after dropping the allocator lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::device::{page_size, RawBuffer};
use crate::backend::residency::ResidencySet;

/// Size-index key: byte length plus an insertion tiebreaker, which turns
/// the ordered map into a multimap over lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PoolKey {
    len: usize,
    seq: u64,
}

/// One cached buffer plus its links into the recency list
#[derive(Debug)]
struct BufferHolder {
    buf: RawBuffer,
    key: PoolKey,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct BufferCache {
    residency_set: Arc<ResidencySet>,
    /// Holder arena; slots are reused through the free list
    slots: Vec<Option<BufferHolder>>,
    free_slots: Vec<usize>,
    /// Byte length -> holder slot, ordered for best-fit lookup
    pool: BTreeMap<PoolKey, usize>,
    /// Most recently recycled holder
    head: Option<usize>,
    /// Least recently recycled holder
    tail: Option<usize>,
    pool_bytes: usize,
    next_seq: u64,
}

impl BufferCache {
    pub fn new(residency_set: Arc<ResidencySet>) -> Self {
        BufferCache {
            residency_set,
            slots: Vec::new(),
            free_slots: Vec::new(),
            pool: BTreeMap::new(),
            head: None,
            tail: None,
            pool_bytes: 0,
            next_seq: 0,
        }
    }

    /// Total bytes held by the cache
    pub fn pool_bytes(&self) -> usize {
        self.pool_bytes
    }

    /// Number of cached buffers
    pub fn buffer_count(&self) -> usize {
        self.pool.len()
    }

    /// Find the smallest cached buffer with `len >= size` below the slack
    /// ceiling `min(2*size, size + 2*page_size)`, detach it, and return it.
    ///
    /// The ceiling bounds wasted bytes per hit to under 1x the request;
    /// the first in-range index entry is the best fit, and an entry at or
    /// beyond the ceiling means nothing closer exists (duplicate lengths
    /// sort adjacently), so the search never skips to larger sizes.
    pub fn try_reuse(&mut self, size: usize) -> Option<RawBuffer> {
        let ceiling = (2 * size).min(size + 2 * page_size());
        let start = PoolKey { len: size, seq: 0 };
        let (key, idx) = self.pool.range(start..).next().map(|(&k, &v)| (k, v))?;
        if key.len >= ceiling {
            return None;
        }
        self.pool.remove(&key);
        self.remove_from_list(idx);
        let holder = self.free_slot(idx);
        self.pool_bytes -= holder.buf.len();
        tracing::trace!(requested = size, len = holder.buf.len(), "cache hit");
        Some(holder.buf)
    }

    /// Retain a freed buffer for reuse, as the most recent entry
    pub fn recycle(&mut self, buf: RawBuffer) {
        let key = PoolKey {
            len: buf.len(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.pool_bytes += buf.len();
        tracing::trace!(len = buf.len(), "buffer recycled");
        let idx = self.alloc_slot(BufferHolder {
            buf,
            key,
            prev: None,
            next: None,
        });
        self.add_at_head(idx);
        self.pool.insert(key, idx);
    }

    /// Detach least-recently-recycled buffers until at least
    /// `min_bytes_to_free` bytes are off the books, erasing direct buffers
    /// from the residency set along the way.
    ///
    /// Returns the detached buffers; the caller must release them through
    /// the driver with the allocator lock dropped, inside a pool frame.
    /// A request for (almost) everything collapses to [`BufferCache::clear`].
    pub fn evict(&mut self, min_bytes_to_free: usize) -> Vec<RawBuffer> {
        if self.pool_bytes == 0 {
            return Vec::new();
        }
        // 90% of the pool or more: not worth a partial walk
        if min_bytes_to_free >= self.pool_bytes - self.pool_bytes / 10 {
            return self.clear();
        }

        let mut released = Vec::new();
        let mut freed = 0usize;
        while freed < min_bytes_to_free {
            let Some(tail_idx) = self.tail else {
                break;
            };
            let holder = self.detach(tail_idx);
            freed += holder.buf.len();
            if !holder.buf.heap_backed() {
                self.residency_set.erase(&holder.buf);
            }
            released.push(holder.buf);
        }
        self.pool_bytes -= freed;
        tracing::debug!(freed, count = released.len(), "evicted cached buffers");
        released
    }

    /// Detach every cached buffer, oldest first, and reset the cache
    pub fn clear(&mut self) -> Vec<RawBuffer> {
        let mut released = Vec::with_capacity(self.pool.len());
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            let holder = self.free_slot(idx);
            cursor = holder.prev;
            if !holder.buf.heap_backed() {
                self.residency_set.erase(&holder.buf);
            }
            released.push(holder.buf);
        }
        self.pool.clear();
        self.slots.clear();
        self.free_slots.clear();
        self.pool_bytes = 0;
        self.head = None;
        self.tail = None;
        tracing::debug!(count = released.len(), "cache cleared");
        released
    }

    /// Fully detach one holder: size index, recency list, arena slot
    fn detach(&mut self, idx: usize) -> BufferHolder {
        self.remove_from_list(idx);
        let holder = self.free_slot(idx);
        self.pool.remove(&holder.key);
        holder
    }

    fn alloc_slot(&mut self, holder: BufferHolder) -> usize {
        match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx] = Some(holder);
                idx
            }
            None => {
                self.slots.push(Some(holder));
                self.slots.len() - 1
            }
        }
    }

    fn free_slot(&mut self, idx: usize) -> BufferHolder {
        let holder = self.slots[idx].take().expect("holder slot occupied");
        self.free_slots.push(idx);
        holder
    }

    fn holder_mut(&mut self, idx: usize) -> &mut BufferHolder {
        self.slots[idx].as_mut().expect("holder slot occupied")
    }

    fn add_at_head(&mut self, idx: usize) {
        match self.head {
            None => {
                self.head = Some(idx);
                self.tail = Some(idx);
            }
            Some(old_head) => {
                self.holder_mut(old_head).prev = Some(idx);
                self.holder_mut(idx).next = Some(old_head);
                self.head = Some(idx);
            }
        }
    }

    /// Unlink a holder from the recency list, leaving its links cleared so
    /// re-linking is safe. Handles interior, head, tail and sole-element
    /// positions.
    fn remove_from_list(&mut self, idx: usize) {
        let (prev, next) = {
            let holder = self.holder_mut(idx);
            (holder.prev.take(), holder.next.take())
        };
        match (prev, next) {
            (Some(p), Some(n)) => {
                self.holder_mut(p).next = Some(n);
                self.holder_mut(n).prev = Some(p);
            }
            (Some(p), None) if self.tail == Some(idx) => {
                self.holder_mut(p).next = None;
                self.tail = Some(p);
            }
            (None, Some(n)) if self.head == Some(idx) => {
                self.holder_mut(n).prev = None;
                self.head = Some(n);
            }
            (None, None) if self.head == Some(idx) && self.tail == Some(idx) => {
                self.head = None;
                self.tail = None;
            }
            // Already unlinked
            _ => {}
        }
    }
}
