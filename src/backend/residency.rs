//! Residency tracking for wired GPU buffers
//!
//! The driver keeps every member of the residency set wired in physical
//! memory, exempt from paging, so the GPU never takes a first-touch fault
//! on a hot buffer. The set has a byte capacity: members that do not fit
//! are kept as pending and promoted when room appears. Only the allocator
//! mutates the set; the native device layer batches the actual wiring.
//!
//! Direct buffers are tracked individually. Heap sub-allocations are
//! covered by the heap's own entry and never appear here themselves.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::backend::device::{RawBuffer, RawHeap};

#[derive(Debug)]
struct ResidencyState {
    /// Members currently wired, id -> bytes
    wired: HashMap<u64, usize>,
    /// Members waiting for capacity, id -> bytes
    pending: HashMap<u64, usize>,
    wired_bytes: usize,
    capacity: usize,
}

/// Set of driver allocations kept resident in physical memory
#[derive(Debug)]
pub struct ResidencySet {
    state: Mutex<ResidencyState>,
}

impl ResidencySet {
    /// Create an empty set with unlimited capacity; the capacity is
    /// narrowed later through [`ResidencySet::resize`] when a wired limit
    /// is configured
    pub fn new() -> Self {
        ResidencySet {
            state: Mutex::new(ResidencyState {
                wired: HashMap::new(),
                pending: HashMap::new(),
                wired_bytes: 0,
                capacity: usize::MAX,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResidencyState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Track a direct buffer
    pub fn insert(&self, buf: &RawBuffer) {
        self.insert_raw(buf.id(), buf.len());
    }

    /// Track a heap; covers every buffer sub-allocated from it
    pub fn insert_heap(&self, heap: &RawHeap) {
        self.insert_raw(heap.id(), heap.len());
    }

    fn insert_raw(&self, id: u64, len: usize) {
        let mut state = self.lock();
        if state.wired.contains_key(&id) || state.pending.contains_key(&id) {
            tracing::warn!(id, "allocation already in residency set");
            return;
        }
        if state.wired_bytes + len <= state.capacity {
            state.wired.insert(id, len);
            state.wired_bytes += len;
        } else {
            state.pending.insert(id, len);
        }
    }

    /// Stop tracking a direct buffer
    pub fn erase(&self, buf: &RawBuffer) {
        let mut state = self.lock();
        if let Some(len) = state.wired.remove(&buf.id()) {
            state.wired_bytes -= len;
            promote(&mut state);
        } else if state.pending.remove(&buf.id()).is_none() {
            tracing::warn!(id = buf.id(), "erasing allocation not in residency set");
        }
    }

    /// Adjust the byte capacity, demoting or promoting members to match
    pub fn resize(&self, capacity: usize) {
        let mut state = self.lock();
        tracing::debug!(
            capacity,
            wired_bytes = state.wired_bytes,
            "resizing residency set"
        );
        state.capacity = capacity;
        if state.wired_bytes > capacity {
            demote(&mut state);
        } else {
            promote(&mut state);
        }
    }

    /// Whether the given allocation id is tracked (wired or pending)
    pub fn contains(&self, id: u64) -> bool {
        let state = self.lock();
        state.wired.contains_key(&id) || state.pending.contains_key(&id)
    }

    /// Number of tracked allocations
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.wired.len() + state.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently wired
    pub fn wired_bytes(&self) -> usize {
        self.lock().wired_bytes
    }

    /// Current byte capacity
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }
}

impl Default for ResidencySet {
    fn default() -> Self {
        Self::new()
    }
}

/// Move pending members into the wired set while they fit
fn promote(state: &mut ResidencyState) {
    if state.pending.is_empty() {
        return;
    }
    let candidates: Vec<(u64, usize)> = state.pending.iter().map(|(&id, &len)| (id, len)).collect();
    for (id, len) in candidates {
        if state.wired_bytes + len > state.capacity {
            continue;
        }
        state.pending.remove(&id);
        state.wired.insert(id, len);
        state.wired_bytes += len;
    }
}

/// Move wired members out until the wired total fits the capacity
fn demote(state: &mut ResidencyState) {
    while state.wired_bytes > state.capacity {
        let Some(&id) = state.wired.keys().next() else {
            break;
        };
        let len = state.wired.remove(&id).unwrap_or(0);
        state.wired_bytes -= len;
        state.pending.insert(id, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(id: u64, len: usize) -> RawBuffer {
        RawBuffer::new(id, std::ptr::null_mut(), len, None)
    }

    #[test]
    fn test_insert_erase_membership() {
        let set = ResidencySet::new();
        let a = buf(1, 4096);
        let b = buf(2, 8192);

        set.insert(&a);
        set.insert(&b);
        assert!(set.contains(1));
        assert!(set.contains(2));
        assert_eq!(set.len(), 2);
        assert_eq!(set.wired_bytes(), 12288);

        set.erase(&a);
        assert!(!set.contains(1));
        assert_eq!(set.len(), 1);
        assert_eq!(set.wired_bytes(), 8192);
    }

    #[test]
    fn test_duplicate_insert_is_ignored() {
        let set = ResidencySet::new();
        let a = buf(1, 4096);
        set.insert(&a);
        set.insert(&a);
        assert_eq!(set.len(), 1);
        assert_eq!(set.wired_bytes(), 4096);
    }

    #[test]
    fn test_capacity_parks_overflow_as_pending() {
        let set = ResidencySet::new();
        set.resize(10000);

        set.insert(&buf(1, 8192));
        set.insert(&buf(2, 8192));

        // Second buffer does not fit but stays tracked
        assert_eq!(set.len(), 2);
        assert_eq!(set.wired_bytes(), 8192);

        // Erasing the wired member promotes the pending one
        set.erase(&buf(1, 8192));
        assert_eq!(set.wired_bytes(), 8192);
        assert!(set.contains(2));
    }

    #[test]
    fn test_resize_demotes_and_promotes() {
        let set = ResidencySet::new();
        set.insert(&buf(1, 4096));
        set.insert(&buf(2, 4096));
        assert_eq!(set.wired_bytes(), 8192);

        set.resize(4096);
        assert_eq!(set.wired_bytes(), 4096);
        assert_eq!(set.len(), 2);

        set.resize(16384);
        assert_eq!(set.wired_bytes(), 8192);
    }

    #[test]
    fn test_heap_entry_covers_heap() {
        let set = ResidencySet::new();
        let heap = RawHeap::new(10, 1 << 20);
        set.insert_heap(&heap);
        assert!(set.contains(10));
        assert_eq!(set.wired_bytes(), 1 << 20);
    }
}
