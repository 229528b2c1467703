//! Host-memory reference driver
//!
//! Implements [`GpuDriver`] with page-aligned host allocations, giving the
//! allocator a complete unified-memory device on any machine: contents
//! pointers are genuinely CPU-visible and the heap is a single
//! pre-allocated block subdivided internally. Native device layers
//! implement the same trait out of tree.
//!
//! The heap sub-allocator keeps its free space as an offset-keyed span
//! map. Reservations are rounded up to a fixed grain, so every span
//! starts grain-aligned by construction, and a released span merges with
//! its neighbors through two map lookups. Repeated small allocations
//! never touch the base allocator.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::backend::device::{page_size, DeviceInfo, GpuDriver, RawBuffer, RawHeap, ResourceOptions};
use crate::backend::pool_frame::PoolFrame;

/// Sub-allocation grain. Reserved lengths are multiples of this, which
/// keeps every free-span offset aligned without any padding bookkeeping.
const SUB_ALLOC_GRAIN: usize = 256;

#[derive(Debug)]
struct StandaloneAlloc {
    ptr: *mut u8,
    layout: Layout,
}

#[derive(Debug)]
struct HeapArena {
    base: *mut u8,
    layout: Layout,
    /// Free space, span start offset -> span length. Adjacent spans are
    /// merged on release, so entries never abut.
    spans: BTreeMap<usize, usize>,
    /// Live sub-allocations, buffer id -> (offset, reserved length)
    live: HashMap<u64, (usize, usize)>,
}

impl HeapArena {
    /// Reserve room for `size` bytes: the smallest free span that fits
    /// the grain-rounded request wins, and whatever is left of it stays
    /// free. Returns the offset, or `None` when no span is large enough.
    fn carve(&mut self, id: u64, size: usize) -> Option<usize> {
        let need = size.next_multiple_of(SUB_ALLOC_GRAIN);
        let (&offset, &span) = self
            .spans
            .iter()
            .filter(|&(_, &len)| len >= need)
            .min_by_key(|&(_, &len)| len)?;
        self.spans.remove(&offset);
        if span > need {
            self.spans.insert(offset + need, span - need);
        }
        self.live.insert(id, (offset, need));
        Some(offset)
    }

    /// Return a sub-allocation's span to the free map, merging with the
    /// span ending at its start and the span starting at its end
    fn reclaim(&mut self, id: u64) -> bool {
        let Some((mut offset, mut len)) = self.live.remove(&id) else {
            return false;
        };
        if let Some((&prev_offset, &prev_len)) = self.spans.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                self.spans.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.spans.remove(&(offset + len)) {
            len += next_len;
        }
        self.spans.insert(offset, len);
        true
    }
}

#[derive(Debug, Default)]
struct DriverState {
    buffers: HashMap<u64, StandaloneAlloc>,
    heaps: HashMap<u64, HeapArena>,
}

/// Unified-memory driver backed by host allocations
#[derive(Debug)]
pub struct HostDriver {
    info: DeviceInfo,
    max_buffer_length: usize,
    next_id: AtomicU64,
    state: Mutex<DriverState>,
}

// SAFETY: the raw pointers inside DriverState are only created and
// destroyed under the state mutex; contents access goes through RawBuffer
// handles whose synchronization is the runtime's responsibility.
unsafe impl Send for HostDriver {}
unsafe impl Sync for HostDriver {}

impl HostDriver {
    /// Default total memory reported when none is configured (16 GiB)
    pub const DEFAULT_MEMORY_SIZE: usize = 16 * (1 << 30);

    /// Create a driver with default device properties
    pub fn new() -> Self {
        Self::with_info(DeviceInfo {
            device_name: "host unified-memory device".to_string(),
            memory_size: Self::DEFAULT_MEMORY_SIZE,
            // Match the usual driver recommendation of ~3/4 of total
            max_recommended_working_set_size: Self::DEFAULT_MEMORY_SIZE / 4 * 3,
            resource_limit: 499_000,
        })
    }

    /// Create a driver with explicit device properties
    pub fn with_info(info: DeviceInfo) -> Self {
        let max_buffer_length = info.memory_size / 2;
        tracing::info!(
            device = %info.device_name,
            memory_size = info.memory_size,
            "host driver created"
        );
        HostDriver {
            info,
            max_buffer_length,
            next_id: AtomicU64::new(1),
            state: Mutex::new(DriverState::default()),
        }
    }

    /// Override the maximum single-buffer length
    pub fn with_max_buffer_length(mut self, max: usize) -> Self {
        self.max_buffer_length = max;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DriverState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of standalone buffers currently live, for leak checks
    pub fn live_buffer_count(&self) -> usize {
        let state = self.lock();
        state.buffers.len() + state.heaps.values().map(|h| h.live.len()).sum::<usize>()
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDriver for HostDriver {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn max_buffer_length(&self) -> usize {
        self.max_buffer_length
    }

    fn new_buffer(&self, size: usize, _options: ResourceOptions) -> Option<RawBuffer> {
        // The driver rejects empty buffers; the allocator never asks
        if size == 0 || size > self.max_buffer_length {
            return None;
        }
        let layout = Layout::from_size_align(size, page_size()).ok()?;
        // SAFETY: layout has non-zero size and power-of-two alignment
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            tracing::warn!(size, "host allocation refused");
            return None;
        }
        let id = self.next_id();
        self.lock().buffers.insert(id, StandaloneAlloc { ptr, layout });
        tracing::trace!(id, size, "buffer created");
        Some(RawBuffer::new(id, ptr, size, None))
    }

    fn new_heap(&self, size: usize, _options: ResourceOptions) -> Option<RawHeap> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, page_size()).ok()?;
        // SAFETY: layout has non-zero size and power-of-two alignment
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            tracing::warn!(size, "heap allocation refused");
            return None;
        }
        let id = self.next_id();
        self.lock().heaps.insert(
            id,
            HeapArena {
                base,
                layout,
                spans: BTreeMap::from([(0, size)]),
                live: HashMap::new(),
            },
        );
        tracing::info!(id, size, "heap created");
        Some(RawHeap::new(id, size))
    }

    fn heap_new_buffer(
        &self,
        heap: &RawHeap,
        size: usize,
        _options: ResourceOptions,
    ) -> Option<RawBuffer> {
        if size == 0 {
            return None;
        }
        let id = self.next_id();
        let mut state = self.lock();
        let arena = state.heaps.get_mut(&heap.id())?;
        let Some(offset) = arena.carve(id, size) else {
            // Exhausted; the caller falls back to a standalone buffer
            tracing::trace!(heap = heap.id(), size, "heap exhausted");
            return None;
        };
        // SAFETY: carve returned a region inside the heap allocation
        let ptr = unsafe { arena.base.add(offset) };
        tracing::trace!(id, size, offset, "heap buffer carved");
        Some(RawBuffer::new(id, ptr, size, Some(heap.id())))
    }

    fn release_buffer(&self, buf: RawBuffer) {
        debug_assert!(
            PoolFrame::active(),
            "driver buffer release outside a pool frame"
        );
        let mut state = self.lock();
        if let Some(heap_id) = buf.heap_id() {
            let reclaimed = state
                .heaps
                .get_mut(&heap_id)
                .map(|arena| arena.reclaim(buf.id()))
                .unwrap_or(false);
            if !reclaimed {
                debug_assert!(false, "releasing unknown heap buffer {}", buf.id());
                tracing::error!(id = buf.id(), heap = heap_id, "unknown heap buffer release");
            }
            return;
        }
        match state.buffers.remove(&buf.id()) {
            Some(entry) => {
                // SAFETY: ptr/layout pair came from alloc in new_buffer and
                // is removed from the registry exactly once
                unsafe { dealloc(entry.ptr, entry.layout) };
                tracing::trace!(id = buf.id(), "buffer released");
            }
            None => {
                debug_assert!(false, "releasing unknown buffer {}", buf.id());
                tracing::error!(id = buf.id(), "unknown buffer release");
            }
        }
    }

    fn release_heap(&self, heap: RawHeap) {
        debug_assert!(
            PoolFrame::active(),
            "driver heap release outside a pool frame"
        );
        let mut state = self.lock();
        match state.heaps.remove(&heap.id()) {
            Some(arena) => {
                debug_assert!(
                    arena.live.is_empty(),
                    "releasing heap {} with {} live sub-allocations",
                    heap.id(),
                    arena.live.len()
                );
                // SAFETY: base/layout pair came from alloc in new_heap and
                // is removed from the registry exactly once
                unsafe { dealloc(arena.base, arena.layout) };
                tracing::debug!(id = heap.id(), "heap released");
            }
            None => {
                debug_assert!(false, "releasing unknown heap {}", heap.id());
                tracing::error!(id = heap.id(), "unknown heap release");
            }
        }
    }
}
