//! GPU driver contract consumed by the allocator
//!
//! The allocator core is device-agnostic: everything it needs from the
//! native driver is expressed by the [`GpuDriver`] trait and the plain
//! handle types below. The in-tree [`crate::backend::HostDriver`] services
//! the contract with page-aligned host memory; a native unified-memory
//! device implements the same trait out of tree.

use std::fmt::Debug;

use once_cell::sync::OnceCell;

/// Device properties the allocator derives its budgets from
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Marketing name reported by the driver
    pub device_name: String,
    /// Total unified memory in bytes
    pub memory_size: usize,
    /// Driver-recommended ceiling for the working set, in bytes
    pub max_recommended_working_set_size: usize,
    /// Maximum number of distinct driver resources (buffers, heaps)
    pub resource_limit: usize,
}

/// Resource options for buffer and heap creation
///
/// Modeled as a small bitset so driver implementations can translate the
/// bits to their native equivalents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceOptions(u32);

impl ResourceOptions {
    /// CPU-visible storage in unified memory
    pub const STORAGE_MODE_SHARED: ResourceOptions = ResourceOptions(1 << 0);
    /// The runtime tracks hazards itself through its compute-graph
    /// scheduler; the driver must not insert its own barriers
    pub const HAZARD_TRACKING_UNTRACKED: ResourceOptions = ResourceOptions(1 << 1);

    /// The option set used for every allocation this crate performs
    pub const fn shared_untracked() -> Self {
        ResourceOptions(Self::STORAGE_MODE_SHARED.0 | Self::HAZARD_TRACKING_UNTRACKED.0)
    }

    pub const fn contains(self, other: ResourceOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for ResourceOptions {
    type Output = ResourceOptions;

    fn bitor(self, rhs: ResourceOptions) -> ResourceOptions {
        ResourceOptions(self.0 | rhs.0)
    }
}

// SAFETY: RawBuffer is a passive handle; the pointer targets unified
// memory whose synchronization is managed by the runtime's scheduler, and
// driver release goes through an explicit GpuDriver call, never Drop.
unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

/// Plain driver buffer handle
///
/// Carries no ownership semantics of its own: creation and release are
/// explicit [`GpuDriver`] calls. The allocator is the only component that
/// balances them.
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer {
    id: u64,
    ptr: *mut u8,
    len: usize,
    heap: Option<u64>,
}

impl RawBuffer {
    /// Assemble a handle; driver implementations only
    pub fn new(id: u64, ptr: *mut u8, len: usize, heap: Option<u64>) -> Self {
        RawBuffer { id, ptr, len, heap }
    }

    /// Driver-assigned identity, unique for the driver's lifetime
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Byte length of the buffer
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CPU-visible contents pointer (unified memory)
    pub fn host_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Whether this buffer was carved from the shared heap
    ///
    /// Heap-backed buffers are residency-covered by the heap's own entry
    /// and are never inserted into the residency set individually.
    pub fn heap_backed(&self) -> bool {
        self.heap.is_some()
    }

    /// Identity of the owning heap, if sub-allocated
    pub fn heap_id(&self) -> Option<u64> {
        self.heap
    }
}

/// Plain driver heap handle
#[derive(Debug, Clone, Copy)]
pub struct RawHeap {
    id: u64,
    len: usize,
}

impl RawHeap {
    pub fn new(id: u64, len: usize) -> Self {
        RawHeap { id, len }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Total capacity of the heap in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Contract the allocator consumes from the GPU driver
///
/// All methods may be called from any thread. `new_buffer` and
/// `release_buffer` can take driver-internal locks and unbounded time;
/// the allocator guarantees it never calls them while holding its own
/// mutex, and always inside a [`crate::backend::PoolFrame`].
pub trait GpuDriver: Send + Sync + Debug {
    /// Device properties
    fn info(&self) -> &DeviceInfo;

    /// Largest single buffer the driver will create, in bytes
    fn max_buffer_length(&self) -> usize;

    /// Allocate a standalone buffer; `None` when the driver refuses
    fn new_buffer(&self, size: usize, options: ResourceOptions) -> Option<RawBuffer>;

    /// Create a heap for cheap sub-allocation of small buffers
    fn new_heap(&self, size: usize, options: ResourceOptions) -> Option<RawHeap>;

    /// Carve a buffer out of `heap`; `None` when the heap is exhausted
    /// (the caller falls back to `new_buffer`)
    fn heap_new_buffer(
        &self,
        heap: &RawHeap,
        size: usize,
        options: ResourceOptions,
    ) -> Option<RawBuffer>;

    /// Release one buffer back to the driver
    fn release_buffer(&self, buf: RawBuffer);

    /// Release a heap; all sub-allocations must have been released first
    fn release_heap(&self, heap: RawHeap);
}

/// The OS virtual-memory page size, used as the alignment quantum for
/// allocation rounding and the reuse slack window
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceCell<usize> = OnceCell::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if sz > 0 {
                return sz as usize;
            }
        }
        4096
    })
}
