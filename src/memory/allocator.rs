//! Thread-safe GPU buffer allocator
//!
//! Front door for all GPU memory traffic: enforces the cache, memory and
//! wired byte budgets, arbitrates between cache reuse, heap sub-allocation
//! and direct driver allocation, and keeps the residency set in sync with
//! the set of direct buffers.
//!
//! All allocator state sits behind one mutex. Driver calls that can take
//! unbounded time (`new_buffer`, `release_buffer`) always run with that
//! mutex released, inside a pool frame; eviction therefore detaches
//! buffers under the lock and releases them after dropping it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::backend::device::{page_size, DeviceInfo, GpuDriver, RawBuffer, RawHeap, ResourceOptions};
use crate::backend::pool_frame::PoolFrame;
use crate::backend::residency::ResidencySet;
use crate::error::{GpuPoolError, PoolResult};
use crate::memory::cache::BufferCache;

/// Resource options for every buffer this allocator creates: CPU-visible
/// unified memory, dependency tracking left to the compute-graph scheduler
const BUFFER_OPTIONS: ResourceOptions = ResourceOptions::shared_untracked();

/// Device names carrying this marker run under a hypervisor, where heap
/// sub-allocation misbehaves; such devices get direct allocations only
const PARAVIRTUAL_MARKER: &str = "Paravirtual";

/// Tunables for the allocator's heap sub-allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Requests below this many bytes try the shared heap first
    pub small_size: usize,
    /// Capacity of the shared heap in bytes
    pub heap_size: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            small_size: 2 << 20,
            heap_size: 64 << 20,
        }
    }
}

impl AllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heap sub-allocation threshold
    pub fn with_small_size(mut self, small_size: usize) -> Self {
        self.small_size = small_size;
        self
    }

    /// Set the shared heap capacity
    pub fn with_heap_size(mut self, heap_size: usize) -> Self {
        self.heap_size = heap_size;
        self
    }
}

/// Opaque owner of one GPU buffer
///
/// Obtained from [`GpuAllocator::allocate`] and returned through
/// [`GpuAllocator::free`]. A null handle stands for an empty allocation
/// and round-trips through `free` as a no-op. Dropping a non-null handle
/// without freeing it leaks the buffer: it stays counted as active.
#[derive(Debug, Default)]
pub struct GpuBuffer {
    raw: Option<RawBuffer>,
}

impl GpuBuffer {
    /// The null handle
    pub const fn null() -> Self {
        GpuBuffer { raw: None }
    }

    pub(crate) fn from_raw(raw: RawBuffer) -> Self {
        GpuBuffer { raw: Some(raw) }
    }

    pub(crate) fn into_raw(self) -> Option<RawBuffer> {
        self.raw
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// Byte length; 0 for the null handle
    pub fn len(&self) -> usize {
        self.raw.map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the buffer was sub-allocated from the shared heap
    pub fn heap_backed(&self) -> bool {
        self.raw.is_some_and(|b| b.heap_backed())
    }

    /// CPU-visible contents pointer (unified memory); null for the null
    /// handle
    pub fn raw_ptr(&self) -> *mut u8 {
        self.raw.map_or(std::ptr::null_mut(), |b| b.host_ptr())
    }

    /// Driver identity of the underlying buffer, if any
    pub fn id(&self) -> Option<u64> {
        self.raw.map(|b| b.id())
    }

    /// Promote a null handle into [`GpuPoolError::AllocationFailed`], for
    /// callers that cannot tolerate an empty result
    pub fn non_null(self) -> PoolResult<Self> {
        if self.is_null() {
            Err(GpuPoolError::AllocationFailed(
                "driver returned no buffer".to_string(),
            ))
        } else {
            Ok(self)
        }
    }
}

/// Point-in-time view of the allocator's accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    /// Bytes currently held by callers
    pub active_bytes: usize,
    /// Historical maximum of `active_bytes` since the last reset
    pub peak_bytes: usize,
    /// Bytes retained in the cache
    pub cache_bytes: usize,
    /// Driver resources (buffers) currently alive
    pub resources: usize,
}

#[derive(Debug)]
struct AllocState {
    cache: BufferCache,
    /// Cap on total committed GPU bytes
    block_limit: usize,
    /// Committed-bytes threshold that triggers cache eviction
    gc_limit: usize,
    /// Cap on cached bytes
    max_pool_size: usize,
    /// Residency-set byte budget
    wired_limit: usize,
    active_memory: usize,
    peak_memory: usize,
    num_resources: usize,
}

/// Thread-safe allocator over one GPU device
#[derive(Debug)]
pub struct GpuAllocator {
    driver: Arc<dyn GpuDriver>,
    residency_set: Arc<ResidencySet>,
    heap: Option<RawHeap>,
    small_size: usize,
    resource_limit: usize,
    state: Mutex<AllocState>,
}

impl GpuAllocator {
    /// Create an allocator with default tunables
    pub fn new(driver: Arc<dyn GpuDriver>) -> Self {
        Self::with_config(driver, AllocatorConfig::default())
    }

    /// Create an allocator with explicit tunables
    pub fn with_config(driver: Arc<dyn GpuDriver>, config: AllocatorConfig) -> Self {
        let info = driver.info().clone();
        let memsize = info.memory_size;
        let max_rec = info.max_recommended_working_set_size;
        let block_limit = (1.5 * max_rec as f64).min(0.95 * memsize as f64) as usize;
        let gc_limit = ((0.95 * max_rec as f64) as usize).min(block_limit);

        let residency_set = Arc::new(ResidencySet::new());

        let is_vm = info.device_name.contains(PARAVIRTUAL_MARKER);
        let heap = if is_vm || config.heap_size == 0 {
            if is_vm {
                tracing::info!(device = %info.device_name, "paravirtual device, heap disabled");
            }
            None
        } else {
            let _frame = PoolFrame::new();
            let heap = driver.new_heap(config.heap_size, BUFFER_OPTIONS);
            match &heap {
                Some(heap) => residency_set.insert_heap(heap),
                None => tracing::warn!(
                    heap_size = config.heap_size,
                    "heap creation failed, falling back to direct allocations"
                ),
            }
            heap
        };

        tracing::info!(
            device = %info.device_name,
            block_limit,
            gc_limit,
            resource_limit = info.resource_limit,
            "allocator created"
        );

        GpuAllocator {
            driver,
            residency_set: residency_set.clone(),
            heap,
            small_size: config.small_size,
            resource_limit: info.resource_limit,
            state: Mutex::new(AllocState {
                cache: BufferCache::new(residency_set),
                block_limit,
                gc_limit,
                max_pool_size: block_limit,
                wired_limit: 0,
                active_memory: 0,
                peak_memory: 0,
                num_resources: 0,
            }),
        }
    }

    // State mutations keep the accounting consistent at every step, so a
    // guard recovered from a panicked holder is still sound to use.
    fn lock(&self) -> MutexGuard<'_, AllocState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand detached cache victims back to the driver, off the lock
    fn release_detached(&self, victims: Vec<RawBuffer>) {
        if victims.is_empty() {
            return;
        }
        let _frame = PoolFrame::new();
        for buf in victims {
            self.driver.release_buffer(buf);
        }
    }

    /// Allocate a buffer of at least `size` bytes
    ///
    /// Empty requests yield the null handle. Requests above one page are
    /// rounded up to a page multiple. A driver refusal (out of memory)
    /// also yields the null handle; budget violations are errors.
    pub fn allocate(&self, size: usize) -> PoolResult<GpuBuffer> {
        if size == 0 {
            return Ok(GpuBuffer::null());
        }
        let max_len = self.driver.max_buffer_length();
        if size > max_len {
            return Err(GpuPoolError::OversizedRequest {
                requested: size,
                max: max_len,
            });
        }
        let page = page_size();
        let size = if size > page {
            page * ((size + page - 1) / page)
        } else {
            size
        };

        let mut lk = self.lock();
        let (mut lk, buf) = match lk.cache.try_reuse(size) {
            Some(buf) => (lk, buf),
            None => {
                let mem_required = lk.active_memory + lk.cache.pool_bytes() + size;
                let mut victims = Vec::new();

                // Memory pressure or resource pressure: reclaim from the
                // cache before asking the driver for more
                if mem_required >= lk.gc_limit || lk.num_resources >= self.resource_limit {
                    let target = if mem_required >= lk.gc_limit {
                        mem_required - lk.gc_limit
                    } else {
                        usize::MAX
                    };
                    victims = lk.cache.evict(target);
                    lk.num_resources -= victims.len();
                }

                if lk.num_resources >= self.resource_limit {
                    drop(lk);
                    self.release_detached(victims);
                    return Err(GpuPoolError::ResourceLimitExceeded(self.resource_limit));
                }

                drop(lk);
                let created = {
                    let _frame = PoolFrame::new();
                    for buf in victims {
                        self.driver.release_buffer(buf);
                    }
                    let mut created = None;
                    if size < self.small_size {
                        if let Some(heap) = &self.heap {
                            created = self.driver.heap_new_buffer(heap, size, BUFFER_OPTIONS);
                        }
                    }
                    if created.is_none() {
                        created = self.driver.new_buffer(size, BUFFER_OPTIONS);
                    }
                    created
                };
                let Some(buf) = created else {
                    tracing::warn!(size, "driver refused allocation");
                    return Ok(GpuBuffer::null());
                };

                let mut lk = self.lock();
                lk.num_resources += 1;
                if !buf.heap_backed() {
                    self.residency_set.insert(&buf);
                }
                (lk, buf)
            }
        };

        lk.active_memory += buf.len();
        lk.peak_memory = lk.peak_memory.max(lk.active_memory);

        // Keep the cache below its limit
        let trimmed = if lk.cache.pool_bytes() > lk.max_pool_size {
            let excess = lk.cache.pool_bytes() - lk.max_pool_size;
            let trimmed = lk.cache.evict(excess);
            lk.num_resources -= trimmed.len();
            trimmed
        } else {
            Vec::new()
        };
        drop(lk);
        self.release_detached(trimmed);

        tracing::trace!(size, len = buf.len(), heap = buf.heap_backed(), "allocated");
        Ok(GpuBuffer::from_raw(buf))
    }

    /// Return a buffer; recycled into the cache while it is under its
    /// limit, otherwise retired to the driver
    pub fn free(&self, buffer: GpuBuffer) {
        let Some(buf) = buffer.into_raw() else {
            return;
        };
        let mut lk = self.lock();
        lk.active_memory -= buf.len();
        if lk.cache.pool_bytes() < lk.max_pool_size {
            lk.cache.recycle(buf);
            return;
        }
        lk.num_resources -= 1;
        if !buf.heap_backed() {
            self.residency_set.erase(&buf);
        }
        drop(lk);
        // The driver call runs with the allocator unlocked
        let _frame = PoolFrame::new();
        self.driver.release_buffer(buf);
    }

    /// Set the cache byte limit, returning the previous value. Excess
    /// cached buffers are trimmed by subsequent allocations.
    pub fn set_cache_limit(&self, mut limit: usize) -> usize {
        let mut lk = self.lock();
        std::mem::swap(&mut limit, &mut lk.max_pool_size);
        tracing::debug!(limit = lk.max_pool_size, "cache limit updated");
        limit
    }

    /// Set the committed-memory limit, returning the previous value
    pub fn set_memory_limit(&self, mut limit: usize) -> usize {
        let max_rec = self.driver.info().max_recommended_working_set_size;
        let mut lk = self.lock();
        std::mem::swap(&mut limit, &mut lk.block_limit);
        lk.gc_limit = lk.block_limit.min((0.95 * max_rec as f64) as usize);
        tracing::debug!(
            limit = lk.block_limit,
            gc_limit = lk.gc_limit,
            "memory limit updated"
        );
        limit
    }

    /// Set the wired (resident) byte budget, returning the previous value
    pub fn set_wired_limit(&self, mut limit: usize) -> usize {
        let mut lk = self.lock();
        std::mem::swap(&mut limit, &mut lk.wired_limit);
        let wired = lk.wired_limit;
        self.residency_set.resize(wired);
        limit
    }

    /// Release every cached buffer back to the driver
    pub fn clear_cache(&self) {
        let mut lk = self.lock();
        let victims = lk.cache.clear();
        lk.num_resources -= victims.len();
        drop(lk);
        self.release_detached(victims);
    }

    /// Bytes currently held by callers
    pub fn active_memory(&self) -> usize {
        self.lock().active_memory
    }

    /// Historical maximum of active bytes since the last reset
    pub fn peak_memory(&self) -> usize {
        self.lock().peak_memory
    }

    /// Forget the historical maximum; the next allocation re-establishes
    /// `peak >= active`
    pub fn reset_peak_memory(&self) {
        self.lock().peak_memory = 0;
    }

    /// Bytes retained in the cache
    pub fn cache_memory(&self) -> usize {
        self.lock().cache.pool_bytes()
    }

    /// The committed-memory limit
    pub fn memory_limit(&self) -> usize {
        self.lock().block_limit
    }

    /// The wired byte budget
    pub fn wired_limit(&self) -> usize {
        self.lock().wired_limit
    }

    /// Aggregate accounting view
    pub fn snapshot(&self) -> MemorySnapshot {
        let lk = self.lock();
        MemorySnapshot {
            active_bytes: lk.active_memory,
            peak_bytes: lk.peak_memory,
            cache_bytes: lk.cache.pool_bytes(),
            resources: lk.num_resources,
        }
    }

    /// Properties of the underlying device
    pub fn device_info(&self) -> &DeviceInfo {
        self.driver.info()
    }

    /// The residency set this allocator maintains
    pub fn residency_set(&self) -> &ResidencySet {
        &self.residency_set
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        // Only short-lived allocators get here; the process-global
        // instance is leaked so cached buffers never touch a driver that
        // may already be gone at exit
        let victims = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cache
            .clear();
        let _frame = PoolFrame::new();
        for buf in victims {
            self.driver.release_buffer(buf);
        }
        if let Some(heap) = self.heap.take() {
            self.driver.release_heap(heap);
        }
    }
}
