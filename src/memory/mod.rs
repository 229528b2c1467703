//! GPU memory management
//!
//! [`GpuAllocator`] and its size-indexed buffer cache, plus the
//! process-wide instance the rest of the runtime goes through. The free
//! functions below mirror the allocator's operations on that instance.

mod cache;

pub mod allocator;

pub use allocator::{AllocatorConfig, GpuAllocator, GpuBuffer, MemorySnapshot};

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::backend::device::GpuDriver;
use crate::backend::host::HostDriver;
use crate::error::{GpuPoolError, PoolResult};

/// The process-wide allocator, lazily constructed on first use.
///
/// The instance is leaked on purpose: at process exit the GPU driver may
/// already be torn down, and releasing cached buffers against it can
/// crash. The operating system reclaims the address space anyway.
pub fn allocator() -> &'static GpuAllocator {
    static INSTANCE: OnceCell<&'static GpuAllocator> = OnceCell::new();
    INSTANCE.get_or_init(|| {
        let driver: Arc<dyn GpuDriver> = Arc::new(HostDriver::new());
        &*Box::leak(Box::new(GpuAllocator::new(driver)))
    })
}

/// Set the cache byte limit, returning the previous value
pub fn set_cache_limit(limit: usize) -> usize {
    allocator().set_cache_limit(limit)
}

/// Set the committed-memory limit, returning the previous value
pub fn set_memory_limit(limit: usize) -> usize {
    allocator().set_memory_limit(limit)
}

/// The committed-memory limit
pub fn get_memory_limit() -> usize {
    allocator().memory_limit()
}

/// Set the wired (resident) byte budget, returning the previous value
///
/// Fails with [`GpuPoolError::InvalidArgument`] when the requested limit
/// exceeds the device's recommended working set size.
pub fn set_wired_limit(limit: usize) -> PoolResult<usize> {
    let alloc = allocator();
    let max_rec = alloc.device_info().max_recommended_working_set_size;
    if limit > max_rec {
        return Err(GpuPoolError::InvalidArgument(format!(
            "setting a wired limit of {limit} bytes larger than the maximum \
             working set size of {max_rec} bytes is not allowed"
        )));
    }
    Ok(alloc.set_wired_limit(limit))
}

/// Bytes currently held by callers
pub fn get_active_memory() -> usize {
    allocator().active_memory()
}

/// Historical maximum of active bytes since the last reset
pub fn get_peak_memory() -> usize {
    allocator().peak_memory()
}

/// Forget the historical maximum of active bytes
pub fn reset_peak_memory() {
    allocator().reset_peak_memory()
}

/// Bytes retained in the cache
pub fn get_cache_memory() -> usize {
    allocator().cache_memory()
}

/// Release every cached buffer back to the driver
pub fn clear_cache() {
    allocator().clear_cache()
}
