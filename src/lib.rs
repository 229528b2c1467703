//! gpupool - GPU buffer allocator and cache for unified-memory devices
//!
//! Hands out GPU-visible buffers to a tensor-computation runtime with far
//! better latency and fragmentation behavior than direct driver calls:
//! freed buffers are retained in a size-indexed LRU cache and reused for
//! similarly sized requests, small buffers are carved from a shared heap,
//! and hot buffers are kept wired through a residency set so the GPU
//! never stalls on first-touch faults.
//!
//! The typical entry points are the process-wide [`memory::allocator`]
//! instance and the free functions next to it; embedders with their own
//! device wire a [`GpuDriver`] implementation into a [`GpuAllocator`] of
//! their own.

pub mod backend;
pub mod error;
pub mod logging;
pub mod memory;

pub use backend::{DeviceInfo, GpuDriver, HostDriver, PoolFrame, ResidencySet};
pub use error::{ErrorCategory, GpuPoolError, PoolResult};
pub use memory::{allocator, AllocatorConfig, GpuAllocator, GpuBuffer, MemorySnapshot};
