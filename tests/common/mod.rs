#![allow(dead_code)]

//! Common test utilities
//!
//! Provides a recording driver that layers an event log over the host
//! reference driver, so tests can assert how often and in what order the
//! allocator actually talks to the driver, and whether releases happen
//! inside a pool frame.

use std::fmt;
use std::sync::{Arc, Mutex};

use gpupool::backend::{
    DeviceInfo, GpuDriver, HostDriver, PoolFrame, RawBuffer, RawHeap, ResourceOptions,
};

pub use serial_test::serial;

/// One observed driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    NewBuffer { id: u64, size: usize },
    HeapBuffer { id: u64, size: usize },
    Release { id: u64, in_pool_frame: bool },
}

type ReleaseHook = Box<dyn Fn(u64) + Send + Sync>;

/// Driver wrapper that records every buffer-affecting call
pub struct RecordingDriver {
    inner: HostDriver,
    events: Mutex<Vec<DriverEvent>>,
    release_hook: Mutex<Option<ReleaseHook>>,
}

impl fmt::Debug for RecordingDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingDriver")
            .field("inner", &self.inner)
            .finish()
    }
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Self::with_info(test_device_info())
    }

    pub fn with_info(info: DeviceInfo) -> Arc<Self> {
        Arc::new(RecordingDriver {
            inner: HostDriver::with_info(info),
            events: Mutex::new(Vec::new()),
            release_hook: Mutex::new(None),
        })
    }

    pub fn events(&self) -> Vec<DriverEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn new_buffer_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, DriverEvent::NewBuffer { .. }))
            .count()
    }

    pub fn release_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, DriverEvent::Release { .. }))
            .count()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.inner.live_buffer_count()
    }

    /// Install a callback invoked on every buffer release, before the
    /// underlying driver runs. A hook that re-enters the allocator will
    /// deadlock if the allocator still holds its mutex, which is exactly
    /// what the lock-discipline tests rely on.
    pub fn set_release_hook(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.release_hook.lock().expect("hook lock") = Some(Box::new(hook));
    }

    pub fn clear_release_hook(&self) {
        *self.release_hook.lock().expect("hook lock") = None;
    }

    fn record(&self, event: DriverEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

impl GpuDriver for RecordingDriver {
    fn info(&self) -> &DeviceInfo {
        self.inner.info()
    }

    fn max_buffer_length(&self) -> usize {
        self.inner.max_buffer_length()
    }

    fn new_buffer(&self, size: usize, options: ResourceOptions) -> Option<RawBuffer> {
        let buf = self.inner.new_buffer(size, options)?;
        self.record(DriverEvent::NewBuffer { id: buf.id(), size });
        Some(buf)
    }

    fn new_heap(&self, size: usize, options: ResourceOptions) -> Option<RawHeap> {
        self.inner.new_heap(size, options)
    }

    fn heap_new_buffer(
        &self,
        heap: &RawHeap,
        size: usize,
        options: ResourceOptions,
    ) -> Option<RawBuffer> {
        let buf = self.inner.heap_new_buffer(heap, size, options)?;
        self.record(DriverEvent::HeapBuffer { id: buf.id(), size });
        Some(buf)
    }

    fn release_buffer(&self, buf: RawBuffer) {
        self.record(DriverEvent::Release {
            id: buf.id(),
            in_pool_frame: PoolFrame::active(),
        });
        let hook = self.release_hook.lock().expect("hook lock");
        if let Some(hook) = hook.as_ref() {
            hook(buf.id());
        }
        drop(hook);
        self.inner.release_buffer(buf);
    }

    fn release_heap(&self, heap: RawHeap) {
        self.inner.release_heap(heap);
    }
}

/// Device properties shared by the integration tests
pub fn test_device_info() -> DeviceInfo {
    DeviceInfo {
        device_name: "test unified-memory device".to_string(),
        memory_size: 1 << 30,
        max_recommended_working_set_size: 768 << 20,
        resource_limit: 499_000,
    }
}

/// Variant with a small recommended working set, for GC-pressure tests
pub fn low_memory_device_info() -> DeviceInfo {
    DeviceInfo {
        memory_size: 100 << 20,
        max_recommended_working_set_size: 40 << 20,
        ..test_device_info()
    }
}
