//! End-to-end allocation scenarios against a recording driver

mod common;

use std::sync::Arc;

use common::{test_device_info, DriverEvent, RecordingDriver};
use gpupool::backend::page_size;
use gpupool::{AllocatorConfig, GpuAllocator, GpuBuffer, GpuPoolError};

/// Allocator with the heap disabled, so every buffer is a direct driver
/// allocation the recording driver sees as `NewBuffer`
fn direct_only(driver: Arc<RecordingDriver>) -> GpuAllocator {
    GpuAllocator::with_config(
        driver,
        AllocatorConfig::new().with_heap_size(0).with_small_size(0),
    )
}

#[test]
fn exact_reuse_hits_the_driver_once() {
    let driver = RecordingDriver::new();
    let alloc = direct_only(Arc::clone(&driver));

    let first = alloc.allocate(4096).expect("allocate failed");
    let first_id = first.id().expect("non-null");
    alloc.free(first);

    let second = alloc.allocate(4096).expect("allocate failed");
    assert_eq!(
        second.id().expect("non-null"),
        first_id,
        "second allocation should reuse the same underlying buffer"
    );
    assert_eq!(driver.new_buffer_count(), 1);
    alloc.free(second);
}

#[test]
fn reuse_within_slack_window() {
    let driver = RecordingDriver::new();
    let alloc = direct_only(Arc::clone(&driver));

    let buf = alloc.allocate(8192).expect("allocate failed");
    let id = buf.id().expect("non-null");
    alloc.free(buf);

    // 5000 rounds to 8192 and hits the cached buffer exactly
    let buf = alloc.allocate(5000).expect("allocate failed");
    assert_eq!(buf.id().expect("non-null"), id);
    assert_eq!(driver.new_buffer_count(), 1);
    alloc.free(buf);
}

#[test]
fn oversized_cached_buffer_is_not_reused() {
    let driver = RecordingDriver::new();
    let alloc = direct_only(Arc::clone(&driver));

    let big = alloc.allocate(16384).expect("allocate failed");
    alloc.free(big);

    // A 16384-byte buffer is outside the slack ceiling of a 2000-byte
    // request (which stays unrounded, below one page)
    let small = alloc.allocate(2000).expect("allocate failed");
    assert!(!small.heap_backed());
    assert_eq!(driver.new_buffer_count(), 2, "expected a fresh allocation");
    assert_eq!(alloc.cache_memory(), 16384, "big buffer must stay cached");
    alloc.free(small);
}

#[test]
fn every_cache_hit_is_within_the_reuse_bound() {
    let driver = RecordingDriver::new();
    let alloc = direct_only(Arc::clone(&driver));
    let page = page_size();

    let sizes = [1024usize, 4096, 12288, 32768, 65536, 262144];
    let bufs: Vec<GpuBuffer> = sizes
        .iter()
        .map(|&s| alloc.allocate(s).expect("allocate failed"))
        .collect();
    for buf in bufs {
        alloc.free(buf);
    }

    for request in [800usize, 3000, 11000, 30000, 70000, 250000] {
        let buf = alloc.allocate(request).expect("allocate failed");
        let rounded = if request > page {
            page * ((request + page - 1) / page)
        } else {
            request
        };
        let ceiling = (2 * rounded).min(rounded + 2 * page);
        assert!(buf.len() >= rounded);
        assert!(
            buf.len() < ceiling,
            "request {} got {} (ceiling {})",
            request,
            buf.len(),
            ceiling
        );
        alloc.free(buf);
    }
}

#[test]
fn gc_pressure_evicts_before_the_driver_allocation() {
    let driver = RecordingDriver::with_info(common::low_memory_device_info());
    let alloc = direct_only(Arc::clone(&driver));

    // Park ~30 MiB in the cache with 4 MiB still active
    let bufs: Vec<GpuBuffer> = (0..15)
        .map(|_| alloc.allocate(2 << 20).expect("allocate failed"))
        .collect();
    for buf in bufs {
        alloc.free(buf);
    }
    let active = alloc.allocate(4 << 20).expect("allocate failed");
    let cache_before = alloc.cache_memory();

    // active + cache + request crosses the gc threshold (38 MiB)
    let big = alloc.allocate(16 << 20).expect("allocate failed");
    assert!(!big.is_null());
    assert!(alloc.cache_memory() < cache_before);

    // The eviction releases must appear before the final NewBuffer
    let events = driver.events();
    let last_new = events
        .iter()
        .rposition(|e| matches!(e, DriverEvent::NewBuffer { .. }))
        .expect("big allocation missing");
    let first_release = events
        .iter()
        .position(|e| matches!(e, DriverEvent::Release { .. }))
        .expect("no evictions recorded");
    assert!(
        first_release < last_new,
        "eviction must run before the driver allocation"
    );

    alloc.free(active);
    alloc.free(big);
}

#[test]
fn resource_limit_backpressure_with_empty_cache() {
    let driver = RecordingDriver::with_info(gpupool::DeviceInfo {
        resource_limit: 2,
        ..test_device_info()
    });
    let alloc = direct_only(Arc::clone(&driver));

    let a = alloc.allocate(4096).expect("allocate failed");
    let b = alloc.allocate(4096).expect("allocate failed");

    let err = alloc.allocate(4096).expect_err("expected backpressure");
    assert!(matches!(err, GpuPoolError::ResourceLimitExceeded(2)));

    alloc.free(a);
    alloc.free(b);
}

#[test]
fn all_releases_happen_inside_a_pool_frame() {
    let driver = RecordingDriver::new();
    let alloc = direct_only(Arc::clone(&driver));

    // Drive all three release paths: retire on free (cache limit 0),
    // cache trim, and clear_cache
    alloc.set_cache_limit(0);
    let buf = alloc.allocate(8192).expect("allocate failed");
    alloc.free(buf);

    alloc.set_cache_limit(usize::MAX);
    let bufs: Vec<GpuBuffer> = (0..4)
        .map(|_| alloc.allocate(8192).expect("allocate failed"))
        .collect();
    for buf in bufs {
        alloc.free(buf);
    }
    alloc.clear_cache();

    let events = driver.events();
    let releases: Vec<&DriverEvent> = events
        .iter()
        .filter(|e| matches!(e, DriverEvent::Release { .. }))
        .collect();
    assert_eq!(releases.len(), 5);
    for event in releases {
        assert!(
            matches!(event, DriverEvent::Release { in_pool_frame: true, .. }),
            "release outside a pool frame: {:?}",
            event
        );
    }
}

#[test]
fn null_handles_round_trip_through_free() {
    let driver = RecordingDriver::new();
    let alloc = direct_only(Arc::clone(&driver));

    let buf = alloc.allocate(0).expect("allocate failed");
    assert!(buf.is_null());
    alloc.free(buf);
    alloc.free(GpuBuffer::null());

    assert_eq!(alloc.active_memory(), 0);
    assert_eq!(driver.new_buffer_count(), 0);
    assert_eq!(driver.release_count(), 0);
}

#[test]
fn null_handle_promotes_to_allocation_failed() {
    let err = GpuBuffer::null().non_null().expect_err("null must fail");
    assert!(matches!(err, GpuPoolError::AllocationFailed(_)));
}

#[test]
fn buffer_contents_are_cpu_visible_through_the_allocator() {
    let driver = RecordingDriver::new();
    let alloc = direct_only(Arc::clone(&driver));

    let buf = alloc.allocate(4096).expect("allocate failed");
    let ptr = buf.raw_ptr();
    assert!(!ptr.is_null());

    // SAFETY: freshly allocated 4096-byte buffer, exclusively owned here
    unsafe {
        std::ptr::write_bytes(ptr, 0x5A, buf.len());
        assert_eq!(*ptr, 0x5A);
        assert_eq!(*ptr.add(buf.len() - 1), 0x5A);
    }
    alloc.free(buf);
}

#[test]
fn no_driver_leak_after_full_lifecycle() {
    let driver = RecordingDriver::new();
    {
        let alloc = direct_only(Arc::clone(&driver));
        let bufs: Vec<GpuBuffer> = (0..8)
            .map(|i| alloc.allocate(4096 * (i + 1)).expect("allocate failed"))
            .collect();
        for buf in bufs {
            alloc.free(buf);
        }
        alloc.clear_cache();
        assert_eq!(driver.live_buffer_count(), 0);
    }
    assert_eq!(driver.live_buffer_count(), 0);
}
