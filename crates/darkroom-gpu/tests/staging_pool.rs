//! Staging buffer pool behavior on the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use darkroom_gpu::backend::{BufferDesc, BufferKind, CpuBuffer, GpuPrimitives, PollMode};
use darkroom_gpu::{CpuPrimitives, StagingBufferPool};

const SIZE: u64 = 64;

fn source(device: &CpuPrimitives) -> CpuBuffer {
    device
        .create_buffer(&BufferDesc {
            label: "source",
            size: SIZE,
            kind: BufferKind::Counters,
        })
        .unwrap()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce(Vec<u8>) + Send>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let make = move || {
        let c = c.clone();
        Box::new(move |_bytes: Vec<u8>| {
            c.fetch_add(1, Ordering::SeqCst);
        }) as Box<dyn FnOnce(Vec<u8>) + Send>
    };
    (calls, make)
}

#[test]
fn test_default_capacity_is_three() {
    let pool = StagingBufferPool::new(Arc::new(CpuPrimitives::new()), SIZE).unwrap();
    assert_eq!(pool.stats().capacity, 3);
}

#[test]
fn test_capacity_property() {
    for capacity in 1..=5 {
        let mut pool = StagingBufferPool::with_capacity(Arc::new(CpuPrimitives::new()), capacity, SIZE).unwrap();
        let mut lent: Vec<_> = (0..capacity).map(|_| pool.acquire()).collect();
        assert!(lent.iter().all(Option::is_some), "capacity {capacity}");
        assert!(pool.acquire().is_none(), "acquire {} of {capacity}", capacity + 1);

        let one = lent.pop().flatten().unwrap();
        pool.release(one);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
    }
}

#[test]
fn test_single_buffer_three_sequential_readbacks() {
    let device = Arc::new(CpuPrimitives::new());
    let src = source(&device);
    let mut pool = StagingBufferPool::with_capacity(device, 1, SIZE).unwrap();
    let (calls, make) = counter();

    for _ in 0..3 {
        let handle = pool.readback_async(&src, SIZE, make()).unwrap();
        assert!(handle.is_some());
        pool.wait_idle().unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let stats = pool.stats();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.free, 1);
}

#[test]
fn test_exhausted_pool_skips_without_callback() {
    let device = Arc::new(CpuPrimitives::new());
    let src = source(&device);
    let mut pool = StagingBufferPool::with_capacity(device, 1, SIZE).unwrap();
    let (calls, make) = counter();

    assert!(pool.readback_async(&src, SIZE, make()).unwrap().is_some());
    assert!(pool.readback_async(&src, SIZE, make()).unwrap().is_none());
    assert_eq!(pool.stats().skipped, 1);

    pool.wait_idle().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_readback_delivers_source_bytes() {
    let device = Arc::new(CpuPrimitives::new());
    let src = source(&device);
    let mut pool = StagingBufferPool::with_capacity(device, 2, SIZE).unwrap();
    let received = Arc::new(Mutex::new(None));
    let sink = received.clone();

    pool.readback_async(&src, 16, move |bytes| {
        *sink.lock().unwrap() = Some(bytes);
    })
    .unwrap();
    assert_eq!(pool.pump().unwrap(), 1);
    assert_eq!(received.lock().unwrap().as_deref(), Some(&[0u8; 16][..]));
}

#[test]
fn test_failed_map_replaces_buffer() {
    let device = Arc::new(CpuPrimitives::new());
    let src = source(&device);
    let mut pool = StagingBufferPool::with_capacity(device.clone(), 2, SIZE).unwrap();
    let (calls, make) = counter();

    device.fail_next_maps(1);
    assert!(pool.readback_async(&src, SIZE, make()).unwrap().is_some());
    pool.wait_idle().unwrap();

    let stats = pool.stats();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.free, 2);

    // Later calls proceed normally on the replacement.
    for _ in 0..2 {
        pool.readback_async(&src, SIZE, make()).unwrap();
    }
    pool.wait_idle().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cancelled_readback_returns_buffer() {
    let device = Arc::new(CpuPrimitives::new());
    let src = source(&device);
    let mut pool = StagingBufferPool::with_capacity(device, 1, SIZE).unwrap();
    let (calls, make) = counter();

    let handle = pool.readback_async(&src, SIZE, make()).unwrap().unwrap();
    handle.cancel();
    assert!(handle.is_cancelled());
    pool.wait_idle().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pool.stats().cancelled, 1);
    assert!(pool.acquire().is_some());
}

#[test]
fn test_destroy_with_readback_in_flight() {
    let device = Arc::new(CpuPrimitives::new());
    let src = source(&device);
    let mut pool = StagingBufferPool::with_capacity(device.clone(), 2, SIZE).unwrap();
    let (calls, make) = counter();

    pool.readback_async(&src, SIZE, make()).unwrap();
    pool.destroy();
    assert!(pool.is_destroyed());

    // The map callback still fires on the device but finds a dead pool.
    device.poll(PollMode::Wait).unwrap();
    assert_eq!(pool.pump().unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pool.stats().cancelled, 1);
}
