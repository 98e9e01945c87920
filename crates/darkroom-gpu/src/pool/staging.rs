//! Fixed-size ring of CPU-mappable readback buffers.
//!
//! A full pool is not an error: [`StagingBufferPool::acquire`] returns
//! `None` and [`StagingBufferPool::readback_async`] skips the request. A
//! buffer whose map fails is destroyed and replaced so capacity never
//! shrinks. Completions are delivered from [`pump`](StagingBufferPool::pump)
//! and [`wait_idle`](StagingBufferPool::wait_idle) on the owning thread.
//!
//! Map callbacks capture the pool's `alive` flag; once the pool is
//! destroyed a late callback touches nothing.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::backend::{BufferDesc, BufferKind, GpuPrimitives, PollMode};
use crate::config::DEFAULT_STAGING_POOL_SIZE;
use crate::{GpuError, GpuResult};

/// Upper bound on blocking polls in [`StagingBufferPool::wait_idle`].
const MAX_WAIT_ROUNDS: usize = 64;

/// Map state of one staging slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    Unmapped,
    /// Lent out or waiting on a map request.
    Pending,
    Mapped,
}

/// Cancellation handle for one in-flight readback.
#[derive(Debug, Clone)]
pub struct ReadbackHandle {
    cancel: Arc<AtomicBool>,
}

impl ReadbackHandle {
    /// Drop the result when it arrives. The buffer still returns to the pool.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// A staging buffer lent by [`StagingBufferPool::acquire`].
pub struct StagingBuffer<G: GpuPrimitives> {
    slot: usize,
    buffer: Arc<G::Buffer>,
}

impl<G: GpuPrimitives> StagingBuffer<G> {
    /// The underlying buffer.
    pub fn buffer(&self) -> &G::Buffer {
        &self.buffer
    }
}

impl<G: GpuPrimitives> fmt::Debug for StagingBuffer<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingBuffer").field("slot", &self.slot).finish()
    }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingStats {
    /// Configured number of buffers.
    pub capacity: usize,
    /// Buffers ready for [`StagingBufferPool::acquire`].
    pub free: usize,
    /// Buffers lent or waiting on a map.
    pub pending: usize,
    /// Readbacks delivered to their callback.
    pub completed: u64,
    /// Readbacks skipped because the pool was exhausted.
    pub skipped: u64,
    /// Maps that failed; each failed buffer was replaced.
    pub failed: u64,
    /// Readbacks dropped by cancellation or pool destruction.
    pub cancelled: u64,
}

type Completion = Box<dyn FnOnce(Vec<u8>) + Send + 'static>;

struct PendingRead {
    len: u64,
    rx: Receiver<Result<(), String>>,
    cancel: Arc<AtomicBool>,
    on_complete: Completion,
}

struct Slot<B> {
    buffer: Arc<B>,
    state: MapState,
    pending: Option<PendingRead>,
}

enum Outcome {
    Waiting,
    Ready,
    Failed(String),
}

/// Ring of staging buffers for non-blocking readback.
pub struct StagingBufferPool<G: GpuPrimitives> {
    device: Arc<G>,
    slots: Vec<Slot<G::Buffer>>,
    buffer_size: u64,
    alive: Arc<AtomicBool>,
    stats: StagingStats,
}

impl<G: GpuPrimitives> StagingBufferPool<G> {
    /// Pool of [`DEFAULT_STAGING_POOL_SIZE`] buffers of `buffer_size` bytes.
    pub fn new(device: Arc<G>, buffer_size: u64) -> GpuResult<Self> {
        Self::with_capacity(device, DEFAULT_STAGING_POOL_SIZE, buffer_size)
    }

    /// Pool of `capacity` buffers (at least one) of `buffer_size` bytes.
    pub fn with_capacity(device: Arc<G>, capacity: usize, buffer_size: u64) -> GpuResult<Self> {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|i| {
                Ok(Slot {
                    buffer: Arc::new(Self::allocate(&device, i, buffer_size)?),
                    state: MapState::Unmapped,
                    pending: None,
                })
            })
            .collect::<GpuResult<Vec<_>>>()?;
        debug!(capacity, buffer_size, "staging pool created");
        Ok(Self {
            device,
            slots,
            buffer_size,
            alive: Arc::new(AtomicBool::new(true)),
            stats: StagingStats {
                capacity,
                ..Default::default()
            },
        })
    }

    fn allocate(device: &G, slot: usize, size: u64) -> GpuResult<G::Buffer> {
        device.create_buffer(&BufferDesc {
            label: &format!("staging_{slot}"),
            size,
            kind: BufferKind::Staging,
        })
    }

    /// Whether [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
    }

    /// Size in bytes of every buffer.
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    /// Lend an unmapped buffer, or `None` when every buffer is pending or
    /// mapped.
    pub fn acquire(&mut self) -> Option<StagingBuffer<G>> {
        if self.is_destroyed() {
            return None;
        }
        let slot = self.slots.iter().position(|s| s.state == MapState::Unmapped)?;
        self.slots[slot].state = MapState::Pending;
        Some(StagingBuffer {
            slot,
            buffer: self.slots[slot].buffer.clone(),
        })
    }

    /// Return a lent buffer.
    pub fn release(&mut self, buffer: StagingBuffer<G>) {
        let Some(slot) = self.slots.get_mut(buffer.slot) else {
            return;
        };
        if !Arc::ptr_eq(&slot.buffer, &buffer.buffer) || slot.pending.is_some() {
            warn!(slot = buffer.slot, "released staging buffer not lent by this pool");
            return;
        }
        if slot.state == MapState::Mapped {
            self.device.unmap(&slot.buffer);
        }
        slot.state = MapState::Unmapped;
    }

    /// Copy the first `len` bytes of `source` into a staging buffer and map
    /// it. `on_complete` receives the bytes from a later
    /// [`pump`](Self::pump) or [`wait_idle`](Self::wait_idle).
    ///
    /// Returns `Ok(None)` without issuing any GPU work when the pool is
    /// exhausted; `on_complete` is then never called.
    pub fn readback_async(
        &mut self,
        source: &G::Buffer,
        len: u64,
        on_complete: impl FnOnce(Vec<u8>) + Send + 'static,
    ) -> GpuResult<Option<ReadbackHandle>> {
        if self.is_destroyed() {
            return Err(GpuError::PipelineDestroyed);
        }
        if len > self.buffer_size {
            return Err(GpuError::OperationFailed(format!(
                "readback of {len} bytes exceeds staging size {}",
                self.buffer_size
            )));
        }
        let Some(staging) = self.acquire() else {
            self.stats.skipped += 1;
            trace!("staging pool exhausted, readback skipped");
            return Ok(None);
        };

        let mut encoder = self.device.begin_encoder("staging_copy");
        self.device.encode_copy_buffer(&mut encoder, source, &staging.buffer, len);
        if let Err(e) = self.device.submit(encoder) {
            self.release(staging);
            return Err(e);
        }

        let (tx, rx) = mpsc::channel();
        let alive = self.alive.clone();
        self.device.map_read(
            &staging.buffer,
            Box::new(move |result| {
                if alive.load(Ordering::Acquire) {
                    let _ = tx.send(result);
                }
            }),
        );

        let cancel = Arc::new(AtomicBool::new(false));
        self.slots[staging.slot].pending = Some(PendingRead {
            len,
            rx,
            cancel: cancel.clone(),
            on_complete: Box::new(on_complete),
        });
        Ok(Some(ReadbackHandle { cancel }))
    }

    /// Deliver finished readbacks without blocking. Returns how many
    /// callbacks ran.
    pub fn pump(&mut self) -> GpuResult<usize> {
        if self.is_destroyed() {
            return Ok(0);
        }
        self.device.poll(PollMode::Poll)?;
        Ok(self.drain())
    }

    /// Block until no readback is in flight. Returns how many callbacks ran.
    pub fn wait_idle(&mut self) -> GpuResult<usize> {
        let mut delivered = 0;
        for _ in 0..MAX_WAIT_ROUNDS {
            if self.is_destroyed() || self.in_flight() == 0 {
                return Ok(delivered);
            }
            self.device.poll(PollMode::Wait)?;
            delivered += self.drain();
        }
        if self.in_flight() > 0 {
            return Err(GpuError::TransferFailed(format!(
                "{} readbacks still pending after {MAX_WAIT_ROUNDS} waits",
                self.in_flight()
            )));
        }
        Ok(delivered)
    }

    /// Readbacks submitted and not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.pending.is_some()).count()
    }

    fn drain(&mut self) -> usize {
        let mut ready: Vec<(Completion, Vec<u8>)> = Vec::new();
        for index in 0..self.slots.len() {
            let outcome = match &self.slots[index].pending {
                None => continue,
                Some(read) => match read.rx.try_recv() {
                    Ok(Ok(())) => Outcome::Ready,
                    Ok(Err(reason)) => Outcome::Failed(reason),
                    Err(TryRecvError::Empty) => Outcome::Waiting,
                    Err(TryRecvError::Disconnected) => Outcome::Failed("map callback dropped".into()),
                },
            };

            match outcome {
                Outcome::Waiting => {}
                Outcome::Ready => {
                    let Some(read) = self.slots[index].pending.take() else {
                        continue;
                    };
                    self.slots[index].state = MapState::Mapped;
                    if read.cancel.load(Ordering::Acquire) {
                        self.device.unmap(&self.slots[index].buffer);
                        self.slots[index].state = MapState::Unmapped;
                        self.stats.cancelled += 1;
                        continue;
                    }
                    match self.device.mapped_bytes(&self.slots[index].buffer, read.len) {
                        Ok(bytes) => {
                            self.device.unmap(&self.slots[index].buffer);
                            self.slots[index].state = MapState::Unmapped;
                            self.stats.completed += 1;
                            ready.push((read.on_complete, bytes));
                        }
                        Err(e) => self.replace(index, &e.to_string()),
                    }
                }
                Outcome::Failed(reason) => {
                    self.slots[index].pending = None;
                    self.replace(index, &reason);
                }
            }
        }

        let delivered = ready.len();
        for (on_complete, bytes) in ready {
            on_complete(bytes);
        }
        delivered
    }

    /// Destroy a failed buffer and put a fresh one in its slot. If the
    /// replacement cannot be allocated the dead buffer stays, and its next
    /// map failure retries.
    fn replace(&mut self, index: usize, reason: &str) {
        warn!(slot = index, reason, "staging buffer map failed, replacing buffer");
        self.stats.failed += 1;
        self.device.destroy_buffer(&self.slots[index].buffer);
        match Self::allocate(&self.device, index, self.buffer_size) {
            Ok(buffer) => self.slots[index].buffer = Arc::new(buffer),
            Err(e) => warn!(slot = index, error = %e, "staging buffer replacement failed"),
        }
        self.slots[index].state = MapState::Unmapped;
    }

    /// Cancel every in-flight readback and free every buffer. Idempotent.
    pub fn destroy(&mut self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            for slot in &mut self.slots {
                if let Some(read) = slot.pending.take() {
                    read.cancel.store(true, Ordering::Release);
                    self.stats.cancelled += 1;
                }
                if slot.state == MapState::Mapped {
                    self.device.unmap(&slot.buffer);
                }
                self.device.destroy_buffer(&slot.buffer);
            }
            debug!(cancelled = self.stats.cancelled, "staging pool destroyed");
            self.slots.clear();
        }
    }

    /// Counters.
    pub fn stats(&self) -> StagingStats {
        StagingStats {
            free: self.slots.iter().filter(|s| s.state == MapState::Unmapped).count(),
            pending: self.slots.iter().filter(|s| s.state != MapState::Unmapped).count(),
            ..self.stats
        }
    }
}

impl<G: GpuPrimitives> Drop for StagingBufferPool<G> {
    fn drop(&mut self) {
        self.destroy();
    }
}
