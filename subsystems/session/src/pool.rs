//! # Buffer Pool
//!
//! Pre-allocated device buffers of one size in one memory bank, split into
//! a free set and a busy set.
//!
//! The sets are guarded by a spin lock: every critical section is a single
//! push/pop/remove, so waiters never park. `acquire` never blocks either; an
//! empty free set is reported as `PoolExhausted`.
//!
//! A `BufferObject` is one counted reference to a busy buffer. `retain`
//! hands out another reference; `release` (or drop) gives one back, and the
//! last one returns the buffer to the free set.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use accel_core::{BankIndex, ByteSize, DeviceAddr, DeviceIndex, Error, PoolId, Result};
use accel_hal::{DeviceBuffer, DeviceMemory};
use spin::Mutex;

use crate::config::PoolConfig;
use crate::device::DeviceContext;

// =============================================================================
// BUFFER ENTRY
// =============================================================================

#[derive(Debug)]
struct BufferEntry {
    index: u32,
    buffer: DeviceBuffer,
    ref_cnt: AtomicI32,
}

#[derive(Debug, Default)]
struct PoolLists {
    /// Acquisition order
    busy: Vec<Arc<BufferEntry>>,
    free: Vec<Arc<BufferEntry>>,
}

// =============================================================================
// BUFFER POOL
// =============================================================================

/// Fixed set of equally sized device buffers
pub struct BufferPool {
    id: PoolId,
    config: PoolConfig,
    dev_index: DeviceIndex,
    memory: Arc<dyn DeviceMemory>,
    lists: Mutex<PoolLists>,
    num_buffers: AtomicU32,
    num_free: AtomicU32,
    acquires: AtomicU64,
    releases: AtomicU64,
    peak_busy: AtomicU32,
}

/// Pool statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Pool handle
    pub id: PoolId,
    /// Pool name
    pub name: &'static str,
    /// Memory bank
    pub bank: BankIndex,
    /// Size of each buffer
    pub buffer_size: ByteSize,
    /// Buffers are device-only
    pub device_only: bool,
    /// Buffers owned by the pool
    pub total: u32,
    /// Buffers in the free set
    pub free: u32,
    /// Buffers in the busy set
    pub busy: u32,
    /// Successful acquisitions
    pub acquires: u64,
    /// Buffers returned to the free set
    pub releases: u64,
    /// High water mark of the busy set
    pub peak_busy: u32,
}

impl BufferPool {
    /// Allocate every buffer of the pool up front
    pub fn new(id: PoolId, device: &DeviceContext, config: PoolConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let bank = device.device().bank(config.bank)?;
        if bank.is_device_only() && !config.device_only {
            return Err(Error::InvalidParameter);
        }

        let memory = Arc::clone(device.memory());
        let mut free = Vec::with_capacity(config.count as usize);
        for index in 0..config.count {
            match memory.allocate(config.bank, config.buffer_size, config.device_only) {
                Ok(buffer) => free.push(Arc::new(BufferEntry {
                    index,
                    buffer,
                    ref_cnt: AtomicI32::new(0),
                })),
                Err(e) => {
                    log::warn!(
                        "pool '{}': allocation {} of {} in {} failed: {}",
                        config.name,
                        index + 1,
                        config.count,
                        config.bank,
                        e
                    );
                    for entry in free {
                        memory.free(entry.buffer);
                    }
                    return Err(e);
                },
            }
        }

        log::info!(
            "pool '{}' ({:?}): {} x {} in {}{}",
            config.name,
            id,
            config.count,
            config.buffer_size,
            config.bank,
            if config.device_only { " (device-only)" } else { "" }
        );

        Ok(Arc::new(Self {
            id,
            dev_index: device.device().index(),
            num_buffers: AtomicU32::new(config.count),
            num_free: AtomicU32::new(config.count),
            lists: Mutex::new(PoolLists {
                busy: Vec::with_capacity(config.count as usize),
                free,
            }),
            config,
            memory,
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            peak_busy: AtomicU32::new(0),
        }))
    }

    /// Move one buffer from the free set to the busy set
    pub fn acquire(self: &Arc<Self>) -> Result<BufferObject> {
        let entry = {
            let mut lists = self.lists.lock();
            let entry = lists.free.pop().ok_or(Error::PoolExhausted)?;
            entry.ref_cnt.store(1, Ordering::Release);
            lists.busy.push(Arc::clone(&entry));
            self.num_free.fetch_sub(1, Ordering::AcqRel);
            self.peak_busy
                .fetch_max(lists.busy.len() as u32, Ordering::Relaxed);
            entry
        };
        self.acquires.fetch_add(1, Ordering::Relaxed);

        Ok(BufferObject {
            pool: Arc::clone(self),
            entry: Some(entry),
        })
    }

    /// Drop one reference; the last one returns the buffer to the free set
    fn put(&self, entry: &Arc<BufferEntry>) -> bool {
        let prev = entry.ref_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "buffer reference count underflow");
        if prev != 1 {
            return false;
        }

        let mut lists = self.lists.lock();
        if let Some(pos) = lists.busy.iter().position(|e| Arc::ptr_eq(e, entry)) {
            let entry = lists.busy.remove(pos);
            lists.free.push(entry);
            self.num_free.fetch_add(1, Ordering::AcqRel);
        }
        drop(lists);

        self.releases.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pool handle
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Device the pool belongs to
    pub fn device_index(&self) -> DeviceIndex {
        self.dev_index
    }

    /// Buffers owned by the pool
    pub fn total_count(&self) -> u32 {
        self.num_buffers.load(Ordering::Acquire)
    }

    /// Buffers in the free set
    pub fn free_count(&self) -> u32 {
        self.num_free.load(Ordering::Acquire)
    }

    /// Consistent snapshot taken under the pool lock
    pub fn stats(&self) -> PoolStats {
        let (free, busy) = {
            let lists = self.lists.lock();
            (lists.free.len() as u32, lists.busy.len() as u32)
        };
        PoolStats {
            id: self.id,
            name: self.config.name,
            bank: self.config.bank,
            buffer_size: self.config.buffer_size,
            device_only: self.config.device_only,
            total: self.total_count(),
            free,
            busy,
            acquires: self.acquires.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            peak_busy: self.peak_busy.load(Ordering::Relaxed),
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let lists = core::mem::take(self.lists.get_mut());
        for entry in lists.free.iter().chain(lists.busy.iter()) {
            self.memory.free(entry.buffer);
        }
        log::debug!("pool '{}' ({:?}) torn down", self.config.name, self.id);
    }
}

impl core::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("total", &self.total_count())
            .field("free", &self.free_count())
            .finish()
    }
}

// =============================================================================
// BUFFER OBJECT
// =============================================================================

/// One counted reference to a busy pool buffer
#[derive(Debug)]
pub struct BufferObject {
    pool: Arc<BufferPool>,
    entry: Option<Arc<BufferEntry>>,
}

impl BufferObject {
    fn entry(&self) -> &BufferEntry {
        match &self.entry {
            Some(entry) => entry,
            None => unreachable!("entry is only taken by release"),
        }
    }

    /// Hand out another reference to the same buffer
    pub fn retain(&self) -> BufferObject {
        self.entry().ref_cnt.fetch_add(1, Ordering::AcqRel);
        BufferObject {
            pool: Arc::clone(&self.pool),
            entry: self.entry.clone(),
        }
    }

    /// Give this reference back
    ///
    /// Returns `true` if it was the last one and the buffer went back to
    /// the free set.
    pub fn release(mut self) -> bool {
        match self.entry.take() {
            Some(entry) => self.pool.put(&entry),
            None => false,
        }
    }

    /// Current reference count
    pub fn ref_count(&self) -> i32 {
        self.entry().ref_cnt.load(Ordering::Acquire)
    }

    /// Position of the buffer within its pool
    pub fn index(&self) -> u32 {
        self.entry().index
    }

    /// Owning pool
    pub fn pool_id(&self) -> PoolId {
        self.pool.id
    }

    /// Underlying device buffer
    pub fn device_buffer(&self) -> DeviceBuffer {
        self.entry().buffer
    }

    /// Device address
    pub fn addr(&self) -> DeviceAddr {
        self.entry().buffer.addr
    }

    /// Buffer size
    pub fn size(&self) -> ByteSize {
        self.entry().buffer.size
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.put(&entry);
        }
    }
}
