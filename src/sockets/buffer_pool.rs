//! Sharded free-list of fixed-size byte buffers.
//!
//! Capacity is split across [`SHARD_COUNT`] independent shards. Each calling thread
//! starts at its own shard and only blocks on that one; the other shards are tried
//! with a non-blocking `try_lock`. When every shard is empty (or contended) a fresh
//! buffer is allocated, and a buffer returned to a full pool is simply dropped, so
//! neither operation can fail.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Number of independent shards per pool.
pub const SHARD_COUNT: usize = 16;

/// Size of every buffer handed out by the process-wide pool.
pub const BUFFER_LEN: usize = 4096;

/// Upper bound on idle memory retained by the process-wide pool (64 MiB).
const GLOBAL_POOL_LIMIT: usize = 64 * 1024 * 1024;

/// A fixed-size byte buffer. Owned by the pool while idle, by exactly one caller otherwise.
pub type Buffer = Box<[u8]>;

static NEXT_SHARD_HINT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: usize = NEXT_SHARD_HINT.fetch_add(1, Ordering::Relaxed);
}

fn shard_hint() -> usize {
    SHARD_HINT.with(|hint| *hint)
}

struct Shard {
    max: usize,
    /// Mirrors `buffers.len()` so empty/full checks skip the lock.
    count: AtomicUsize,
    buffers: Mutex<Vec<Buffer>>,
}

impl Shard {
    fn new(max: usize, buffer_size: usize, allocate: bool) -> Self {
        let buffers: Vec<Buffer> = if allocate {
            (0..max).map(|_| vec![0u8; buffer_size].into_boxed_slice()).collect()
        } else {
            Vec::with_capacity(max)
        };
        Self {
            max,
            count: AtomicUsize::new(buffers.len()),
            buffers: Mutex::new(buffers),
        }
    }

    fn give(&self, buffer: Buffer, force_lock: bool) -> Result<(), Buffer> {
        if self.count.load(Ordering::Relaxed) >= self.max {
            return Err(buffer);
        }
        let mut buffers = if force_lock {
            self.buffers.lock()
        } else {
            match self.buffers.try_lock() {
                Some(guard) => guard,
                None => return Err(buffer),
            }
        };
        if buffers.len() >= self.max {
            return Err(buffer);
        }
        buffers.push(buffer);
        self.count.store(buffers.len(), Ordering::Relaxed);
        Ok(())
    }

    fn take(&self, force_lock: bool) -> Option<Buffer> {
        if self.count.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let mut buffers = if force_lock {
            self.buffers.lock()
        } else {
            self.buffers.try_lock()?
        };
        let buffer = buffers.pop();
        self.count.store(buffers.len(), Ordering::Relaxed);
        buffer
    }

    fn take_into(&self, target: &mut Vec<Buffer>, wanted: usize, force_lock: bool) -> usize {
        if self.count.load(Ordering::Relaxed) == 0 {
            return 0;
        }
        let mut buffers = if force_lock {
            self.buffers.lock()
        } else {
            match self.buffers.try_lock() {
                Some(guard) => guard,
                None => return 0,
            }
        };
        let taken = wanted.min(buffers.len());
        let split = buffers.len() - taken;
        target.extend(buffers.drain(split..));
        self.count.store(buffers.len(), Ordering::Relaxed);
        taken
    }

    fn clear(&self) {
        let mut buffers = self.buffers.lock();
        buffers.clear();
        self.count.store(0, Ordering::Relaxed);
    }
}

/// Pool of equally sized [`Buffer`]s.
pub struct BufferPool {
    buffer_size: usize,
    shards: Box<[Shard]>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl BufferPool {
    /// Create a pool retaining at most `max_pool_bytes` of idle buffers of `buffer_size` bytes.
    ///
    /// With `preallocate` every slot is filled up front.
    pub fn new(max_pool_bytes: usize, buffer_size: usize, preallocate: bool) -> Self {
        assert!(buffer_size > 0, "buffer size must be positive");
        assert!(
            max_pool_bytes >= buffer_size,
            "pool must be able to hold at least one buffer"
        );

        let total = max_pool_bytes.div_ceil(buffer_size);
        let per_shard = total.div_ceil(SHARD_COUNT);
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard::new(per_shard, buffer_size, preallocate))
            .collect();

        Self {
            buffer_size,
            shards,
        }
    }

    /// The process-wide pool of [`BUFFER_LEN`] buffers, created on first use.
    pub fn global() -> Arc<BufferPool> {
        static GLOBAL: OnceLock<Arc<BufferPool>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(BufferPool::new(GLOBAL_POOL_LIMIT, BUFFER_LEN, false)))
            .clone()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of idle buffers currently held across all shards.
    pub fn idle_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.count.load(Ordering::Relaxed))
            .sum()
    }

    /// Take a buffer, allocating a fresh one when the pool cannot supply it.
    pub fn take_buffer(&self) -> Buffer {
        let hint = shard_hint();
        for i in 0..SHARD_COUNT {
            let shard = &self.shards[(hint + i) % SHARD_COUNT];
            if let Some(buffer) = shard.take(i == 0) {
                return buffer;
            }
        }
        self.allocate()
    }

    /// Append `count` buffers to `target`, allocating whatever the pool cannot supply.
    pub fn take_buffers(&self, count: usize, target: &mut Vec<Buffer>) {
        if count == 0 {
            return;
        }
        target.reserve(count);

        let hint = shard_hint();
        let mut remaining = count;
        for i in 0..SHARD_COUNT {
            if remaining == 0 {
                break;
            }
            let shard = &self.shards[(hint + i) % SHARD_COUNT];
            remaining -= shard.take_into(target, remaining, i == 0);
        }

        for _ in 0..remaining {
            target.push(self.allocate());
        }
    }

    /// Return a buffer to the pool. Dropped if the pool is full or the size is wrong.
    pub fn return_buffer(&self, buffer: Buffer) {
        if buffer.len() != self.buffer_size {
            debug!(
                len = buffer.len(),
                expected = self.buffer_size,
                "Dropping buffer of foreign size"
            );
            return;
        }

        let hint = shard_hint();
        let mut buffer = buffer;
        for i in 0..SHARD_COUNT {
            let shard = &self.shards[(hint + i) % SHARD_COUNT];
            match shard.give(buffer, i == 0) {
                Ok(()) => return,
                Err(rejected) => buffer = rejected,
            }
        }
    }

    /// Drop every idle buffer.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }

    fn allocate(&self) -> Buffer {
        vec![0u8; self.buffer_size].into_boxed_slice()
    }
}
