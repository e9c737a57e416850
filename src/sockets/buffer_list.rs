//! A logically contiguous byte range stored in pooled fixed-size buffers.

use super::buffer_pool::{Buffer, BufferPool};
use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

/// Variable-length byte storage backed by [`BufferPool`] chunks.
///
/// For a declared length `n` the list exposes `ceil(n / size)` segments; all but the
/// last are full, the last holds `n % size` bytes (or a full buffer when the remainder
/// is zero). Shrinking keeps the surplus buffers for reuse until [`BufferList::limit`].
pub struct BufferList {
    pool: Arc<BufferPool>,
    buffers: Vec<Buffer>,
    count: usize,
    final_len: usize,
}

impl std::fmt::Debug for BufferList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferList")
            .field("len", &self.len())
            .field("segments", &self.count)
            .field("retained", &self.buffers.len())
            .finish()
    }
}

impl Default for BufferList {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferList {
    /// Empty list drawing from the process-wide pool.
    pub fn new() -> Self {
        Self::with_pool(BufferPool::global())
    }

    pub fn with_pool(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            buffers: Vec::with_capacity(4),
            count: 0,
            final_len: 0,
        }
    }

    fn buffer_len(&self) -> usize {
        self.pool.buffer_size()
    }

    /// Declared length in bytes.
    pub fn len(&self) -> usize {
        if self.count == 0 {
            0
        } else {
            (self.count - 1) * self.buffer_len() + self.final_len
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of active segments.
    pub fn segment_count(&self) -> usize {
        self.count
    }

    /// Number of buffers held, active or not.
    pub fn retained(&self) -> usize {
        self.buffers.len()
    }

    /// Resize to hold `length` bytes. Returns whether the segment layout changed.
    ///
    /// Growing takes buffers from the pool; shrinking keeps them.
    pub fn set_length(&mut self, length: usize) -> bool {
        let size = self.buffer_len();
        let count = length.div_ceil(size);
        let final_len = match (count, length % size) {
            (0, _) => 0,
            (_, 0) => size,
            (_, rem) => rem,
        };

        let changed = count != self.count || final_len != self.final_len;

        if self.buffers.len() < count {
            let missing = count - self.buffers.len();
            self.pool.take_buffers(missing, &mut self.buffers);
        }

        self.count = count;
        self.final_len = final_len;
        changed
    }

    /// The active part of segment `index`.
    pub fn segment(&self, index: usize) -> &[u8] {
        let len = self.segment_len(index);
        &self.buffers[index][..len]
    }

    pub fn segments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.count).map(move |i| self.segment(i))
    }

    /// Segments as vectored-write slices.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.segments().map(IoSlice::new).collect()
    }

    /// Segments as vectored-read slices.
    pub fn io_slices_mut(&mut self) -> Vec<IoSliceMut<'_>> {
        let count = self.count;
        let final_len = self.final_len;
        self.buffers[..count]
            .iter_mut()
            .enumerate()
            .map(|(i, buffer)| {
                let len = if i + 1 == count { final_len } else { buffer.len() };
                IoSliceMut::new(&mut buffer[..len])
            })
            .collect()
    }

    /// Resize to `src.len()` and copy `src` in. Returns whether the layout changed.
    pub fn copy_from(&mut self, src: &[u8]) -> bool {
        let changed = self.set_length(src.len());
        self.fill(src);
        changed
    }

    /// Copy `src` over the start of the list without resizing. Returns bytes copied.
    pub fn fill(&mut self, src: &[u8]) -> usize {
        let total = src.len().min(self.len());
        let size = self.buffer_len();
        let mut copied = 0;
        for buffer in self.buffers.iter_mut() {
            if copied == total {
                break;
            }
            let n = size.min(total - copied);
            buffer[..n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
        }
        copied
    }

    /// Copy the first `dest.len()` bytes (at most [`BufferList::len`]) into `dest`.
    pub fn copy_to(&self, dest: &mut [u8]) -> usize {
        let total = dest.len().min(self.len());
        let mut copied = 0;
        for segment in self.segments() {
            if copied == total {
                break;
            }
            let n = segment.len().min(total - copied);
            dest[copied..copied + n].copy_from_slice(&segment[..n]);
            copied += n;
        }
        copied
    }

    /// Reset the length to zero and hand buffers beyond `limit` back to the pool.
    pub fn limit(&mut self, limit: usize) {
        self.count = 0;
        self.final_len = 0;
        while self.buffers.len() > limit {
            if let Some(buffer) = self.buffers.pop() {
                self.pool.return_buffer(buffer);
            }
        }
    }

    pub fn clear(&mut self) {
        self.limit(0);
    }

    fn segment_len(&self, index: usize) -> usize {
        assert!(index < self.count, "segment index out of range");
        if index + 1 == self.count {
            self.final_len
        } else {
            self.buffer_len()
        }
    }
}

impl Drop for BufferList {
    fn drop(&mut self) {
        self.clear();
    }
}
