//! Buffer pool implementation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{BufMut, BytesMut};

/// Default number of idle buffers kept by the pool
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Default initial size of a fresh buffer
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Buffers that grew beyond this are not recycled
const MAX_RETAINED_SIZE: usize = 64 * 1024;

struct PoolShared {
    free: Mutex<Vec<BytesMut>>,
    capacity: usize,
    buffer_size: usize,
    allocated: AtomicUsize,
}

impl PoolShared {
    fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_RETAINED_SIZE {
            return;
        }
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity {
                free.push(buf);
            }
        }
    }
}

/// Pool of reusable byte buffers
///
/// Cheap to clone; all clones share the same free list.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool with default sizing
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Create a pool keeping at most `capacity` idle buffers of `buffer_size` bytes
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::with_capacity(capacity.min(64))),
                capacity,
                buffer_size,
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Acquire an empty buffer, reusing an idle one when available
    pub fn acquire(&self) -> PooledBuffer {
        let recycled = self.shared.free.lock().ok().and_then(|mut free| free.pop());
        let buf = match recycled {
            Some(buf) => buf,
            None => {
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.shared.buffer_size)
            }
        };

        PooledBuffer {
            buf,
            pool: Arc::downgrade(&self.shared),
        }
    }

    /// Number of idle buffers ready for reuse
    pub fn available(&self) -> usize {
        self.shared.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    /// Total number of buffers ever allocated by this pool
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// A buffer checked out of a [`BufferPool`]
///
/// Returned to the pool when dropped. If the pool itself is gone the
/// allocation is simply freed.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Weak<PoolShared>,
}

impl PooledBuffer {
    /// Buffer contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes written
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append raw bytes
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// `io::Write` adapter, used by serializers
    pub fn writer(&mut self) -> impl std::io::Write + '_ {
        (&mut self.buf).writer()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(std::mem::take(&mut self.buf));
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_buffer_is_recycled_on_drop() {
        let pool = BufferPool::with_capacity(4, 128);

        let mut buf = pool.acquire();
        buf.extend_from_slice(b"hello");
        assert_eq!(buf.as_bytes(), b"hello");
        assert_eq!(pool.available(), 0);

        drop(buf);
        assert_eq!(pool.available(), 1);

        // Reused buffer comes back empty and no new allocation happens
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_pool_capacity_is_bounded() {
        let pool = BufferPool::with_capacity(2, 16);
        let buffers: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        assert_eq!(pool.allocated(), 5);

        drop(buffers);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_oversized_buffer_not_retained() {
        let pool = BufferPool::with_capacity(2, 16);
        let mut buf = pool.acquire();
        buf.extend_from_slice(&vec![0u8; MAX_RETAINED_SIZE + 1]);
        drop(buf);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_writer() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        write!(buf.writer(), "{}-{}", 1, 2).unwrap();
        assert_eq!(buf.as_bytes(), b"1-2");
    }

    #[test]
    fn test_buffer_outlives_pool() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        drop(pool);
        buf.extend_from_slice(b"still usable");
        assert_eq!(buf.len(), 12);
    }
}
