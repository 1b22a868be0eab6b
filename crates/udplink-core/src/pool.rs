//! Buffer pooling for memory efficiency.

/// A simple buffer allocator that reuses byte vectors.
///
/// The receive and send hot paths hand buffers back after use so that, once
/// warm, no per-datagram heap allocation takes place.
pub struct BufferPool {
    /// Pool of reusable buffers
    pool: Vec<Vec<u8>>,
    /// Capacity to reserve for fresh buffers
    buffer_size: usize,
    /// Maximum pool size
    max_pool_size: usize,
}

impl BufferPool {
    /// Creates a new buffer pool.
    pub fn new(buffer_size: usize, max_pool_size: usize) -> Self {
        Self { pool: Vec::with_capacity(max_pool_size), buffer_size, max_pool_size }
    }

    /// Takes a buffer from the pool or creates a new one.
    pub fn allocate(&mut self) -> Vec<u8> {
        self.pool.pop().unwrap_or_else(|| Vec::with_capacity(self.buffer_size))
    }

    /// Returns a buffer to the pool for reuse.
    pub fn deallocate(&mut self, mut buffer: Vec<u8>) {
        if self.pool.len() < self.max_pool_size {
            buffer.clear();
            self.pool.push(buffer);
        }
    }

    /// Returns the number of buffers currently in the pool.
    pub fn available(&self) -> usize {
        self.pool.len()
    }

    /// Clears all pooled buffers.
    pub fn clear(&mut self) {
        self.pool.clear();
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_MTU, 256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_recycle() {
        let mut pool = BufferPool::new(100, 10);

        let buf = pool.allocate();
        assert!(buf.capacity() >= 100);
        assert_eq!(pool.available(), 0);

        pool.deallocate(buf);
        assert_eq!(pool.available(), 1);

        let buf = pool.allocate();
        assert_eq!(pool.available(), 0);
        drop(buf);
    }

    #[test]
    fn recycled_buffers_come_back_empty() {
        let mut pool = BufferPool::new(16, 4);
        let mut buf = pool.allocate();
        buf.extend_from_slice(&[1, 2, 3]);
        pool.deallocate(buf);
        assert!(pool.allocate().is_empty());
    }

    #[test]
    fn pool_size_is_bounded() {
        let mut pool = BufferPool::new(100, 2);

        for _ in 0..5 {
            pool.deallocate(Vec::new());
        }

        assert_eq!(pool.available(), 2);
    }
}
