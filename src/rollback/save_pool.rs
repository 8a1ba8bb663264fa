//! Reusable buffers for per-frame rollback saves.
//!
//! A save buffer is either checked out (owned by a saved frame in the rollback engine) or
//! sitting in the pool. Ownership moves between the two; buffers are never shared.

/// One captured simulation memory state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SaveBuffer {
    data: Vec<u8>,
}

impl SaveBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps already captured bytes.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// The captured bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access for the driver to capture into. Capacity is kept between uses.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Number of captured bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing has been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Forgets the contents but keeps the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// LIFO free list of [`SaveBuffer`]s.
///
/// The most recently returned buffer is handed out first, so its allocation is still warm.
///
/// ```
/// use rollback_netplay::{SaveBuffer, SaveBufferPool};
///
/// let mut pool = SaveBufferPool::new();
/// let mut buffer = pool.checkout();
/// buffer.data_mut().extend_from_slice(&[1, 2, 3]);
/// pool.checkin(buffer);
/// assert_eq!(pool.len(), 1);
///
/// let reused = pool.checkout();
/// assert!(reused.is_empty());
/// assert!(pool.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct SaveBufferPool {
    free: Vec<SaveBuffer>,
}

impl SaveBufferPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a cleared buffer from the pool, allocating a new one if the pool is empty.
    pub fn checkout(&mut self) -> SaveBuffer {
        match self.free.pop() {
            Some(mut buffer) => {
                buffer.clear();
                buffer
            },
            None => SaveBuffer::new(),
        }
    }

    /// Returns a buffer for reuse.
    pub fn checkin(&mut self, buffer: SaveBuffer) {
        self.free.push(buffer);
    }

    /// Number of buffers waiting for reuse.
    #[must_use]
    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// Returns `true` if no buffer is waiting for reuse.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Releases every pooled buffer.
    pub fn clear(&mut self) {
        self.free.clear();
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn checkout_reuses_last_returned_buffer() {
        let mut pool = SaveBufferPool::new();
        let mut first = SaveBuffer::new();
        first.data_mut().reserve(4096);
        let mut second = SaveBuffer::new();
        second.data_mut().reserve(64);
        let second_capacity = second.data_mut().capacity();

        pool.checkin(first);
        pool.checkin(second);

        let mut reused = pool.checkout();
        assert_eq!(reused.data_mut().capacity(), second_capacity);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn checked_out_buffers_are_cleared() {
        let mut pool = SaveBufferPool::new();
        pool.checkin(SaveBuffer::from_vec(vec![9; 16]));
        let buffer = pool.checkout();
        assert!(buffer.is_empty());
    }

    #[test]
    fn empty_pool_allocates() {
        let mut pool = SaveBufferPool::new();
        assert!(pool.checkout().is_empty());
        assert!(pool.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let mut pool = SaveBufferPool::new();
        pool.checkin(SaveBuffer::new());
        pool.checkin(SaveBuffer::new());
        pool.clear();
        assert!(pool.is_empty());
    }
}
