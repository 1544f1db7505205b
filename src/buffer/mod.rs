//! Pooled buffer lending.
//!
//! Datagram and message buffers are borrowed from a [`BufferFactory`] and
//! returned once the transport or the application is done with them. The
//! protocol engine returns every buffer it obtains but does not send, so a
//! well-behaved caller closes the loop by recycling delivered datagrams and
//! drained payloads.

use tracing::trace;

/// Lends byte buffers to the protocol engine and takes them back.
///
/// `get_buffer` must return a buffer whose length is exactly `min_size`;
/// contents beyond what the engine writes are unspecified.
pub trait BufferFactory {
    /// Borrow a buffer of length `min_size`.
    fn get_buffer(&mut self, min_size: usize) -> Vec<u8>;

    /// Return a previously borrowed buffer for reuse.
    fn return_buffer(&mut self, buf: Vec<u8>);
}

/// Free-list buffer pool with a bounded retained set.
///
/// Buffers are recycled regardless of size; a recycled buffer grows on demand
/// when a larger request comes in. Returning more buffers than
/// `max_retained` discards the surplus.
#[derive(Debug)]
pub struct PooledBufferFactory {
    free: Vec<Vec<u8>>,
    max_retained: usize,
}

impl PooledBufferFactory {
    /// Create a pool retaining at most `max_retained` free buffers.
    pub fn new(max_retained: usize) -> Self {
        Self {
            free: Vec::new(),
            max_retained,
        }
    }

    /// Number of buffers currently held in the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl Default for PooledBufferFactory {
    fn default() -> Self {
        Self::new(64)
    }
}

impl BufferFactory for PooledBufferFactory {
    fn get_buffer(&mut self, min_size: usize) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buf) => {
                trace!(min_size, "reusing pooled buffer");
                buf.resize(min_size, 0);
                buf
            }
            None => {
                trace!(min_size, "pool empty, allocating buffer");
                vec![0u8; min_size]
            }
        }
    }

    fn return_buffer(&mut self, mut buf: Vec<u8>) {
        if self.free.len() < self.max_retained {
            buf.clear();
            self.free.push(buf);
        } else {
            trace!("pool full, discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_buffer_len() {
        let mut pool = PooledBufferFactory::default();
        let buf = pool.get_buffer(100);
        assert_eq!(buf.len(), 100);
    }

    #[test]
    fn test_recycles_returned_buffer() {
        let mut pool = PooledBufferFactory::default();
        let buf = pool.get_buffer(64);
        pool.return_buffer(buf);
        assert_eq!(pool.free_count(), 1);

        let again = pool.get_buffer(32);
        assert_eq!(again.len(), 32);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_recycled_buffer_grows() {
        let mut pool = PooledBufferFactory::default();
        pool.return_buffer(vec![1, 2, 3]);

        let buf = pool.get_buffer(10);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_retention_cap() {
        let mut pool = PooledBufferFactory::new(2);
        pool.return_buffer(vec![0; 8]);
        pool.return_buffer(vec![0; 8]);
        pool.return_buffer(vec![0; 8]);
        assert_eq!(pool.free_count(), 2);
    }
}
