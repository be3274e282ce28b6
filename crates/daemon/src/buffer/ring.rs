//! Fixed-capacity byte ring buffer
//!
//! One producer task writes and one consumer task reads. Both sides suspend
//! instead of failing: `write` waits for free space and `read` waits for data.
//! One byte of storage is never used, so equal cursors always mean "empty".

use parking_lot::Mutex;
use std::pin::pin;
use thiserror::Error;
use tokio::sync::Notify;

/// Error type for ring buffer operations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("ring buffer is closed")]
    Closed,
}

/// Counters exposed for statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    pub capacity: usize,
    pub available: usize,
    pub total_written: u64,
    pub total_read: u64,
    pub closed: bool,
}

struct RingState {
    data: Box<[u8]>,
    write_pos: usize,
    read_pos: usize,
    total_written: u64,
    total_read: u64,
    closed: bool,
}

impl RingState {
    fn available(&self) -> usize {
        let cap = self.data.len();
        (self.write_pos + cap - self.read_pos) % cap
    }

    fn free(&self) -> usize {
        self.data.len() - self.available() - 1
    }

    /// Copy as much of `src` as fits, in at most two slices.
    fn push(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.free());
        if n == 0 {
            return 0;
        }

        let cap = self.data.len();
        let first = n.min(cap - self.write_pos);
        self.data[self.write_pos..self.write_pos + first].copy_from_slice(&src[..first]);
        self.data[..n - first].copy_from_slice(&src[first..n]);

        self.write_pos = (self.write_pos + n) % cap;
        self.total_written += n as u64;
        n
    }

    fn pop(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.available());
        if n == 0 {
            return 0;
        }

        let cap = self.data.len();
        let first = n.min(cap - self.read_pos);
        dst[..first].copy_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        dst[first..n].copy_from_slice(&self.data[..n - first]);

        self.read_pos = (self.read_pos + n) % cap;
        self.total_read += n as u64;
        n
    }
}

/// Thread-safe byte ring buffer with suspending read and write
pub struct RingBuffer {
    state: Mutex<RingState>,
    changed: Notify,
}

impl RingBuffer {
    /// Create a buffer holding `capacity` bytes of storage.
    ///
    /// At most `capacity - 1` bytes can be buffered at once. Capacities below 2
    /// are raised to 2.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            state: Mutex::new(RingState {
                data: vec![0u8; capacity].into_boxed_slice(),
                write_pos: 0,
                read_pos: 0,
                total_written: 0,
                total_read: 0,
                closed: false,
            }),
            changed: Notify::new(),
        }
    }

    /// Write all of `src`, waiting for free space as needed.
    ///
    /// Returns `Closed` if the buffer is closed before every byte is stored.
    pub async fn write(&self, src: &[u8]) -> Result<usize, RingBufferError> {
        let mut written = 0;

        while written < src.len() {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();

            let stored = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(RingBufferError::Closed);
                }
                state.push(&src[written..])
            };

            if stored > 0 {
                written += stored;
                self.changed.notify_waiters();
            } else {
                notified.await;
            }
        }

        Ok(written)
    }

    /// Read up to `dst.len()` bytes, waiting while the buffer is empty.
    ///
    /// Returns 0 once the buffer is closed and drained.
    pub async fn read(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }

        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();

            let (taken, closed) = {
                let mut state = self.state.lock();
                (state.pop(dst), state.closed)
            };

            if taken > 0 {
                self.changed.notify_waiters();
                return taken;
            }
            if closed {
                return 0;
            }
            notified.await;
        }
    }

    /// Bytes currently buffered
    pub fn available(&self) -> usize {
        self.state.lock().available()
    }

    /// Bytes that can be written without waiting
    pub fn free(&self) -> usize {
        self.state.lock().free()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Mark the buffer closed and wake every waiter. Safe to call repeatedly.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_waiters();
    }

    pub fn stats(&self) -> RingStats {
        let state = self.state.lock();
        RingStats {
            capacity: state.data.len(),
            available: state.available(),
            total_written: state.total_written,
            total_read: state.total_read,
            closed: state.closed,
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer").field("stats", &self.stats()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    enum Op {
        Write(Vec<u8>),
        Read(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 1..48).prop_map(Op::Write),
            (1usize..48).prop_map(Op::Read),
        ]
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    // Bytes come out in the order they went in, across any number of
    // wrap-arounds, and available + free always equals capacity - 1.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_fifo_order_across_wraparound(
            capacity in 2usize..64,
            ops in proptest::collection::vec(op_strategy(), 1..200),
        ) {
            let rt = runtime();
            let ring = RingBuffer::new(capacity);
            let mut model: VecDeque<u8> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Write(bytes) => {
                        // Only writes that fit, so the single task never suspends
                        if bytes.len() <= ring.free() {
                            let n = rt.block_on(ring.write(&bytes)).unwrap();
                            prop_assert_eq!(n, bytes.len());
                            model.extend(bytes);
                        }
                    }
                    Op::Read(len) => {
                        if ring.available() > 0 {
                            let mut buf = vec![0u8; len];
                            let n = rt.block_on(ring.read(&mut buf));
                            let expected: Vec<u8> = model.drain(..n).collect();
                            prop_assert_eq!(&buf[..n], &expected[..]);
                        }
                    }
                }

                prop_assert_eq!(ring.available(), model.len());
                prop_assert_eq!(ring.available() + ring.free(), capacity - 1);
            }

            // drain whatever is left
            ring.close();
            let mut rest = Vec::new();
            let mut buf = [0u8; 16];
            loop {
                let n = rt.block_on(ring.read(&mut buf));
                if n == 0 {
                    break;
                }
                rest.extend_from_slice(&buf[..n]);
            }
            prop_assert_eq!(rest, model.into_iter().collect::<Vec<u8>>());
        }
    }

    #[tokio::test]
    async fn test_one_byte_is_reserved() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.free(), 7);

        ring.write(&[1, 2, 3, 4, 5, 6, 7]).await.unwrap();
        assert_eq!(ring.available(), 7);
        assert_eq!(ring.free(), 0);
    }

    #[tokio::test]
    async fn test_wraparound_write_and_read() {
        let ring = RingBuffer::new(8);
        let mut buf = [0u8; 8];

        ring.write(&[1, 2, 3, 4, 5]).await.unwrap();
        assert_eq!(ring.read(&mut buf[..4]).await, 4);

        // write cursor wraps past the end of storage
        ring.write(&[6, 7, 8, 9, 10, 11]).await.unwrap();
        assert_eq!(ring.available(), 7);

        let n = ring.read(&mut buf).await;
        assert_eq!(&buf[..n], &[5, 6, 7, 8, 9, 10, 11]);
    }

    #[tokio::test]
    async fn test_read_waits_for_writer() {
        let ring = Arc::new(RingBuffer::new(16));
        let reader = {
            let ring = ring.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                let n = ring.read(&mut buf).await;
                buf[..n].to_vec()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        ring.write(b"abc").await.unwrap();
        assert_eq!(reader.await.unwrap(), b"abc".to_vec());
    }

    #[tokio::test]
    async fn test_write_waits_while_full() {
        let ring = Arc::new(RingBuffer::new(4));
        ring.write(&[1, 2, 3]).await.unwrap();

        let writer = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.write(&[4, 5]).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        let mut buf = [0u8; 2];
        assert_eq!(ring.read(&mut buf).await, 2);
        assert_eq!(writer.await.unwrap(), Ok(2));

        let mut buf = [0u8; 4];
        let n = ring.read(&mut buf).await;
        assert_eq!(&buf[..n], &[3, 4, 5]);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let ring = Arc::new(RingBuffer::new(16));
        let reader = {
            let ring = ring.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                ring.read(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ring.close();
        assert_eq!(reader.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_writer() {
        let ring = Arc::new(RingBuffer::new(4));
        ring.write(&[1, 2, 3]).await.unwrap();

        let writer = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.write(&[4]).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ring.close();
        assert_eq!(writer.await.unwrap(), Err(RingBufferError::Closed));
    }

    #[tokio::test]
    async fn test_closed_buffer_drains_before_eof() {
        let ring = RingBuffer::new(16);
        ring.write(b"tail").await.unwrap();
        ring.close();
        ring.close();

        assert_eq!(ring.write(b"x").await, Err(RingBufferError::Closed));

        let mut buf = [0u8; 16];
        assert_eq!(ring.read(&mut buf).await, 4);
        assert_eq!(ring.read(&mut buf).await, 0);

        let stats = ring.stats();
        assert_eq!(stats.total_written, 4);
        assert_eq!(stats.total_read, 4);
        assert!(stats.closed);
    }
}
