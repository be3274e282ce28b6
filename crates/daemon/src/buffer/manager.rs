//! Prefetching buffer between the encoder output and the HTTP response
//!
//! A background task pulls encoder output into the ring buffer until it is
//! filled to the prefetch ratio, then pauses until the consumer catches up.
//! Client reads wait for a minimum amount of buffered data so that short
//! stalls upstream do not turn into tiny response chunks.

use crate::buffer::retry::RetryManager;
use crate::buffer::ring::RingBuffer;
use crate::config::BufferSettings;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Size of each read from the source
pub const PREFETCH_CHUNK_SIZE: usize = 32 * 1024;

/// Pause between fill-level checks while the buffer is above the prefetch ratio
const THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

/// Polling interval of [`BufferManager::wait_for_data`]
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Per-session buffer settings
#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    pub capacity: usize,
    pub prefetch_ratio: f64,
    pub min_threshold: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub wait_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 10 * 1024 * 1024,
            prefetch_ratio: 0.8,
            min_threshold: 64 * 1024,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&BufferSettings> for BufferConfig {
    fn from(settings: &BufferSettings) -> Self {
        Self {
            capacity: settings.size_mb as usize * 1024 * 1024,
            prefetch_ratio: settings.prefetch_ratio.clamp(0.0, 1.0),
            min_threshold: settings.min_threshold_kb as usize * 1024,
            max_retries: settings.max_retries,
            retry_base_delay: Duration::from_millis(settings.retry_delay_ms),
            wait_timeout: Duration::from_secs(settings.wait_timeout_secs),
        }
    }
}

/// Error type for buffer manager operations
#[derive(Debug, Error)]
pub enum BufferError {
    /// The producer stalled without finishing
    #[error("timed out after {0:?} waiting for buffered data")]
    Timeout(Duration),

    #[error("buffer manager already started")]
    AlreadyStarted,
}

/// Outcome of [`BufferManager::wait_for_data`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataReady {
    /// Enough data is buffered, or the producer finished and a tail remains
    Ready,
    /// The producer finished and everything has been consumed
    EndOfStream,
}

/// Snapshot of buffer counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct BufferStats {
    pub bytes_buffered: u64,
    pub bytes_consumed: u64,
    pub fill_ratio: f64,
    pub underruns: u64,
    pub retries: u64,
}

/// Owns one ring buffer and the task that fills it
pub struct BufferManager {
    config: BufferConfig,
    ring: Arc<RingBuffer>,
    retry: Arc<RetryManager>,
    prefetching: Arc<AtomicBool>,
    underruns: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BufferManager {
    pub fn new(config: BufferConfig) -> Self {
        let ring = Arc::new(RingBuffer::new(config.capacity));
        let retry = Arc::new(RetryManager::new(config.max_retries, config.retry_base_delay));
        Self {
            config,
            ring,
            retry,
            prefetching: Arc::new(AtomicBool::new(false)),
            underruns: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    /// Spawn the prefetch task reading from `source` until end of stream,
    /// cancellation or an unrecoverable read error.
    pub fn start<R>(&self, cancel: CancellationToken, source: R) -> Result<(), BufferError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(BufferError::AlreadyStarted);
        }

        self.prefetching.store(true, Ordering::SeqCst);
        let prefetch = Prefetch {
            ring: self.ring.clone(),
            retry: self.retry.clone(),
            prefetching: self.prefetching.clone(),
            high_water: self.config.capacity as f64 * self.config.prefetch_ratio,
        };
        *task = Some(tokio::spawn(prefetch.run(cancel, source)));
        Ok(())
    }

    /// Wait until at least `min_threshold` bytes are buffered.
    ///
    /// Once the producer has stopped, any remaining tail is reported as
    /// `Ready` and an empty buffer as `EndOfStream`. A producer that is still
    /// running but delivers too little within the wait timeout yields
    /// `BufferError::Timeout`.
    pub async fn wait_for_data(&self, min_threshold: usize) -> Result<DataReady, BufferError> {
        // a threshold the ring can never hold would always time out
        let min_threshold = min_threshold.min(self.ring.capacity() - 1);
        let deadline = Instant::now() + self.config.wait_timeout;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);

        loop {
            if self.ring.available() >= min_threshold {
                return Ok(DataReady::Ready);
            }

            // The producer writes its last chunk before it stops, so the fill
            // level must be read after the stop is observed.
            if !self.is_prefetching() || self.ring.is_closed() {
                return Ok(if self.ring.available() == 0 {
                    DataReady::EndOfStream
                } else {
                    DataReady::Ready
                });
            }

            if Instant::now() >= deadline {
                return Err(BufferError::Timeout(self.config.wait_timeout));
            }

            ticker.tick().await;
        }
    }

    /// Read buffered bytes once the minimum threshold is met.
    ///
    /// Returns 0 at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, BufferError> {
        if self.wait_for_data(self.config.min_threshold).await? == DataReady::EndOfStream {
            return Ok(0);
        }

        let n = self.ring.read(buf).await;
        if n == 0 && self.is_prefetching() {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        Ok(n)
    }

    pub fn is_prefetching(&self) -> bool {
        self.prefetching.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.ring.available()
    }

    pub fn stats(&self) -> BufferStats {
        let ring = self.ring.stats();
        BufferStats {
            bytes_buffered: ring.total_written,
            bytes_consumed: ring.total_read,
            fill_ratio: ring.available as f64 / ring.capacity as f64,
            underruns: self.underruns.load(Ordering::Relaxed),
            retries: self.retry.retry_count(),
        }
    }

    /// Close the ring buffer, unblocking the prefetch task and any reader.
    pub fn close(&self) {
        self.ring.close();
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.ring.close();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

struct Prefetch {
    ring: Arc<RingBuffer>,
    retry: Arc<RetryManager>,
    prefetching: Arc<AtomicBool>,
    high_water: f64,
}

impl Prefetch {
    async fn run<R>(self, cancel: CancellationToken, mut source: R)
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut scratch = vec![0u8; PREFETCH_CHUNK_SIZE];

        loop {
            let available = self.ring.available();
            if available > 0 && available as f64 >= self.high_water {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(THROTTLE_INTERVAL) => continue,
                }
            }

            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.retry.retry_read(&mut source, &mut scratch) => read,
            };

            match read {
                Ok(0) => {
                    debug!("prefetch source reached end of stream");
                    break;
                }
                Ok(n) => {
                    let written = tokio::select! {
                        _ = cancel.cancelled() => break,
                        written = self.ring.write(&scratch[..n]) => written,
                    };
                    if written.is_err() {
                        debug!("ring buffer closed, stopping prefetch");
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "prefetch read failed");
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            debug!("prefetch cancelled");
        }
        self.prefetching.store(false, Ordering::SeqCst);
        self.ring.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    /// Endless source returning a full chunk on every read and counting reads.
    struct CountingSource {
        reads: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingSource {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let n = buf.remaining().min(PREFETCH_CHUNK_SIZE);
            buf.put_slice(&vec![0xAB; n]);
            Poll::Ready(Ok(()))
        }
    }

    /// Fails the first `failures` reads, then behaves like a cursor.
    struct FlakySource {
        failures: u32,
        inner: io::Cursor<Vec<u8>>,
    }

    impl AsyncRead for FlakySource {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.failures > 0 {
                self.failures -= 1;
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "glitch")));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    fn small_config() -> BufferConfig {
        BufferConfig {
            capacity: 256 * 1024,
            prefetch_ratio: 0.8,
            min_threshold: 64 * 1024,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            wait_timeout: Duration::from_secs(5),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    async fn drain(manager: &BufferManager) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = manager.read(&mut buf).await.unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_prefetch_throttles_at_ratio_and_resumes() {
        let reads = Arc::new(AtomicUsize::new(0));
        let config = BufferConfig {
            capacity: 10 * 1024 * 1024,
            ..small_config()
        };
        let manager = BufferManager::new(config);
        manager
            .start(
                CancellationToken::new(),
                CountingSource {
                    reads: reads.clone(),
                },
            )
            .unwrap();

        let high_water = 8 * 1024 * 1024;
        assert!(wait_until(|| manager.available() >= high_water, Duration::from_secs(5)).await);

        // throttled: no further reads while at the high-water mark
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.available(), high_water);
        assert_eq!(reads.load(Ordering::SeqCst), high_water / PREFETCH_CHUNK_SIZE);

        // consuming drops the level below the mark and prefetch resumes
        let mut buf = vec![0u8; PREFETCH_CHUNK_SIZE];
        for _ in 0..32 {
            manager.read(&mut buf).await.unwrap();
        }
        let before = high_water / PREFETCH_CHUNK_SIZE;
        assert!(wait_until(|| reads.load(Ordering::SeqCst) > before, Duration::from_secs(2)).await);
        assert!(wait_until(|| manager.available() >= high_water, Duration::from_secs(5)).await);
        assert!(manager.available() < high_water + PREFETCH_CHUNK_SIZE);

        manager.close();
    }

    #[tokio::test]
    async fn test_wait_for_data_ready_while_producer_running() {
        let (mut writer, reader) = tokio::io::duplex(128 * 1024);
        let manager = BufferManager::new(small_config());
        manager.start(CancellationToken::new(), reader).unwrap();

        writer.write_all(&vec![7u8; 100 * 1024]).await.unwrap();

        let ready = manager.wait_for_data(64 * 1024).await.unwrap();
        assert_eq!(ready, DataReady::Ready);
        assert!(manager.is_prefetching());

        drop(writer);
    }

    #[tokio::test]
    async fn test_wait_for_data_end_of_stream_after_drain() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let manager = BufferManager::new(small_config());
        manager
            .start(CancellationToken::new(), io::Cursor::new(data.clone()))
            .unwrap();

        assert_eq!(drain(&manager).await, data);
        assert!(!manager.is_prefetching());
        assert_eq!(
            manager.wait_for_data(64 * 1024).await.unwrap(),
            DataReady::EndOfStream
        );
    }

    #[tokio::test]
    async fn test_tail_below_threshold_is_delivered() {
        let manager = BufferManager::new(small_config());
        manager
            .start(CancellationToken::new(), io::Cursor::new(b"short tail".to_vec()))
            .unwrap();

        assert_eq!(drain(&manager).await, b"short tail".to_vec());
    }

    #[tokio::test]
    async fn test_stopped_producer_with_buffered_tail_is_ready() {
        // State left behind by a producer that wrote its last chunk and stopped
        let manager = BufferManager::new(small_config());
        manager.ring.write(b"last chunk").await.unwrap();
        manager.prefetching.store(false, Ordering::SeqCst);
        manager.ring.close();

        let ready = manager.wait_for_data(1024).await.unwrap();
        assert_eq!(ready, DataReady::Ready);

        let mut buf = [0u8; 64];
        let n = manager.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"last chunk");
        assert_eq!(manager.read(&mut buf).await.unwrap(), 0);
        assert_eq!(manager.wait_for_data(1).await.unwrap(), DataReady::EndOfStream);
    }

    #[tokio::test]
    async fn test_wait_for_data_times_out_on_stalled_producer() {
        let (writer, reader) = tokio::io::duplex(1024);
        let config = BufferConfig {
            wait_timeout: Duration::from_millis(50),
            ..small_config()
        };
        let manager = BufferManager::new(config);
        manager.start(CancellationToken::new(), reader).unwrap();

        let result = manager.wait_for_data(1024).await;
        assert!(matches!(result, Err(BufferError::Timeout(_))));

        drop(writer);
    }

    #[tokio::test]
    async fn test_cancellation_stops_prefetch_and_unblocks_reader() {
        let (_writer, reader) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let manager = Arc::new(BufferManager::new(small_config()));
        manager.start(cancel.clone(), reader).unwrap();

        let consumer = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                manager.read(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        assert_eq!(consumer.await.unwrap().unwrap(), 0);
        assert!(!manager.is_prefetching());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_and_counted() {
        let manager = BufferManager::new(small_config());
        let source = FlakySource {
            failures: 2,
            inner: io::Cursor::new(b"after glitches".to_vec()),
        };
        manager.start(CancellationToken::new(), source).unwrap();

        assert_eq!(drain(&manager).await, b"after glitches".to_vec());

        let stats = manager.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.bytes_buffered, 14);
        assert_eq!(stats.bytes_consumed, 14);
        assert_eq!(stats.fill_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let manager = BufferManager::new(small_config());
        manager
            .start(CancellationToken::new(), io::Cursor::new(Vec::new()))
            .unwrap();
        let second = manager.start(CancellationToken::new(), io::Cursor::new(Vec::new()));
        assert!(matches!(second, Err(BufferError::AlreadyStarted)));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = BufferSettings::default();
        let config = BufferConfig::from(&settings);
        assert_eq!(config, BufferConfig::default());
    }
}
