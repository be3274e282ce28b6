//! Exponential-backoff wrapper around a single read

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

/// Multiplier applied to the delay after each failed attempt
pub const BACKOFF_FACTOR: f32 = 1.5;

/// Error type for retried reads
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("read failed after {retries} retries: {source}")]
    Exhausted {
        retries: u32,
        #[source]
        source: io::Error,
    },
}

/// Retries failed reads with a growing delay between attempts
#[derive(Debug)]
pub struct RetryManager {
    max_retries: u32,
    base_delay: Duration,
    backoff_factor: f32,
    retries: AtomicU64,
}

impl RetryManager {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor: BACKOFF_FACTOR,
            retries: AtomicU64::new(0),
        }
    }

    /// Delays between attempts: `max_retries` steps growing from the base
    /// delay by the backoff factor, without jitter or a ceiling
    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_factor(self.backoff_factor)
            .without_max_delay()
            .with_max_times(self.max_retries as usize)
            .build()
    }

    /// Read once from `source` into `buf`, retrying on error.
    ///
    /// A successful read, including the zero-length read that signals end of
    /// stream, returns immediately and consumes no retry.
    pub async fn retry_read<R>(&self, source: &mut R, buf: &mut [u8]) -> Result<usize, RetryError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut delays = self.schedule();
        let mut attempt = 0;

        loop {
            match source.read(buf).await {
                Ok(n) => return Ok(n),
                Err(e) => {
                    let Some(delay) = delays.next() else {
                        return Err(RetryError::Exhausted {
                            retries: attempt,
                            source: e,
                        });
                    };
                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "read failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Total retries performed across all reads
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}
