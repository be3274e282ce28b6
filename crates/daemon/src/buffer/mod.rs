//! Producer/consumer buffering between the encoder and the client

pub mod manager;
pub mod retry;
pub mod ring;

pub use manager::{BufferConfig, BufferError, BufferManager, BufferStats, DataReady};
pub use retry::{RetryError, RetryManager, BACKOFF_FACTOR};
pub use ring::{RingBuffer, RingBufferError, RingStats};
