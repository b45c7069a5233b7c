use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::TransferError;

/// Fallible stream of body chunks, the unit of transfer everywhere in this
/// crate.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// Thread-safe byte accumulator. Cloned freely; all clones observe the same
/// total, so a caller can hand one side to a tee and read the count after the
/// copy completes.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter {
    total: Arc<AtomicU64>,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Wrap a stream so every chunk that passes through is added to `counter`.
pub fn counted(stream: ByteStream, counter: ByteCounter) -> ByteStream {
    Box::pin(stream.inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            counter.add(bytes.len() as u64);
        }
    }))
}
