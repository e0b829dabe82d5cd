//! Capture and playback loops.
//!
//! Capture reads fixed-size chunks at the real-time rate and hands them to
//! an [`AudioOutlet`]. Playback drains a bounded [`PlaybackQueue`] into a
//! sink; when the sink stalls the queue drops its oldest chunk so latency
//! stays bounded.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AudioSink, AudioSource};
use crate::core::{AudioConfig, Error, Result};

/// Where captured chunks go
pub trait AudioOutlet: Send + Sync + 'static {
    fn send_chunk(&self, chunk: Bytes, cancel: &CancellationToken) -> impl Future<Output = Result<()>> + Send;
}

/// Bounded FIFO between the receive path and the playback sink
#[derive(Debug)]
pub struct PlaybackQueue {
    chunks: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    ready: Notify,
    dropped: AtomicU64,
}

impl PlaybackQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        PlaybackQueue {
            chunks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends a chunk, evicting the oldest when full.
    ///
    /// Returns true if a chunk was evicted.
    pub fn push(&self, chunk: Bytes) -> bool {
        let evicted = {
            let mut chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if chunks.len() >= self.capacity {
                chunks.pop_front().is_some()
            } else {
                false
            };
            chunks.push_back(chunk);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<Bytes> {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Waits for the next chunk
    pub async fn pop(&self) -> Bytes {
        loop {
            let notified = self.ready.notified();
            if let Some(chunk) = self.try_pop() {
                return chunk;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunks evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Reads the source at the real-time rate until cancelled or exhausted.
///
/// Returns the number of chunks delivered to the outlet.
pub async fn capture_loop<S, O>(
    mut source: S,
    outlet: O,
    config: AudioConfig,
    cancel: CancellationToken,
) -> Result<u64>
where
    S: AudioSource,
    O: AudioOutlet,
{
    source.start()?;

    let mut ticker = interval(config.chunk_duration().max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut delivered = 0u64;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            _ = ticker.tick() => {}
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            read = source.read_chunk(config.chunk_bytes) => read,
        };

        match read {
            Ok(Some(chunk)) if chunk.is_empty() => continue,
            Ok(Some(chunk)) => match outlet.send_chunk(chunk, &cancel).await {
                Ok(()) => delivered += 1,
                Err(Error::Cancelled) => break Ok(()),
                Err(e) => break Err(e),
            },
            Ok(None) => {
                debug!("audio source exhausted");
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };

    source.stop();
    match &outcome {
        Ok(()) => info!(chunks = delivered, "capture stopped"),
        Err(e) => warn!(chunks = delivered, error = %e, "capture failed"),
    }
    outcome.map(|()| delivered)
}

/// Drains the queue into the sink until cancelled.
///
/// Returns the number of chunks written.
pub async fn playback_loop<K>(mut sink: K, queue: &PlaybackQueue, cancel: CancellationToken) -> Result<u64>
where
    K: AudioSink,
{
    sink.start()?;
    let mut written = 0u64;

    let outcome = loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            chunk = queue.pop() => chunk,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            result = sink.write_chunk(chunk) => result,
        };
        match result {
            Ok(()) => written += 1,
            Err(e) => break Err(e),
        }
    };

    sink.stop();
    match &outcome {
        Ok(()) => info!(chunks = written, dropped = queue.dropped(), "playback stopped"),
        Err(e) => warn!(chunks = written, error = %e, "playback failed"),
    }
    outcome.map(|()| written)
}
