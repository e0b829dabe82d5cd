//! Audio capture and playback
//!
//! Devices are abstract: the pump reads PCM chunks from an [`AudioSource`]
//! and writes inbound audio to an [`AudioSink`]. Device selection and
//! codecs belong to the embedding application.

use std::future::Future;

use bytes::Bytes;

use crate::core::Result;

pub mod pump;

pub use self::pump::{capture_loop, playback_loop, AudioOutlet, PlaybackQueue};

/// Something that produces PCM chunks, such as a microphone
pub trait AudioSource: Send + 'static {
    /// Opens the device
    fn start(&mut self) -> Result<()>;

    /// Reads up to `len` bytes. `Ok(None)` means the source is exhausted.
    fn read_chunk(&mut self, len: usize) -> impl Future<Output = Result<Option<Bytes>>> + Send;

    /// Releases the device
    fn stop(&mut self);
}

/// Something that consumes PCM chunks, such as a speaker
pub trait AudioSink: Send + 'static {
    /// Opens the device
    fn start(&mut self) -> Result<()>;

    /// Writes one chunk, waiting while the device is busy
    fn write_chunk(&mut self, chunk: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Releases the device
    fn stop(&mut self);
}
