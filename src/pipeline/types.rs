//! Core types for the pipeline system

use bytes::Bytes;
use std::ops::Deref;

/// An immutable run of bytes handed from one stage to the next
///
/// A chunk has no identity beyond its position in the stream. Cloning is
/// cheap (reference counted), but the pipeline only ever hands a chunk to a
/// single consumer at a time.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Chunk {
    data: Bytes,
}

impl Chunk {
    /// Create a chunk from any byte buffer
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Get the size of the chunk in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the payload
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Give back the underlying buffer
    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Lossy text view, for logging only
    pub fn to_text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Bytes> for Chunk {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<String> for Chunk {
    fn from(data: String) -> Self {
        Self::new(data)
    }
}

impl From<&'static str> for Chunk {
    fn from(data: &'static str) -> Self {
        Self::new(Bytes::from_static(data.as_bytes()))
    }
}

impl From<&'static [u8]> for Chunk {
    fn from(data: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(data))
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk").field("size", &self.len()).finish()
    }
}

/// Lifecycle state of a single source or sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, nothing read or written yet
    Idle,
    /// Actively producing or accepting data
    Flowing,
    /// Production suspended until `resume()`
    Paused,
    /// Sink buffer above its high-water mark, waiting to drain
    Draining,
    /// Source reached end of stream, or sink finished flushing
    Ended,
    /// Fatal error, no further use permitted
    Errored,
    /// Underlying resource released
    Closed,
}

impl StreamState {
    /// Ended, Errored and Closed never transition anywhere else
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Ended | StreamState::Errored | StreamState::Closed
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            StreamState::Idle => "Idle",
            StreamState::Flowing => "Flowing",
            StreamState::Paused => "Paused",
            StreamState::Draining => "Draining",
            StreamState::Ended => "Ended",
            StreamState::Errored => "Errored",
            StreamState::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
