//! Chunk sources
//!
//! A source hands out an ordered, lazy sequence of chunks. Reads only happen
//! inside [`ChunkSource::next_chunk`], so a paused source performs no I/O:
//! a paused file stops reading and a paused socket stops draining the OS
//! receive buffer, which pushes backpressure upstream onto the peer.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use log::{debug, info};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::{Result, StreamError};
use super::events::{EventBus, SourceEvent};
use super::types::{Chunk, StreamState};

/// Default read size, matches a 16 KiB high-water mark
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Producer side of a pipeline link
#[async_trait]
pub trait ChunkSource: Send {
    /// Pull the next chunk; `Ok(None)` is the single graceful end of stream
    ///
    /// Fails with [`StreamError::ClosedSource`] once the source ended, errored
    /// or closed, and with [`StreamError::PausedSource`] while paused.
    async fn next_chunk(&mut self) -> Result<Option<Chunk>>;

    /// Stop delivering chunks until `resume()`
    fn pause(&mut self);

    fn resume(&mut self);

    fn state(&self) -> StreamState;

    fn events(&self) -> &EventBus<SourceEvent>;

    /// Release the underlying resource
    async fn close(&mut self);

    /// Get the name of this source for logging
    fn name(&self) -> &'static str;
}

/// State bookkeeping shared by every source implementation
#[derive(Debug)]
pub struct SourceCore {
    name: &'static str,
    state: StreamState,
    events: EventBus<SourceEvent>,
}

impl SourceCore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: StreamState::Idle,
            events: EventBus::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn events(&self) -> &EventBus<SourceEvent> {
        &self.events
    }

    /// Guard for `next_chunk`
    pub fn check_readable(&self) -> Result<()> {
        match self.state {
            s if s.is_terminal() => Err(StreamError::ClosedSource),
            StreamState::Paused => Err(StreamError::PausedSource),
            _ => Ok(()),
        }
    }

    pub fn deliver(&mut self, chunk: Chunk) -> Option<Chunk> {
        self.state = StreamState::Flowing;
        self.events.emit(&SourceEvent::Data { size: chunk.len() });
        Some(chunk)
    }

    pub fn end(&mut self) {
        self.state = StreamState::Ended;
        info!("{}: end of stream", self.name);
        self.events.emit(&SourceEvent::Ended);
    }

    /// Move to Errored and build the error handed back to the caller
    pub fn fail(&mut self, message: String) -> StreamError {
        self.state = StreamState::Errored;
        debug!("{}: failed: {}", self.name, message);
        self.events
            .emit(&SourceEvent::Errored(Arc::new(StreamError::Source(
                message.clone(),
            ))));
        StreamError::Source(message)
    }

    pub fn pause(&mut self) {
        if matches!(self.state, StreamState::Idle | StreamState::Flowing) {
            self.state = StreamState::Paused;
            self.events.emit(&SourceEvent::Paused);
        }
    }

    pub fn resume(&mut self) {
        if self.state == StreamState::Paused {
            self.state = StreamState::Flowing;
            self.events.emit(&SourceEvent::Resumed);
        }
    }

    pub fn close(&mut self) {
        if self.state != StreamState::Closed {
            self.state = StreamState::Closed;
            self.events.emit(&SourceEvent::Closed);
        }
    }
}

/// Source over any async reader: a file, a socket, a request body
pub struct ReaderSource<R> {
    reader: Option<R>,
    chunk_size: usize,
    core: SourceCore,
}

/// Source reading a file from disk
pub type FileSource = ReaderSource<tokio::fs::File>;

impl<R> ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self::named("ReaderSource", reader, chunk_size)
    }

    pub fn named(name: &'static str, reader: R, chunk_size: usize) -> Self {
        Self {
            reader: Some(reader),
            chunk_size: chunk_size.max(1),
            core: SourceCore::new(name),
        }
    }
}

impl ReaderSource<tokio::fs::File> {
    /// Open a file for chunked reading
    pub async fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            StreamError::Source(format!("cannot open {}: {}", path.display(), e))
        })?;
        info!("FileSource: reading {}", path.display());
        Ok(Self::named("FileSource", file, chunk_size))
    }
}

#[async_trait]
impl<R> ChunkSource for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        self.core.check_readable()?;
        let reader = self.reader.as_mut().ok_or(StreamError::ClosedSource)?;

        let mut buf = vec![0u8; self.chunk_size];
        match reader.read(&mut buf).await {
            Ok(0) => {
                self.core.end();
                Ok(None)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(self.core.deliver(Chunk::from(buf)))
            }
            Err(e) => Err(self.core.fail(e.to_string())),
        }
    }

    fn pause(&mut self) {
        self.core.pause();
    }

    fn resume(&mut self) {
        self.core.resume();
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

    fn events(&self) -> &EventBus<SourceEvent> {
        self.core.events()
    }

    async fn close(&mut self) {
        self.reader.take();
        self.core.close();
    }

    fn name(&self) -> &'static str {
        self.core.name
    }
}

/// Source over a stream of byte buffers, e.g. an inbound request body
pub struct StreamSource<S> {
    stream: Option<S>,
    core: SourceCore,
}

impl<S> StreamSource<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            core: SourceCore::new("StreamSource"),
        }
    }
}

#[async_trait]
impl<S> ChunkSource for StreamSource<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
{
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        self.core.check_readable()?;
        let stream = self.stream.as_mut().ok_or(StreamError::ClosedSource)?;

        loop {
            return match stream.next().await {
                // empty buffers carry no data; keep pulling
                Some(Ok(bytes)) if bytes.is_empty() => continue,
                Some(Ok(bytes)) => Ok(self.core.deliver(Chunk::from(bytes))),
                Some(Err(e)) => Err(self.core.fail(e.to_string())),
                None => {
                    self.core.end();
                    Ok(None)
                }
            };
        }
    }

    fn pause(&mut self) {
        self.core.pause();
    }

    fn resume(&mut self) {
        self.core.resume();
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

    fn events(&self) -> &EventBus<SourceEvent> {
        self.core.events()
    }

    async fn close(&mut self) {
        self.stream.take();
        self.core.close();
    }

    fn name(&self) -> &'static str {
        self.core.name
    }
}

/// In-memory source, optionally failing once its chunks run out
pub struct MemorySource {
    chunks: VecDeque<Chunk>,
    failure: Option<String>,
    core: SourceCore,
}

impl MemorySource {
    pub fn from_chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Chunk>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            failure: None,
            core: SourceCore::new("MemorySource"),
        }
    }

    /// Split `data` into chunks of at most `chunk_size` bytes
    pub fn split(data: impl Into<Bytes>, chunk_size: usize) -> Self {
        let data: Bytes = data.into();
        let size = chunk_size.max(1);
        let chunks = (0..data.len())
            .step_by(size)
            .map(|start| Chunk::from(data.slice(start..(start + size).min(data.len()))));
        Self::from_chunks(chunks)
    }

    /// Fail with a source error instead of ending gracefully
    pub fn failing_with(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Chunks not yet handed out
    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        self.core.check_readable()?;
        // yield so a memory source interleaves like real I/O
        tokio::task::yield_now().await;

        match self.chunks.pop_front() {
            Some(chunk) => Ok(self.core.deliver(chunk)),
            None => match self.failure.take() {
                Some(message) => Err(self.core.fail(message)),
                None => {
                    self.core.end();
                    Ok(None)
                }
            },
        }
    }

    fn pause(&mut self) {
        self.core.pause();
    }

    fn resume(&mut self) {
        self.core.resume();
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

    fn events(&self) -> &EventBus<SourceEvent> {
        self.core.events()
    }

    async fn close(&mut self) {
        self.chunks.clear();
        self.core.close();
    }

    fn name(&self) -> &'static str {
        self.core.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_memory_source_ends_once() {
        let mut source = MemorySource::from_chunks(["a", "b"]);
        let ended = Arc::new(Mutex::new(0));
        let counter = ended.clone();
        source.events().on(move |e| {
            if matches!(e, SourceEvent::Ended) {
                *counter.lock().unwrap() += 1;
            }
        });

        assert_eq!(source.next_chunk().await.unwrap(), Some(Chunk::from("a")));
        assert_eq!(source.next_chunk().await.unwrap(), Some(Chunk::from("b")));
        assert_eq!(source.next_chunk().await.unwrap(), None);
        assert_eq!(source.state(), StreamState::Ended);
        assert!(matches!(
            source.next_chunk().await,
            Err(StreamError::ClosedSource)
        ));
        assert_eq!(*ended.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_paused_source_keeps_chunks() {
        let mut source = MemorySource::from_chunks(["a", "b"]);
        source.pause();
        assert_eq!(source.state(), StreamState::Paused);
        assert!(matches!(
            source.next_chunk().await,
            Err(StreamError::PausedSource)
        ));
        assert_eq!(source.remaining(), 2);

        source.resume();
        assert_eq!(source.next_chunk().await.unwrap(), Some(Chunk::from("a")));
    }

    #[tokio::test]
    async fn test_failing_source() {
        let mut source = MemorySource::from_chunks(["a"]).failing_with("disk gone");
        assert!(source.next_chunk().await.unwrap().is_some());
        let err = source.next_chunk().await.unwrap_err();
        assert!(matches!(err, StreamError::Source(ref m) if m == "disk gone"));
        assert_eq!(source.state(), StreamState::Errored);
        assert!(matches!(
            source.next_chunk().await,
            Err(StreamError::ClosedSource)
        ));
    }

    #[test]
    fn test_split_boundaries() {
        let source = MemorySource::split("abcdefg", 3);
        let sizes: Vec<usize> = source.chunks.iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_reader_source_chunk_size() {
        let data: &[u8] = b"0123456789";
        let mut source = ReaderSource::new(data, 4);

        let mut sizes = Vec::new();
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(source.state(), StreamState::Ended);
    }

    #[tokio::test]
    async fn test_stream_source() {
        let parts: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"c")),
        ];
        let mut source = StreamSource::new(futures_util::stream::iter(parts));

        assert_eq!(source.next_chunk().await.unwrap(), Some(Chunk::from("ab")));
        assert_eq!(source.next_chunk().await.unwrap(), Some(Chunk::from("c")));
        assert_eq!(source.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_releases_reader() {
        let data: &[u8] = b"abc";
        let mut source = ReaderSource::new(data, 2);
        source.close().await;
        assert_eq!(source.state(), StreamState::Closed);
        assert!(matches!(
            source.next_chunk().await,
            Err(StreamError::ClosedSource)
        ));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let missing = std::env::temp_dir().join("linepipe-definitely-missing.ndjson");
        let err = FileSource::open(&missing, 16).await.err().unwrap();
        assert!(matches!(err, StreamError::Source(_)));
    }
}
