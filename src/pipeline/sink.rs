//! Chunk sinks
//!
//! A sink accepts chunks through a capacity-bounded `write` that reports
//! backpressure instead of blocking:
//! - `write` returns `false` once buffered bytes reach the high-water mark
//! - `drained()` resolves when the buffer falls back to the low-water mark
//! - `end()` flushes everything, then emits `Finish` and `Close`
//! - `abort()` tears the sink down without ever emitting `Finish`

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::error::{Result, StreamError};
use super::events::{EventBus, SinkEvent};
use super::types::{Chunk, StreamState};

/// What a sink does when a write would exceed `max_buffered_bytes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Writers suspend on the drain signal; the limit is never reached
    #[default]
    Block,
    /// Writers ignore the advisory `false`; crossing the limit is fatal
    Fail,
}

/// Sink buffering configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Buffered bytes at which `write` starts returning false
    pub high_water_mark: usize,
    /// Buffered bytes at or below which `Drain` fires
    pub low_water_mark: usize,
    /// Hard cap, only enforced under `OverflowPolicy::Fail`
    pub max_buffered_bytes: usize,
    pub overflow: OverflowPolicy,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 16 * 1024,
            low_water_mark: 0,
            max_buffered_bytes: 1024 * 1024,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Consumer side of a pipeline link
#[async_trait]
pub trait ChunkSink: Send {
    /// Queue a chunk; `Ok(false)` means stop producing until `drained()`
    ///
    /// Fails with [`StreamError::SinkClosed`] after `end()` or an error.
    fn write(&mut self, chunk: Chunk) -> Result<bool>;

    /// Resolve once the buffer fell to the low-water mark
    async fn drained(&mut self) -> Result<()>;

    /// No more writes; flush, then finish and close
    async fn end(&mut self, last: Option<Chunk>) -> Result<()>;

    /// Error out without finishing; buffered data may be lost
    async fn abort(&mut self, cause: &StreamError);

    fn state(&self) -> StreamState;

    fn events(&self) -> &EventBus<SinkEvent>;

    /// Get the name of this sink for logging
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Default)]
struct WriterStatus {
    buffered: usize,
    needs_drain: bool,
    failure: Option<String>,
}

/// Buffered sink over any async writer
///
/// Writes are queued and flushed by a dedicated writer task, so `write`
/// itself never suspends. Must be created inside a tokio runtime.
pub struct WriterSink<W> {
    name: &'static str,
    config: SinkConfig,
    tx: Option<mpsc::UnboundedSender<Chunk>>,
    status: Arc<watch::Sender<WriterStatus>>,
    task: Option<JoinHandle<std::io::Result<W>>>,
    inner: Option<W>,
    state: StreamState,
    events: EventBus<SinkEvent>,
}

impl<W> WriterSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W, config: SinkConfig) -> Self {
        Self::named("WriterSink", writer, config)
    }

    pub fn named(name: &'static str, writer: W, config: SinkConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(WriterStatus::default());
        let status = Arc::new(status);
        let events = EventBus::new();

        let task = tokio::spawn(run_writer(
            name,
            writer,
            rx,
            status.clone(),
            config.low_water_mark,
            events.clone(),
        ));

        Self {
            name,
            config,
            tx: Some(tx),
            status,
            task: Some(task),
            inner: None,
            state: StreamState::Idle,
            events,
        }
    }

    /// Bytes accepted but not yet handed to the writer
    pub fn buffered(&self) -> usize {
        self.status.borrow().buffered
    }

    /// The writer, once `end()` completed
    pub fn into_inner(self) -> Option<W> {
        self.inner
    }

    /// Move to Errored, emitting `Error` exactly once
    fn fail(&mut self, err: StreamError) -> StreamError {
        if self.state != StreamState::Errored {
            self.state = StreamState::Errored;
            warn!("{}: {}", self.name, err);
            self.events
                .emit(&SinkEvent::Error(Arc::new(StreamError::Sink(err.to_string()))));
        }
        err
    }

    fn check_failure(&mut self) -> Result<()> {
        let failure = self.status.borrow().failure.clone();
        match failure {
            Some(message) => Err(self.fail(StreamError::Sink(message))),
            None => Ok(()),
        }
    }

    fn stop_writer(&mut self) {
        self.tx.take();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_writer<W>(
    name: &'static str,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Chunk>,
    status: Arc<watch::Sender<WriterStatus>>,
    low_water_mark: usize,
    events: EventBus<SinkEvent>,
) -> std::io::Result<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            status.send_modify(|s| s.failure = Some(e.to_string()));
            return Err(e);
        }

        let mut drained = false;
        status.send_modify(|s| {
            s.buffered = s.buffered.saturating_sub(chunk.len());
            if s.needs_drain && s.buffered <= low_water_mark {
                s.needs_drain = false;
                drained = true;
            }
        });
        if drained {
            debug!("{}: drained", name);
            events.emit(&SinkEvent::Drain);
        }
    }

    // channel closed: end() was called
    let flushed = match writer.flush().await {
        Ok(()) => writer.shutdown().await,
        Err(e) => Err(e),
    };
    if let Err(e) = flushed {
        status.send_modify(|s| s.failure = Some(e.to_string()));
        return Err(e);
    }
    Ok(writer)
}

#[async_trait]
impl<W> ChunkSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn write(&mut self, chunk: Chunk) -> Result<bool> {
        if self.state.is_terminal() {
            return Err(StreamError::SinkClosed);
        }
        self.check_failure()?;

        let len = chunk.len();
        let high_water_mark = self.config.high_water_mark;
        let buffered = self.buffered();

        if self.config.overflow == OverflowPolicy::Fail
            && buffered + len > self.config.max_buffered_bytes
        {
            self.stop_writer();
            return Err(self.fail(StreamError::BackpressureOverflow {
                buffered: buffered + len,
                limit: self.config.max_buffered_bytes,
            }));
        }

        if len == 0 {
            return Ok(buffered < high_water_mark);
        }

        // count the bytes before queueing so the writer never underflows
        let mut below = true;
        self.status.send_modify(|s| {
            s.buffered += len;
            below = s.buffered < high_water_mark;
            if !below {
                s.needs_drain = true;
            }
        });

        let sent = self.tx.as_ref().map(|tx| tx.send(chunk).is_ok());
        if sent != Some(true) {
            return Err(self.fail(StreamError::Sink("writer task stopped".into())));
        }

        self.state = if below {
            StreamState::Flowing
        } else {
            StreamState::Draining
        };
        Ok(below)
    }

    async fn drained(&mut self) -> Result<()> {
        match self.state {
            StreamState::Errored => return Err(StreamError::SinkClosed),
            s if s.is_terminal() => return Ok(()),
            _ => {}
        }

        let low_water_mark = self.config.low_water_mark;
        let mut rx = self.status.subscribe();
        let failure = rx
            .wait_for(|s| s.failure.is_some() || s.buffered <= low_water_mark)
            .await
            .ok()
            .and_then(|s| s.failure.clone());

        if let Some(message) = failure {
            return Err(self.fail(StreamError::Sink(message)));
        }
        if self.state == StreamState::Draining {
            self.state = StreamState::Flowing;
        }
        Ok(())
    }

    async fn end(&mut self, last: Option<Chunk>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(StreamError::SinkClosed);
        }
        if let Some(chunk) = last {
            self.write(chunk)?;
        }

        self.tx.take();
        // the handle stays in place until joined so `abort` can still stop the task
        let task = self.task.as_mut().ok_or(StreamError::SinkClosed)?;
        let joined = task.await;
        self.task = None;
        match joined {
            Ok(Ok(writer)) => {
                self.inner = Some(writer);
                self.state = StreamState::Ended;
                info!("{}: finished", self.name);
                self.events.emit(&SinkEvent::Finish);
                self.state = StreamState::Closed;
                self.events.emit(&SinkEvent::Close);
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(StreamError::Sink(e.to_string()))),
            Err(e) => Err(self.fail(StreamError::Sink(e.to_string()))),
        }
    }

    async fn abort(&mut self, cause: &StreamError) {
        if self.state.is_terminal() {
            return;
        }
        self.stop_writer();
        self.fail(StreamError::Sink(format!("aborted: {}", cause)));
        self.events.emit(&SinkEvent::Close);
    }

    fn state(&self) -> StreamState {
        self.state
    }

    fn events(&self) -> &EventBus<SinkEvent> {
        &self.events
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Shared view into a [`MemorySink`], usable after the sink moved into a pipeline
#[derive(Debug, Clone, Default)]
pub struct MemoryContents {
    chunks: Arc<Mutex<Vec<Chunk>>>,
}

impl MemoryContents {
    pub fn chunks(&self) -> Vec<Chunk> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.lock()
            .iter()
            .flat_map(|c| c.as_bytes().iter().copied())
            .collect()
    }

    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Chunk>> {
        self.chunks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Unbounded in-memory sink; never reports backpressure
pub struct MemorySink {
    contents: MemoryContents,
    state: StreamState,
    events: EventBus<SinkEvent>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            contents: MemoryContents::default(),
            state: StreamState::Idle,
            events: EventBus::new(),
        }
    }

    pub fn contents(&self) -> MemoryContents {
        self.contents.clone()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkSink for MemorySink {
    fn write(&mut self, chunk: Chunk) -> Result<bool> {
        if self.state.is_terminal() {
            return Err(StreamError::SinkClosed);
        }
        self.state = StreamState::Flowing;
        self.contents.lock().push(chunk);
        Ok(true)
    }

    async fn drained(&mut self) -> Result<()> {
        Ok(())
    }

    async fn end(&mut self, last: Option<Chunk>) -> Result<()> {
        if let Some(chunk) = last {
            self.write(chunk)?;
        } else if self.state.is_terminal() {
            return Err(StreamError::SinkClosed);
        }
        self.state = StreamState::Ended;
        self.events.emit(&SinkEvent::Finish);
        self.state = StreamState::Closed;
        self.events.emit(&SinkEvent::Close);
        Ok(())
    }

    async fn abort(&mut self, cause: &StreamError) {
        if self.state.is_terminal() {
            return;
        }
        self.state = StreamState::Errored;
        self.events
            .emit(&SinkEvent::Error(Arc::new(StreamError::Sink(cause.to_string()))));
        self.events.emit(&SinkEvent::Close);
    }

    fn state(&self) -> StreamState {
        self.state
    }

    fn events(&self) -> &EventBus<SinkEvent> {
        &self.events
    }

    fn name(&self) -> &'static str {
        "MemorySink"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn small_config(high: usize) -> SinkConfig {
        SinkConfig {
            high_water_mark: high,
            ..Default::default()
        }
    }

    fn record_events(sink: &impl ChunkSink) -> Arc<Mutex<Vec<&'static str>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        sink.events().on(move |e| {
            let tag = match e {
                SinkEvent::Drain => "drain",
                SinkEvent::Finish => "finish",
                SinkEvent::Close => "close",
                SinkEvent::Error(_) => "error",
            };
            log.lock().unwrap().push(tag);
        });
        seen
    }

    #[tokio::test]
    async fn test_write_reports_high_water_mark() {
        // a tiny duplex pipe nobody reads keeps the writer stuck
        let (writer, mut reader) = tokio::io::duplex(4);
        let mut sink = WriterSink::new(writer, small_config(8));

        assert!(sink.write(Chunk::from("abcd")).unwrap());
        assert!(!sink.write(Chunk::from("efgh")).unwrap());
        assert_eq!(sink.state(), StreamState::Draining);

        let reading = tokio::spawn(async move {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            out
        });

        sink.drained().await.unwrap();
        assert_eq!(sink.state(), StreamState::Flowing);
        sink.end(None).await.unwrap();
        assert_eq!(reading.await.unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_end_emits_finish_then_close() {
        let mut sink = WriterSink::new(Vec::new(), SinkConfig::default());
        let seen = record_events(&sink);

        sink.write(Chunk::from("line\n")).unwrap();
        sink.end(Some(Chunk::from("last\n"))).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["finish", "close"]);
        assert_eq!(sink.state(), StreamState::Closed);
        assert_eq!(sink.into_inner().unwrap(), b"line\nlast\n");
    }

    #[tokio::test]
    async fn test_write_after_end_fails() {
        let mut sink = WriterSink::new(Vec::new(), SinkConfig::default());
        sink.end(None).await.unwrap();

        assert!(matches!(
            sink.write(Chunk::from("late")),
            Err(StreamError::SinkClosed)
        ));
        assert!(matches!(sink.end(None).await, Err(StreamError::SinkClosed)));
    }

    #[tokio::test]
    async fn test_overflow_policy_fail() {
        let (writer, _reader) = tokio::io::duplex(1);
        let config = SinkConfig {
            high_water_mark: 2,
            max_buffered_bytes: 6,
            overflow: OverflowPolicy::Fail,
            ..Default::default()
        };
        let mut sink = WriterSink::new(writer, config);
        let seen = record_events(&sink);

        assert!(!sink.write(Chunk::from("abcd")).unwrap());
        let err = sink.write(Chunk::from("efgh")).unwrap_err();
        assert!(matches!(
            err,
            StreamError::BackpressureOverflow { limit: 6, .. }
        ));
        assert_eq!(sink.state(), StreamState::Errored);
        assert_eq!(*seen.lock().unwrap(), vec!["error"]);
    }

    #[tokio::test]
    async fn test_abort_never_finishes() {
        let (writer, _reader) = tokio::io::duplex(1);
        let mut sink = WriterSink::new(writer, small_config(2));
        let seen = record_events(&sink);

        sink.write(Chunk::from("pending")).unwrap();
        sink.abort(&StreamError::Cancelled).await;

        assert_eq!(*seen.lock().unwrap(), vec!["error", "close"]);
        assert!(matches!(
            sink.write(Chunk::from("more")),
            Err(StreamError::SinkClosed)
        ));
    }

    #[tokio::test]
    async fn test_abort_after_interrupted_end_stops_writer() {
        let (writer, mut reader) = tokio::io::duplex(1);
        let mut sink = WriterSink::new(writer, small_config(2));

        sink.write(Chunk::from("stuck")).unwrap();
        let ended = tokio::time::timeout(Duration::from_millis(20), sink.end(None)).await;
        assert!(ended.is_err());
        sink.abort(&StreamError::Cancelled).await;

        // the writer task is gone, so the pipe reports end of stream
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), reader.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert!(out.len() < 5);
        assert_eq!(sink.state(), StreamState::Errored);
    }

    #[tokio::test]
    async fn test_drain_event_fires() {
        let mut sink = WriterSink::new(Vec::new(), small_config(4));
        let seen = record_events(&sink);

        assert!(!sink.write(Chunk::from("abcdef")).unwrap());
        sink.drained().await.unwrap();
        // the writer emits after updating the count; give it one more turn
        tokio::task::yield_now().await;
        sink.end(None).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["drain", "finish", "close"]);
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let mut sink = MemorySink::new();
        let contents = sink.contents();

        assert!(sink.write(Chunk::from("a")).unwrap());
        sink.end(Some(Chunk::from("b"))).await.unwrap();

        assert_eq!(contents.to_text(), "ab");
        assert_eq!(contents.len(), 2);
        assert!(sink.write(Chunk::from("c")).is_err());
    }
}
