//! HTTP response as a chunk sink
//!
//! The response head is handed to the server lazily with the first body
//! chunk, so a pipeline that fails before producing anything can still
//! answer 500. Body bytes go through an in-memory pipe that the streaming
//! response body drains.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use log::warn;
use std::io;
use tokio::io::DuplexStream;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;

use crate::pipeline::error::{Result, StreamError};
use crate::pipeline::events::{EventBus, SinkEvent};
use crate::pipeline::sink::{ChunkSink, SinkConfig, WriterSink};
use crate::pipeline::types::{Chunk, StreamState};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

const ERROR_BODY: &str = "Something Went Wrong";

fn error_response() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, ERROR_BODY).into_response()
}

/// Body that ends cleanly only after `end()` confirmed every byte
fn streaming_body(reader: DuplexStream, finished: oneshot::Receiver<()>) -> Body {
    let state = (ReaderStream::new(reader), Some(finished));
    let stream = futures_util::stream::unfold(state, |(mut bytes, finished)| async move {
        let Some(finished) = finished else {
            return None;
        };
        match bytes.next().await {
            Some(Ok(chunk)) => Some((Ok(chunk), (bytes, Some(finished)))),
            Some(Err(e)) => Some((Err(e), (bytes, None))),
            // the pipe closes after `end` and after `abort` alike
            None => match finished.await {
                Ok(()) => None,
                Err(_) => {
                    let e = io::Error::new(io::ErrorKind::BrokenPipe, "response aborted");
                    Some((Err(e), (bytes, None)))
                }
            },
        }
    });
    Body::from_stream(stream)
}

/// Server side of a [`ResponseSink`]
pub struct PendingResponse {
    head: oneshot::Receiver<Response>,
}

impl PendingResponse {
    /// Wait until the sink commits to a status; 500 if it went away first
    pub async fn resolve(self) -> Response {
        self.head.await.unwrap_or_else(|_| error_response())
    }
}

/// Streaming NDJSON response fed by a pipeline
pub struct ResponseSink {
    inner: WriterSink<DuplexStream>,
    head: Option<(oneshot::Sender<Response>, Body)>,
    finished: Option<oneshot::Sender<()>>,
}

impl ResponseSink {
    /// The pipe between sink and body holds at most one high-water mark
    pub fn new(config: SinkConfig) -> (Self, PendingResponse) {
        let (writer, reader) = tokio::io::duplex(config.high_water_mark.max(1));
        let (head_tx, head_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();

        let sink = Self {
            inner: WriterSink::named("ResponseSink", writer, config),
            head: Some((head_tx, streaming_body(reader, finished_rx))),
            finished: Some(finished_tx),
        };
        (sink, PendingResponse { head: head_rx })
    }

    /// Once true, the status can no longer change
    pub fn headers_sent(&self) -> bool {
        self.head.is_none()
    }

    fn send_head(&mut self) -> Result<()> {
        let Some((head, body)) = self.head.take() else {
            return Ok(());
        };
        let response = ([(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)], body).into_response();
        head.send(response)
            .map_err(|_| StreamError::Sink("client went away before the response".into()))
    }
}

#[async_trait]
impl ChunkSink for ResponseSink {
    fn write(&mut self, chunk: Chunk) -> Result<bool> {
        if self.inner.state().is_terminal() {
            return Err(StreamError::SinkClosed);
        }
        self.send_head()?;
        self.inner.write(chunk)
    }

    async fn drained(&mut self) -> Result<()> {
        self.inner.drained().await
    }

    async fn end(&mut self, last: Option<Chunk>) -> Result<()> {
        if self.inner.state().is_terminal() {
            return Err(StreamError::SinkClosed);
        }
        if let Some(chunk) = last {
            self.write(chunk)?;
        }
        self.send_head()?;
        self.inner.end(None).await?;
        if let Some(finished) = self.finished.take() {
            finished.send(()).ok();
        }
        Ok(())
    }

    async fn abort(&mut self, cause: &StreamError) {
        if self.inner.state().is_terminal() {
            return;
        }
        // without the confirmation the body errors out and the connection drops
        self.finished.take();

        match self.head.take() {
            Some((head, _body)) => {
                warn!("ResponseSink: answering 500: {}", cause);
                head.send(error_response()).ok();
            }
            None => warn!("ResponseSink: closing connection mid-response: {}", cause),
        }
        self.inner.abort(cause).await;
    }

    fn state(&self) -> StreamState {
        self.inner.state()
    }

    fn events(&self) -> &EventBus<SinkEvent> {
        self.inner.events()
    }

    fn name(&self) -> &'static str {
        "ResponseSink"
    }
}
