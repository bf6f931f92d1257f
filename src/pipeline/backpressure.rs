//! Backpressure Controller
//!
//! Mediates the write/drain handshake between exactly one source and one
//! sink so that memory stays bounded whatever their relative speed:
//! 1. every chunk goes to `sink.write()`
//! 2. on `false` the source is paused and the controller waits for drain
//! 3. an optional throttle timer runs between drain and resume
//! 4. the source is resumed
//!
//! At most one pause/resume cycle is in flight per link, and the source is
//! never pulled while paused.

use log::debug;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::error::Result;
use super::events::{EventBus, LinkEvent};
use super::health::PipelineHealth;
use super::sink::{ChunkSink, OverflowPolicy};
use super::source::ChunkSource;
use super::types::{Chunk, StreamState};

/// Configuration for backpressure control
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Fixed delay between drain and resume, in milliseconds
    pub throttle_ms: Option<u64>,
    /// Pause and throttle after every chunk, not only when the sink is full
    pub throttle_every_chunk: bool,
}

impl BackpressureConfig {
    pub fn throttle(&self) -> Option<Duration> {
        self.throttle_ms.map(Duration::from_millis)
    }
}

/// Outcome of delivering one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sink took the chunk with room to spare
    Accepted,
    /// Source was paused and resumed after `waited`
    Relieved { waited: Duration },
    /// Interrupted while paused; the source stays paused until `release()`
    Interrupted,
}

/// Controller for one pipeline link
pub struct BackpressureController {
    throttle: Option<Duration>,
    throttle_every_chunk: bool,
    honor_drain: bool,
    pause_in_flight: bool,
    health: Arc<PipelineHealth>,
    events: EventBus<LinkEvent>,
}

impl BackpressureController {
    /// Create a new backpressure controller
    pub fn new(config: &BackpressureConfig, overflow: OverflowPolicy, health: Arc<PipelineHealth>) -> Self {
        Self {
            throttle: config.throttle(),
            throttle_every_chunk: config.throttle_every_chunk,
            // under Fail the sink enforces its hard cap instead
            honor_drain: overflow == OverflowPolicy::Block,
            pause_in_flight: false,
            health,
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus<LinkEvent> {
        &self.events
    }

    /// True while a pause/resume cycle is waiting on the sink
    pub fn is_paused(&self) -> bool {
        self.pause_in_flight
    }

    /// True when every source chunk is followed by a throttled pause
    pub fn paces_every_chunk(&self) -> bool {
        self.throttle_every_chunk && self.throttle.is_some()
    }

    /// Hand one chunk to the sink, pausing the source while the sink drains
    ///
    /// `interrupt` ends the wait early and leaves the source paused.
    pub async fn deliver<S, K>(
        &mut self,
        source: &mut S,
        sink: &mut K,
        chunk: Chunk,
        interrupt: &CancellationToken,
    ) -> Result<Delivery>
    where
        S: ChunkSource + ?Sized,
        K: ChunkSink + ?Sized,
    {
        debug_assert!(!self.pause_in_flight, "second write while paused");

        let size = chunk.len();
        let has_room = sink.write(chunk)?;
        self.health.record_write(size);

        if has_room || !self.honor_drain {
            return Ok(Delivery::Accepted);
        }

        let started = self.hold(source);
        self.health.record_pause();
        debug!(
            "BackpressureController: {} full, pausing {}",
            sink.name(),
            source.name()
        );
        let drained = tokio::select! {
            biased;
            _ = interrupt.cancelled() => None,
            drained = sink.drained() => Some(drained),
        };
        match drained {
            None => return Ok(self.abandon()),
            Some(Err(e)) => {
                self.pause_in_flight = false;
                return Err(e);
            }
            Some(Ok(())) => {}
        }

        if !self.throttled(interrupt).await {
            return Ok(self.abandon());
        }
        Ok(self.finish(source, started))
    }

    /// Pause the source for one throttle period after a source chunk
    pub async fn pace<S>(&mut self, source: &mut S, interrupt: &CancellationToken) -> Delivery
    where
        S: ChunkSource + ?Sized,
    {
        if !self.paces_every_chunk() {
            return Delivery::Accepted;
        }

        let started = self.hold(source);
        if !self.throttled(interrupt).await {
            return self.abandon();
        }
        self.finish(source, started)
    }

    /// Resume a source left paused by an interrupted wait
    pub fn release<S>(&mut self, source: &mut S)
    where
        S: ChunkSource + ?Sized,
    {
        if source.state() == StreamState::Paused {
            source.resume();
            self.events.emit(&LinkEvent::Resumed);
        }
    }

    fn hold<S>(&mut self, source: &mut S) -> Instant
    where
        S: ChunkSource + ?Sized,
    {
        self.pause_in_flight = true;
        source.pause();
        self.events.emit(&LinkEvent::Paused);
        Instant::now()
    }

    /// Sleep the throttle; false when interrupted first
    async fn throttled(&self, interrupt: &CancellationToken) -> bool {
        let Some(delay) = self.throttle else {
            return true;
        };
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn finish<S>(&mut self, source: &mut S, started: Instant) -> Delivery
    where
        S: ChunkSource + ?Sized,
    {
        source.resume();
        self.pause_in_flight = false;
        self.events.emit(&LinkEvent::Resumed);

        let waited = started.elapsed();
        debug!("BackpressureController: resumed after {:?}", waited);
        Delivery::Relieved { waited }
    }

    fn abandon(&mut self) -> Delivery {
        self.pause_in_flight = false;
        Delivery::Interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::StreamError;
    use crate::pipeline::events::{SinkEvent, SourceEvent};
    use crate::pipeline::source::MemorySource;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Always reports full; `drained()` waits for the test to open the gate
    struct GatedSink {
        received: Arc<Mutex<Vec<Chunk>>>,
        gate: Arc<Notify>,
        events: EventBus<SinkEvent>,
    }

    #[async_trait]
    impl ChunkSink for GatedSink {
        fn write(&mut self, chunk: Chunk) -> Result<bool> {
            self.received.lock().unwrap().push(chunk);
            Ok(false)
        }

        async fn drained(&mut self) -> Result<()> {
            self.gate.notified().await;
            Ok(())
        }

        async fn end(&mut self, _last: Option<Chunk>) -> Result<()> {
            Ok(())
        }

        async fn abort(&mut self, _cause: &StreamError) {}

        fn state(&self) -> StreamState {
            StreamState::Flowing
        }

        fn events(&self) -> &EventBus<SinkEvent> {
            &self.events
        }

        fn name(&self) -> &'static str {
            "GatedSink"
        }
    }

    fn gated() -> (GatedSink, Arc<Mutex<Vec<Chunk>>>, Arc<Notify>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());
        let sink = GatedSink {
            received: received.clone(),
            gate: gate.clone(),
            events: EventBus::new(),
        };
        (sink, received, gate)
    }

    fn controller(config: BackpressureConfig) -> BackpressureController {
        BackpressureController::new(&config, OverflowPolicy::Block, Arc::new(PipelineHealth::new()))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_no_pull_while_paused() {
        let mut source = MemorySource::from_chunks(["a", "b", "c"]);
        let (mut sink, received, gate) = gated();

        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        source.events().on(move |e| {
            if matches!(e, SourceEvent::Data { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(async move {
            let mut controller = controller(BackpressureConfig::default());
            while let Some(chunk) = source.next_chunk().await.unwrap() {
                let delivery = controller
                    .deliver(&mut source, &mut sink, chunk, &cancel)
                    .await
                    .unwrap();
                assert!(matches!(delivery, Delivery::Relieved { .. }));
            }
        });

        settle().await;
        assert_eq!(pulls.load(Ordering::SeqCst), 1);
        assert_eq!(received.lock().unwrap().len(), 1);

        gate.notify_one();
        settle().await;
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
        assert_eq!(received.lock().unwrap().len(), 2);

        gate.notify_one();
        settle().await;
        gate.notify_one();
        pump.await.unwrap();

        let got: Vec<Chunk> = received.lock().unwrap().clone();
        assert_eq!(got, vec![Chunk::from("a"), Chunk::from("b"), Chunk::from("c")]);
    }

    #[tokio::test]
    async fn test_pause_and_resume_events() {
        let mut source = MemorySource::from_chunks(["a"]);
        let (mut sink, _received, gate) = gated();
        let mut controller = controller(BackpressureConfig::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        controller.events().on(move |e| log.lock().unwrap().push(*e));

        gate.notify_one();
        let chunk = source.next_chunk().await.unwrap().unwrap();
        controller
            .deliver(&mut source, &mut sink, chunk, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![LinkEvent::Paused, LinkEvent::Resumed]);
        assert_eq!(source.state(), StreamState::Flowing);
        assert!(!controller.is_paused());
    }

    #[tokio::test]
    async fn test_throttle_between_drain_and_resume() {
        let mut source = MemorySource::from_chunks(["a"]);
        let (mut sink, _received, gate) = gated();
        let mut controller = controller(BackpressureConfig {
            throttle_ms: Some(50),
            ..Default::default()
        });

        gate.notify_one();
        let chunk = source.next_chunk().await.unwrap().unwrap();
        let delivery = controller
            .deliver(&mut source, &mut sink, chunk, &CancellationToken::new())
            .await
            .unwrap();

        match delivery {
            Delivery::Relieved { waited } => assert!(waited >= Duration::from_millis(50)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_while_paused() {
        let mut source = MemorySource::from_chunks(["a", "b"]);
        let (mut sink, _received, _gate) = gated();
        let mut controller = controller(BackpressureConfig::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let chunk = source.next_chunk().await.unwrap().unwrap();
        let delivery = controller
            .deliver(&mut source, &mut sink, chunk, &cancel)
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::Interrupted);
        assert_eq!(source.state(), StreamState::Paused);
        assert_eq!(source.remaining(), 1);

        controller.release(&mut source);
        assert_eq!(source.state(), StreamState::Flowing);
        assert!(!controller.is_paused());
    }

    #[tokio::test]
    async fn test_pace_pauses_for_one_throttle() {
        let mut source = MemorySource::from_chunks(["a"]);
        let mut controller = controller(BackpressureConfig {
            throttle_ms: Some(30),
            throttle_every_chunk: true,
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        controller.events().on(move |e| log.lock().unwrap().push(*e));

        let delivery = controller.pace(&mut source, &CancellationToken::new()).await;

        match delivery {
            Delivery::Relieved { waited } => assert!(waited >= Duration::from_millis(30)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(*seen.lock().unwrap(), vec![LinkEvent::Paused, LinkEvent::Resumed]);
        assert_eq!(source.state(), StreamState::Flowing);
    }

    #[tokio::test]
    async fn test_pace_without_throttle_is_a_no_op() {
        let mut source = MemorySource::from_chunks(["a"]);
        let mut controller = controller(BackpressureConfig {
            throttle_ms: None,
            throttle_every_chunk: true,
        });

        let delivery = controller.pace(&mut source, &CancellationToken::new()).await;
        assert_eq!(delivery, Delivery::Accepted);
        assert_eq!(source.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn test_fail_policy_ignores_advisory_false() {
        let mut source = MemorySource::from_chunks(["a"]);
        let (mut sink, _received, _gate) = gated();
        let mut controller = BackpressureController::new(
            &BackpressureConfig::default(),
            OverflowPolicy::Fail,
            Arc::new(PipelineHealth::new()),
        );

        let chunk = source.next_chunk().await.unwrap().unwrap();
        let delivery = controller
            .deliver(&mut source, &mut sink, chunk, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::Accepted);
        assert_eq!(source.state(), StreamState::Flowing);
    }
}
