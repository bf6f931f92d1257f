//! Pipeline orchestrator
//!
//! Chains source → stages → sink and manages their lifecycle as one unit.

use log::{error, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backpressure::{BackpressureConfig, BackpressureController, Delivery};
use super::error::{Result, StreamError};
use super::events::{EventBus, LinkEvent, PipelineEvent};
use super::filter::{FilterCounters, FilterStats};
use super::health::{HealthSummary, PipelineHealth};
use super::sink::{ChunkSink, OverflowPolicy};
use super::source::ChunkSource;
use super::stage::{PipelineStage, flush_stages, run_stages};
use super::state::PipelineState;
use super::types::Chunk;

/// What happens to chunks produced after the sink was detached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnpipePolicy {
    /// Drop them
    #[default]
    Discard,
    /// Keep them in the report
    Rebuffer,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub backpressure: BackpressureConfig,
    pub overflow: OverflowPolicy,
    pub unpipe: UnpipePolicy,
}

/// Final account of one pipeline run
#[derive(Debug)]
pub struct PipelineReport {
    /// Finished, Errored or Cancelled
    pub state: PipelineState,
    pub error: Option<Arc<StreamError>>,
    pub health: HealthSummary,
    /// Whether the sink was detached before the source ended
    pub detached: bool,
    /// Chunks kept after detaching under `UnpipePolicy::Rebuffer`
    pub rebuffered: Vec<Chunk>,
    /// Counters of the observed record filter, if any
    pub filter: Option<FilterStats>,
}

impl PipelineReport {
    pub fn is_finished(&self) -> bool {
        self.state == PipelineState::Finished
    }
}

/// Builds pipelines; observers subscribe here before the flow starts
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    health: Arc<PipelineHealth>,
    events: EventBus<PipelineEvent>,
    cancel: CancellationToken,
    filter: Option<Arc<FilterCounters>>,
}

impl PipelineOrchestrator {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            health: Arc::new(PipelineHealth::new()),
            events: EventBus::new(),
            cancel: CancellationToken::new(),
            filter: None,
        }
    }

    /// Cancel this pipeline whenever `parent` is cancelled
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Fold these filter counters into the final report
    pub fn observe_filter(mut self, counters: Arc<FilterCounters>) -> Self {
        self.filter = Some(counters);
        self
    }

    pub fn events(&self) -> &EventBus<PipelineEvent> {
        &self.events
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        self.health.clone()
    }

    /// Wire the pipeline and start it on the current runtime
    ///
    /// The source drives: the flow begins as soon as the runtime polls the
    /// spawned task.
    pub fn connect<S, K>(
        self,
        source: S,
        stages: Vec<Box<dyn PipelineStage>>,
        sink: K,
    ) -> PipelineHandle
    where
        S: ChunkSource + 'static,
        K: ChunkSink + 'static,
    {
        // a cancel also ends any wait on the attached sink
        let detach = self.cancel.child_token();
        let (state_tx, state_rx) = watch::channel(PipelineState::Created);
        let state = Arc::new(state_tx);

        let controller = BackpressureController::new(
            &self.config.backpressure,
            self.config.overflow,
            self.health.clone(),
        );
        {
            let state = state.clone();
            let events = self.events.clone();
            controller.events().on(move |e| {
                let next = match e {
                    LinkEvent::Paused => PipelineState::paused(),
                    LinkEvent::Resumed => PipelineState::flowing(),
                };
                transition(&state, &events, next);
            });
        }

        info!(
            "Pipeline: {} → [{}] → {}",
            source.name(),
            stages.iter().map(|s| s.name()).collect::<Vec<_>>().join(", "),
            sink.name()
        );

        let run = PipelineRun {
            source,
            stages,
            sink,
            controller,
            unpipe: self.config.unpipe,
            attached: true,
            rebuffered: Vec::new(),
            state,
            events: self.events.clone(),
            health: self.health.clone(),
            filter: self.filter,
            cancel: self.cancel.clone(),
            detach: detach.clone(),
        };
        let task = tokio::spawn(run.run());

        PipelineHandle {
            cancel: self.cancel,
            detach,
            state: state_rx,
            events: self.events,
            health: self.health,
            task,
        }
    }
}

/// Owner-side handle of a running pipeline
pub struct PipelineHandle {
    cancel: CancellationToken,
    detach: CancellationToken,
    state: watch::Receiver<PipelineState>,
    events: EventBus<PipelineEvent>,
    health: Arc<PipelineHealth>,
    task: JoinHandle<PipelineReport>,
}

impl PipelineHandle {
    /// Stop the pipeline at its next suspension point; the sink never finishes
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Detach the sink; later chunks follow the unpipe policy
    pub fn unpipe(&self) {
        self.detach.cancel();
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Wait until the state satisfies `predicate`, or the pipeline is gone
    pub async fn wait_for_state<F>(&mut self, mut predicate: F) -> PipelineState
    where
        F: FnMut(&PipelineState) -> bool,
    {
        if let Ok(state) = self.state.wait_for(|s| predicate(s)).await {
            return *state;
        }
        *self.state.borrow()
    }

    pub fn events(&self) -> &EventBus<PipelineEvent> {
        &self.events
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        self.health.clone()
    }

    /// Wait for the terminal state
    pub async fn wait(self) -> Result<PipelineReport> {
        self.task.await.map_err(|e| StreamError::Stage {
            stage: "PipelineOrchestrator",
            message: e.to_string(),
        })
    }
}

/// Apply a validated transition and notify observers; no-op when invalid
fn transition(
    state: &watch::Sender<PipelineState>,
    events: &EventBus<PipelineEvent>,
    next: PipelineState,
) -> bool {
    let changed = state.send_if_modified(|current| {
        let differs = std::mem::discriminant(current) != std::mem::discriminant(&next);
        if differs && current.can_transition_to(&next) {
            *current = next;
            true
        } else {
            false
        }
    });
    if changed {
        events.emit(&PipelineEvent::StateChanged(next));
    }
    changed
}

enum Outcome {
    Finished,
    Cancelled,
}

enum Step {
    Cancel,
    Detach,
    Next(Result<Option<Chunk>>),
}

struct PipelineRun<S, K> {
    source: S,
    stages: Vec<Box<dyn PipelineStage>>,
    sink: K,
    controller: BackpressureController,
    unpipe: UnpipePolicy,
    attached: bool,
    rebuffered: Vec<Chunk>,
    state: Arc<watch::Sender<PipelineState>>,
    events: EventBus<PipelineEvent>,
    health: Arc<PipelineHealth>,
    filter: Option<Arc<FilterCounters>>,
    cancel: CancellationToken,
    detach: CancellationToken,
}

impl<S, K> PipelineRun<S, K>
where
    S: ChunkSource,
    K: ChunkSink,
{
    async fn run(mut self) -> PipelineReport {
        transition(&self.state, &self.events, PipelineState::flowing());
        let outcome = self.pump().await;
        self.finish(outcome).await
    }

    async fn pump(&mut self) -> Result<Outcome> {
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancel,
                _ = self.detach.cancelled(), if self.attached => Step::Detach,
                next = self.source.next_chunk() => Step::Next(next),
            };

            match step {
                Step::Cancel => return Ok(Outcome::Cancelled),
                Step::Detach => {
                    if !self.detach_sink(false).await? {
                        return Ok(Outcome::Cancelled);
                    }
                }
                Step::Next(Err(e)) => return Err(e),
                Step::Next(Ok(Some(chunk))) => {
                    self.health.record_read(chunk.len());
                    let output = run_stages(&mut self.stages, vec![chunk])?;
                    if !self.forward_all(output).await? || !self.pace().await? {
                        return Ok(Outcome::Cancelled);
                    }
                }
                Step::Next(Ok(None)) => {
                    let tail = flush_stages(&mut self.stages)?;
                    if !self.forward_all(tail).await? {
                        return Ok(Outcome::Cancelled);
                    }
                    if self.attached && !self.end_sink().await? {
                        return Ok(Outcome::Cancelled);
                    }
                    return Ok(Outcome::Finished);
                }
            }
        }
    }

    /// Deliver stage output in order; false once cancelled
    async fn forward_all(&mut self, chunks: Vec<Chunk>) -> Result<bool> {
        for chunk in chunks {
            if !self.attached {
                match self.unpipe {
                    UnpipePolicy::Discard => self.health.record_discard(),
                    UnpipePolicy::Rebuffer => self.rebuffered.push(chunk),
                }
                continue;
            }
            if self.cancel.is_cancelled() {
                return Ok(false);
            }

            let delivery = self
                .controller
                .deliver(&mut self.source, &mut self.sink, chunk, &self.detach)
                .await?;
            if delivery == Delivery::Interrupted && !self.interrupted(true).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// One throttled pause per source chunk, when configured
    async fn pace(&mut self) -> Result<bool> {
        let interrupt = if self.attached { &self.detach } else { &self.cancel };
        let delivery = self.controller.pace(&mut self.source, interrupt).await;
        if delivery == Delivery::Interrupted {
            return self.interrupted(false).await;
        }
        Ok(true)
    }

    /// A wait on the link was cut short; false when that was a cancel
    async fn interrupted(&mut self, sink_full: bool) -> Result<bool> {
        if self.cancel.is_cancelled() {
            return Ok(false);
        }
        self.controller.release(&mut self.source);
        self.detach_sink(sink_full).await
    }

    /// Stop feeding the sink; false when cancelled meanwhile
    async fn detach_sink(&mut self, sink_full: bool) -> Result<bool> {
        self.attached = false;
        info!("Pipeline: {} detached", self.sink.name());
        self.events.emit(&PipelineEvent::Unpiped);

        if sink_full {
            // its consumer is stalled, a flush would block the same way
            self.sink.abort(&StreamError::Detached).await;
            return Ok(true);
        }
        // flush what the sink already accepted; nothing new reaches it
        if self.end_sink().await? {
            return Ok(true);
        }
        self.sink.abort(&StreamError::Cancelled).await;
        Ok(false)
    }

    /// End the sink unless cancelled first; false when cancelled
    async fn end_sink(&mut self) -> Result<bool> {
        let ended = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            ended = self.sink.end(None) => Some(ended),
        };
        match ended {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }

    async fn finish(mut self, outcome: Result<Outcome>) -> PipelineReport {
        let error = match outcome {
            Ok(Outcome::Finished) => {
                self.source.close().await;
                transition(&self.state, &self.events, PipelineState::Finished);
                info!("Pipeline: finished. {}", self.health.summary());
                self.events.emit(&PipelineEvent::Finished);
                None
            }
            Ok(Outcome::Cancelled) => {
                self.source.close().await;
                if self.attached {
                    self.sink.abort(&StreamError::Cancelled).await;
                }
                transition(&self.state, &self.events, PipelineState::Cancelled);
                warn!("Pipeline: cancelled. {}", self.health.summary());
                self.events.emit(&PipelineEvent::Cancelled);
                None
            }
            Err(e) => {
                if e.is_defect() {
                    error!("Pipeline: {}", e);
                } else {
                    warn!("Pipeline: {}", e);
                }
                self.source.close().await;
                if self.attached {
                    self.sink.abort(&e).await;
                }
                transition(&self.state, &self.events, PipelineState::Errored);
                let e = Arc::new(e);
                self.events.emit(&PipelineEvent::Errored(e.clone()));
                Some(e)
            }
        };

        PipelineReport {
            state: *self.state.borrow(),
            error,
            health: self.health.summary(),
            detached: !self.attached,
            rebuffered: std::mem::take(&mut self.rebuffered),
            filter: self.filter.as_ref().map(|c| c.snapshot()),
        }
    }
}
