//! Pipeline abstraction layer for linepipe
//!
//! A pipeline moves byte chunks from one source, through zero or more
//! transform stages, into one sink, with memory bounded by the sink's
//! high-water mark:
//! - Sources hand out chunks on demand and can be paused
//! - Stages turn each chunk into zero or more chunks
//! - Sinks accept chunks and report when they are full
//! - The backpressure controller pauses the source until the sink drains
//! - The orchestrator owns the lifecycle: finish, error, cancel, unpipe
//!
//! # Architecture
//!
//! The orchestrator runs the whole chain in one spawned task. Every stage
//! publishes lifecycle events through its own [`EventBus`], and health
//! counters track what moved through the pipeline.

pub mod backpressure;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod filter;
pub mod health;
pub mod sink;
pub mod source;
pub mod stage;
pub mod state;
pub mod types;

pub use backpressure::{BackpressureConfig, BackpressureController, Delivery};
pub use coordinator::{
    PipelineConfig, PipelineHandle, PipelineOrchestrator, PipelineReport, UnpipePolicy,
};
pub use error::{Result, StreamError};
pub use events::{EventBus, LinkEvent, ListenerId, PipelineEvent, SinkEvent, SourceEvent};
pub use filter::{FilterConfig, FilterCounters, FilterStats, LineBufferedRecordFilter, RecordPredicate};
pub use health::{HealthSummary, PipelineHealth};
pub use sink::{ChunkSink, MemorySink, OverflowPolicy, SinkConfig, WriterSink};
pub use source::{ChunkSource, FileSource, MemorySource, ReaderSource, StreamSource};
pub use stage::{FnStage, PipelineStage};
pub use state::PipelineState;
pub use types::{Chunk, StreamState};
