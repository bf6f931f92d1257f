//! HTTP transport for pipelines
//!
//! An axum router on top of a hyper HTTP/1.1 connection loop. Every request
//! streams a pipeline's output as an NDJSON body.

pub mod response;
pub mod server;

pub use response::{PendingResponse, ResponseSink};
pub use server::{StreamServer, create_router};
