//! Backpressure-aware chunk pipelines for line-delimited JSON
//!
//! A file (or socket, or request body) is read in bounded chunks, passed
//! through a line-buffered record filter and written to a sink that
//! reports when it is full. See [`pipeline`] for the building blocks.

pub mod config;
pub mod generator;
pub mod http;
pub mod pipeline;
