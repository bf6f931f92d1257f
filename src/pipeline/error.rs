//! Error types for the pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    /// Upstream I/O failure, fatal to the pipeline
    #[error("Source error: {0}")]
    Source(String),

    /// Downstream I/O failure, fatal to the pipeline
    #[error("Sink error: {0}")]
    Sink(String),

    /// One malformed record; recoverable, the line is skipped
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Read from a source that already ended, errored or closed")]
    ClosedSource,

    #[error("Read from a paused source")]
    PausedSource,

    #[error("Write to a sink that already ended, errored or closed")]
    SinkClosed,

    #[error("Sink buffer overflow: {buffered} bytes buffered, limit {limit}")]
    BackpressureOverflow { buffered: usize, limit: usize },

    #[error("Stage {stage} failed: {message}")]
    Stage {
        stage: &'static str,
        message: String,
    },

    #[error("Pipeline cancelled")]
    Cancelled,

    /// Sink detached while it still held data it could not flush
    #[error("Sink detached while full")]
    Detached,
}

impl StreamError {
    /// Everything but a single bad record ends the pipeline
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StreamError::Decode(_))
    }

    /// Contract misuse after a terminal state; never expected in correct operation
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            StreamError::ClosedSource | StreamError::PausedSource | StreamError::SinkClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(!StreamError::Decode("bad".into()).is_fatal());
        assert!(StreamError::Source("eof".into()).is_fatal());
        assert!(StreamError::SinkClosed.is_defect());
        assert!(!StreamError::Cancelled.is_defect());

        let overflow = StreamError::BackpressureOverflow {
            buffered: 10,
            limit: 8,
        };
        assert_eq!(
            overflow.to_string(),
            "Sink buffer overflow: 10 bytes buffered, limit 8"
        );
    }
}
