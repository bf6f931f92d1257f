//! Line-buffered NDJSON record filter
//!
//! Reassembles newline-terminated JSON records that straddle arbitrary chunk
//! boundaries, keeps the ones matching a predicate and re-emits each survivor
//! as its own compact JSON line.
//!
//! The tail after the last newline of every chunk is held back in a
//! leftover buffer and prepended to the next chunk. The leftover is kept as
//! raw bytes, so a multi-byte character split across two chunks decodes the
//! same as if it had arrived whole.

use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{Result, StreamError};
use super::stage::PipelineStage;
use super::types::Chunk;

/// Filter configuration: keep records whose `field` equals `equals`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub field: String,
    pub equals: Value,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            field: "isActive".to_string(),
            equals: Value::Bool(true),
        }
    }
}

/// Predicate applied to every decoded record
pub struct RecordPredicate {
    description: String,
    test: Box<dyn Fn(&Value) -> bool + Send>,
}

impl RecordPredicate {
    /// Strict equality on a top-level field; non-objects never match
    pub fn field_equals(field: impl Into<String>, expected: Value) -> Self {
        let field = field.into();
        let description = format!("{} == {}", field, expected);
        Self {
            description,
            test: Box::new(move |record| record.get(&field) == Some(&expected)),
        }
    }

    pub fn from_fn<F>(description: impl Into<String>, test: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + 'static,
    {
        Self {
            description: description.into(),
            test: Box::new(test),
        }
    }

    pub fn matches(&self, record: &Value) -> bool {
        (self.test)(record)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl From<&FilterConfig> for RecordPredicate {
    fn from(config: &FilterConfig) -> Self {
        RecordPredicate::field_equals(config.field.clone(), config.equals.clone())
    }
}

impl std::fmt::Debug for RecordPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RecordPredicate")
            .field(&self.description)
            .finish()
    }
}

/// Counters shared between a filter and whoever watches it
#[derive(Debug, Default)]
pub struct FilterCounters {
    lines: AtomicU64,
    emitted: AtomicU64,
    rejected: AtomicU64,
    decode_failures: AtomicU64,
}

impl FilterCounters {
    pub fn snapshot(&self) -> FilterStats {
        FilterStats {
            lines: self.lines.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of filter counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Non-blank lines examined
    pub lines: u64,
    /// Records that matched and were emitted
    pub emitted: u64,
    /// Records that decoded but did not match
    pub rejected: u64,
    /// Lines that failed to decode
    pub decode_failures: u64,
}

impl std::fmt::Display for FilterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Filter: {} lines, {} emitted, {} rejected, {} malformed",
            self.lines, self.emitted, self.rejected, self.decode_failures
        )
    }
}

/// Transform stage keeping the NDJSON records that satisfy a predicate
///
/// Each instance owns its leftover buffer; never share one across pipelines.
pub struct LineBufferedRecordFilter {
    leftover: Vec<u8>,
    predicate: RecordPredicate,
    counters: Arc<FilterCounters>,
}

impl LineBufferedRecordFilter {
    pub fn new(predicate: RecordPredicate) -> Self {
        debug!("LineBufferedRecordFilter: keeping {}", predicate.description());
        Self {
            leftover: Vec::new(),
            predicate,
            counters: Arc::new(FilterCounters::default()),
        }
    }

    /// Filter on `isActive == true`
    pub fn active_records() -> Self {
        Self::new(RecordPredicate::from(&FilterConfig::default()))
    }

    /// Unterminated tail carried over from the last chunk
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }

    pub fn counters(&self) -> Arc<FilterCounters> {
        self.counters.clone()
    }

    pub fn stats(&self) -> FilterStats {
        self.counters.snapshot()
    }

    fn handle_line(&self, line: &[u8], log_failures: bool, out: &mut Vec<Chunk>) {
        let record = match decode_line(line) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                self.counters.lines.fetch_add(1, Ordering::Relaxed);
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                if log_failures {
                    warn!("LineBufferedRecordFilter: skipping line: {}", e);
                }
                return;
            }
        };
        self.counters.lines.fetch_add(1, Ordering::Relaxed);

        if !self.predicate.matches(&record) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match serde_json::to_string(&record) {
            Ok(mut text) => {
                text.push('\n');
                self.counters.emitted.fetch_add(1, Ordering::Relaxed);
                out.push(Chunk::from(text));
            }
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                if log_failures {
                    warn!("LineBufferedRecordFilter: cannot re-encode record: {}", e);
                }
            }
        }
    }
}

/// Decode one line; `Ok(None)` for blank lines
fn decode_line(line: &[u8]) -> Result<Option<Value>> {
    let text = std::str::from_utf8(line).map_err(|e| StreamError::Decode(e.to_string()))?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| StreamError::Decode(e.to_string()))
}

impl PipelineStage for LineBufferedRecordFilter {
    fn process(&mut self, chunk: Chunk) -> Result<Vec<Chunk>> {
        self.leftover.extend_from_slice(&chunk);

        let mut out = Vec::new();
        let Some(last_newline) = self.leftover.iter().rposition(|&b| b == b'\n') else {
            return Ok(out);
        };

        // everything after the last newline is the new tail, possibly empty
        let tail = self.leftover.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.leftover, tail);

        for line in complete[..last_newline].split(|&b| b == b'\n') {
            self.handle_line(line, true, &mut out);
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<Chunk>> {
        let mut out = Vec::new();
        if !self.leftover.is_empty() {
            let tail = std::mem::take(&mut self.leftover);
            // no later chunk can complete it, so failures stay silent
            self.handle_line(&tail, false, &mut out);
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "LineBufferedRecordFilter"
    }
}
