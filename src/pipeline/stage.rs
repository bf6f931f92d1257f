//! Pipeline stage trait
//!
//! A stage is anything that turns one incoming chunk into zero or more
//! outgoing chunks, and can emit a final batch when its input ends.

use super::error::Result;
use super::types::Chunk;

/// Trait for transform stages sitting between a source and a sink
///
/// Stages run synchronously between suspension points: a chunk that entered
/// `process` always completes before cancellation is observed.
pub trait PipelineStage: Send {
    /// Transform one chunk; outputs are delivered downstream in order
    fn process(&mut self, chunk: Chunk) -> Result<Vec<Chunk>>;

    /// Called once after the source ended
    fn flush(&mut self) -> Result<Vec<Chunk>> {
        Ok(Vec::new())
    }

    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;
}

/// Stage built from a plain function, for stateless transforms
pub struct FnStage<F> {
    name: &'static str,
    f: F,
}

impl<F> FnStage<F>
where
    F: FnMut(Chunk) -> Result<Vec<Chunk>> + Send,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> PipelineStage for FnStage<F>
where
    F: FnMut(Chunk) -> Result<Vec<Chunk>> + Send,
{
    fn process(&mut self, chunk: Chunk) -> Result<Vec<Chunk>> {
        (self.f)(chunk)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Push `chunks` through `stages`, preserving order
pub fn run_stages(
    stages: &mut [Box<dyn PipelineStage>],
    chunks: Vec<Chunk>,
) -> Result<Vec<Chunk>> {
    let mut current = chunks;
    for stage in stages.iter_mut() {
        let mut next = Vec::with_capacity(current.len());
        for chunk in current {
            next.extend(stage.process(chunk)?);
        }
        current = next;
    }
    Ok(current)
}

/// Flush every stage in order; a stage's final output still passes
/// through the stages after it
pub fn flush_stages(stages: &mut [Box<dyn PipelineStage>]) -> Result<Vec<Chunk>> {
    let mut output = Vec::new();
    for i in 0..stages.len() {
        let flushed = stages[i].flush()?;
        output.extend(run_stages(&mut stages[i + 1..], flushed)?);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::StreamError;

    fn upper() -> Box<dyn PipelineStage> {
        Box::new(FnStage::new("Upper", |c: Chunk| {
            Ok(vec![Chunk::from(c.to_text_lossy().to_uppercase())])
        }))
    }

    /// Holds everything back until flush
    struct Collect(Vec<u8>);

    impl PipelineStage for Collect {
        fn process(&mut self, chunk: Chunk) -> Result<Vec<Chunk>> {
            self.0.extend_from_slice(&chunk);
            Ok(Vec::new())
        }

        fn flush(&mut self) -> Result<Vec<Chunk>> {
            Ok(vec![Chunk::from(std::mem::take(&mut self.0))])
        }

        fn name(&self) -> &'static str {
            "Collect"
        }
    }

    #[test]
    fn test_run_stages_in_order() {
        let dup: Box<dyn PipelineStage> = Box::new(FnStage::new("Dup", |c: Chunk| {
            Ok(vec![c.clone(), c])
        }));
        let mut stages = vec![dup, upper()];

        let out = run_stages(&mut stages, vec![Chunk::from("a"), Chunk::from("b")]).unwrap();
        let text: Vec<String> = out.iter().map(Chunk::to_text_lossy).collect();
        assert_eq!(text, vec!["A", "A", "B", "B"]);
    }

    #[test]
    fn test_flush_passes_downstream() {
        let mut stages: Vec<Box<dyn PipelineStage>> = vec![Box::new(Collect(Vec::new())), upper()];

        assert!(run_stages(&mut stages, vec![Chunk::from("ab")]).unwrap().is_empty());
        let out = flush_stages(&mut stages).unwrap();
        assert_eq!(out, vec![Chunk::from("AB")]);
    }

    #[test]
    fn test_stage_error_stops() {
        let failing: Box<dyn PipelineStage> = Box::new(FnStage::new("Failing", |_c: Chunk| {
            Err(StreamError::Stage {
                stage: "Failing",
                message: "boom".into(),
            })
        }));
        let mut stages = vec![failing, upper()];
        assert!(run_stages(&mut stages, vec![Chunk::from("a")]).is_err());
    }
}
