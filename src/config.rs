use crate::pipeline::backpressure::BackpressureConfig;
use crate::pipeline::coordinator::{PipelineConfig, UnpipePolicy};
use crate::pipeline::filter::FilterConfig;
use crate::pipeline::sink::SinkConfig;
use crate::pipeline::source::DEFAULT_CHUNK_SIZE;
use anyhow::{Context, bail};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:54321";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub path: PathBuf,
    /// Read size of the file source, its high-water mark
    pub chunk_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            path: PathBuf::from("huge_data.json"),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub unpipe: UnpipePolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// A client must finish its request head within this many milliseconds
    pub header_timeout_ms: u64,
}

impl ServerConfig {
    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 54321)),
            header_timeout_ms: 10_000,
        }
    }
}

/// Whole application configuration; every field has a default
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub backpressure: BackpressureConfig,
    pub filter: FilterConfig,
    pub pipeline: PipelineSection,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source.chunk_size == 0 {
            bail!("source.chunk_size must be greater than zero");
        }
        if self.sink.high_water_mark == 0 {
            bail!("sink.high_water_mark must be greater than zero");
        }
        if self.sink.low_water_mark >= self.sink.high_water_mark {
            bail!(
                "sink.low_water_mark ({}) must be below sink.high_water_mark ({})",
                self.sink.low_water_mark,
                self.sink.high_water_mark
            );
        }
        if self.sink.max_buffered_bytes < self.sink.high_water_mark {
            bail!("sink.max_buffered_bytes must be at least sink.high_water_mark");
        }
        if self.server.header_timeout_ms == 0 {
            bail!("server.header_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    /// Orchestrator settings derived from the sink and backpressure sections
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            backpressure: self.backpressure.clone(),
            overflow: self.sink.overflow,
            unpipe: self.pipeline.unpipe,
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
