//! NDJSON test data generator
//!
//! Produces one user record per line; every second record is active.

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use log::info;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: u64,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: String,
}

impl UserRecord {
    pub fn new(id: u64, epoch: NaiveDateTime) -> Self {
        let created = epoch + TimeDelta::seconds(id as i64);
        UserRecord {
            id,
            username: format!("user_{}", id),
            email: format!("user_{}@example.com", id),
            is_active: id % 2 == 0,
            created_at: created.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }
}

fn epoch() -> anyhow::Result<NaiveDateTime> {
    NaiveDate::from_ymd_opt(2025, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .context("invalid epoch")
}

/// Write records `1..=count` to `out`, one JSON object per line
pub fn write_records<W: Write>(out: &mut W, count: u64) -> anyhow::Result<()> {
    let epoch = epoch()?;
    for id in 1..=count {
        serde_json::to_writer(&mut *out, &UserRecord::new(id, epoch))?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Generate `count` records into the file at `path`
pub fn generate_file(path: impl AsRef<Path>, count: u64) -> anyhow::Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    write_records(&mut out, count)?;
    info!("Generator: {} records written to {}", count, path.display());
    Ok(())
}
