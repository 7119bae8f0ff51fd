// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, TensorError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// File name of the scalar stream inside a summary directory.
pub const EVENTS_FILE: &str = "events.jsonl";

/// One scalar sample of a named series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub step: u64,
    pub tag: String,
    pub value: f32,
    pub wall_time_ms: u128,
}

/// Append-only JSONL stream of [`ScalarEvent`]s stored at
/// `<dir>/events.jsonl`.
pub struct SummaryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
    last_step: Option<u64>,
}

impl core::fmt::Debug for SummaryWriter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SummaryWriter")
            .field("path", &self.path)
            .field("last_step", &self.last_step)
            .finish()
    }
}

impl SummaryWriter {
    pub fn create<P: AsRef<Path>>(dir: P) -> PureResult<Self> {
        Self::with_flush_every(dir, 1)
    }

    pub fn with_flush_every<P: AsRef<Path>>(dir: P, flush_every: usize) -> PureResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(io_error)?;
        let path = dir.join(EVENTS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;
        info!(path = %path.display(), "summary directory");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
            last_step: None,
        })
    }

    /// Appends one scalar. A step lower than the previous one is written
    /// anyway, with a warning.
    pub fn add_scalar(&mut self, step: u64, tag: &str, value: f32) -> PureResult<()> {
        if let Some(last) = self.last_step {
            if step < last {
                warn!(step, last, tag, "summary step went backwards");
            }
        }
        let event = ScalarEvent {
            step,
            tag: tag.to_string(),
            value,
            wall_time_ms: timestamp_ms(SystemTime::now()),
        };
        serde_json::to_writer(&mut self.writer, &event).map_err(serde_error)?;
        self.writer.write_all(b"\n").map_err(io_error)?;
        self.last_step = Some(step);
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> PureResult<()> {
        self.pending = 0;
        self.writer.flush().map_err(io_error)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads every event of a stream written by [`SummaryWriter`].
pub fn read_events<P: AsRef<Path>>(path: P) -> PureResult<Vec<ScalarEvent>> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_error)?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line).map_err(serde_error)?);
    }
    Ok(events)
}

fn timestamp_ms(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis()
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: serde_json::Error) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}
