//! Event sources: where readings come from before they are buffered.
//!
//! Every category is read through its own source. The production sources
//! are per-category JSONL inbox files that sensor drivers and the `record`
//! command append to. Consumption is tracked by a byte offset kept in a
//! position file next to the buffer, so a restart resumes after the last
//! reading that made it into the buffer.

use crate::config::AgentConfig;
use crate::constants;
use crate::error::SourceError;
use crate::event::{Category, Reading};
use crate::paths;
use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// A stream of readings with explicit consumption.
///
/// `peek` returns the next reading without consuming it, so the caller can
/// stop (quota exhausted, buffer full) and see the same reading next time.
pub trait EventSource: Send + std::fmt::Debug {
    fn peek(&mut self) -> Result<Option<Reading>, SourceError>;

    /// Consume the reading returned by the last `peek`.
    fn advance(&mut self) -> Result<(), SourceError>;
}

impl Reading {
    /// Capture time, falling back to `now` for readings without one.
    pub fn captured_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.captured_at.unwrap_or(now)
    }
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

/// Source backed by a queue. Handy for simulations and tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    readings: VecDeque<Reading>,
}

impl MemorySource {
    pub fn new(readings: impl IntoIterator<Item = Reading>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
        }
    }

    pub fn push(&mut self, reading: Reading) {
        self.readings.push_back(reading);
    }

    pub fn remaining(&self) -> usize {
        self.readings.len()
    }
}

impl EventSource for MemorySource {
    fn peek(&mut self) -> Result<Option<Reading>, SourceError> {
        Ok(self.readings.front().cloned())
    }

    fn advance(&mut self) -> Result<(), SourceError> {
        self.readings.pop_front();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inbox file source
// ---------------------------------------------------------------------------

/// JSONL inbox for one category with a persisted read offset.
#[derive(Debug)]
pub struct InboxSource {
    category: Category,
    path: PathBuf,
    position_path: PathBuf,
    offset: u64,
    /// Peeked reading and the offset just past its line.
    pending: Option<(Reading, u64)>,
}

impl InboxSource {
    pub fn open(
        category: Category,
        path: PathBuf,
        position_path: PathBuf,
    ) -> Result<Self, SourceError> {
        let offset = match std::fs::read_to_string(&position_path) {
            Ok(s) => s.trim().parse().unwrap_or_else(|_| {
                warn!(path = %position_path.display(), "unreadable inbox position, starting from 0");
                0
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(source) => {
                return Err(SourceError::Io {
                    path: position_path.display().to_string(),
                    source,
                });
            }
        };
        Ok(Self {
            category,
            path,
            position_path,
            offset,
            pending: None,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn io_err(&self, source: std::io::Error) -> SourceError {
        SourceError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn save_offset(&self) -> Result<(), SourceError> {
        std::fs::write(&self.position_path, self.offset.to_string()).map_err(|source| {
            SourceError::Io {
                path: self.position_path.display().to_string(),
                source,
            }
        })
    }

    /// Read forward from the current offset to the next well-formed reading.
    /// Blank, malformed and misfiled lines are consumed; a trailing line
    /// without a newline is left alone because a writer may still be
    /// appending it.
    fn read_next(&mut self) -> Result<Option<(Reading, u64)>, SourceError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        let len = file.metadata().map_err(|e| self.io_err(e))?.len();
        if len < self.offset {
            warn!(
                path = %self.path.display(),
                offset = self.offset,
                len,
                "inbox shrank below read offset, rereading from start"
            );
            self.offset = 0;
            self.save_offset()?;
        }

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(self.offset))
            .map_err(|e| self.io_err(e))?;
        let mut skipped = false;
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).map_err(|e| self.io_err(e))?;
            if n == 0 || !line.ends_with('\n') {
                break;
            }
            let next_offset = self.offset + n as u64;
            let text = line.trim();
            if !text.is_empty() {
                match serde_json::from_str::<Reading>(text) {
                    Ok(reading) if reading.category != self.category => warn!(
                        offset = self.offset,
                        inbox = %self.category,
                        category = %reading.category,
                        "skipping reading filed in the wrong inbox"
                    ),
                    Ok(reading) if !reading.payload.is_null() => {
                        if skipped {
                            self.save_offset()?;
                        }
                        return Ok(Some((reading, next_offset)));
                    }
                    Ok(_) => {
                        warn!(offset = self.offset, "skipping inbox reading with null payload");
                    }
                    Err(e) => {
                        warn!(offset = self.offset, error = %e, "skipping malformed inbox line");
                    }
                }
            }
            self.offset = next_offset;
            skipped = true;
        }
        if skipped {
            self.save_offset()?;
        }
        Ok(None)
    }

    /// Truncate a fully consumed inbox once it grows past the size bound.
    /// Skipped when a writer currently holds the inbox lock.
    fn compact(&mut self) -> Result<(), SourceError> {
        let file = match OpenOptions::new().write(true).open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.io_err(e)),
        };
        let Ok(locked) = Flock::lock(file, FlockArg::LockExclusiveNonblock) else {
            return Ok(());
        };
        let len = locked.metadata().map_err(|e| self.io_err(e))?.len();
        if len != self.offset || len < constants::INBOX_COMPACT_BYTES {
            return Ok(());
        }
        locked.set_len(0).map_err(|e| self.io_err(e))?;
        self.offset = 0;
        self.save_offset()?;
        debug!(path = %self.path.display(), bytes = len, "inbox compacted");
        Ok(())
    }
}

impl EventSource for InboxSource {
    fn peek(&mut self) -> Result<Option<Reading>, SourceError> {
        if self.pending.is_none() {
            self.pending = self.read_next()?;
        }
        Ok(self.pending.as_ref().map(|(reading, _)| reading.clone()))
    }

    fn advance(&mut self) -> Result<(), SourceError> {
        let Some((_, next_offset)) = self.pending.take() else {
            return Ok(());
        };
        self.offset = next_offset;
        self.save_offset()?;
        self.compact()
    }
}

// ---------------------------------------------------------------------------
// Per-category sources
// ---------------------------------------------------------------------------

/// One source per category, each behind its own lock. A category that
/// cannot take more readings leaves its source where it is without holding
/// up the other category.
#[derive(Debug)]
pub struct CategorySources {
    vitals: Mutex<Box<dyn EventSource>>,
    feedings: Mutex<Box<dyn EventSource>>,
}

impl CategorySources {
    pub fn new(vitals: Box<dyn EventSource>, feedings: Box<dyn EventSource>) -> Self {
        Self {
            vitals: Mutex::new(vitals),
            feedings: Mutex::new(feedings),
        }
    }

    /// Split a mixed stream into per-category memory sources. Order within
    /// each category is kept.
    pub fn from_readings(readings: impl IntoIterator<Item = Reading>) -> Self {
        let (vitals, feedings): (Vec<Reading>, Vec<Reading>) = readings
            .into_iter()
            .partition(|r| r.category == Category::Vitals);
        Self::new(
            Box::new(MemorySource::new(vitals)),
            Box::new(MemorySource::new(feedings)),
        )
    }

    /// The configured inbox files, with positions under the state directory.
    pub fn inbox(config: &AgentConfig) -> Result<Self, SourceError> {
        let state = config.paths();
        let open = |category| {
            InboxSource::open(
                category,
                config.inbox_path(category),
                state.inbox_position(category),
            )
        };
        Ok(Self::new(
            Box::new(open(Category::Vitals)?),
            Box::new(open(Category::Feeding)?),
        ))
    }

    pub fn lock(&self, category: Category) -> MutexGuard<'_, Box<dyn EventSource>> {
        let source = match category {
            Category::Vitals => &self.vitals,
            Category::Feeding => &self.feedings,
        };
        source.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Append one reading to its category's inbox under `inbox_dir`, holding the
/// inbox lock so it cannot interleave with compaction. Returns the file
/// written.
pub fn append_reading(inbox_dir: &Path, reading: &Reading) -> Result<PathBuf, SourceError> {
    let path = inbox_dir.join(paths::inbox_file_name(reading.category));
    let io_err = |source: std::io::Error| SourceError::Io {
        path: path.display().to_string(),
        source,
    };
    std::fs::create_dir_all(inbox_dir).map_err(io_err)?;
    let mut line = serde_json::to_string(reading)?;
    line.push('\n');
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(io_err)?;
    let mut locked = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| io_err(std::io::Error::from(errno)))?;
    locked.write_all(line.as_bytes()).map_err(io_err)?;
    locked.flush().map_err(io_err)?;
    Ok(path)
}
