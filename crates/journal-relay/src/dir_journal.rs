// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Directory-backed journal: ordered `*.journal` files of JSON-lines
//! entries.
//!
//! Each line is one entry, a JSON object of field keys to values. Files are
//! indexed in name order and re-scanned for appended lines, which is how
//! [`Journal::wait`] detects new data. Cursor tokens are `file:line` pairs,
//! stable across process restarts.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::JournalError;
use crate::journal::{priority_matches, Journal, WaitStatus};

const WAIT_POLL_STEP: Duration = Duration::from_millis(100);
const JOURNAL_EXTENSION: &str = "journal";

struct SourceFile {
    path: PathBuf,
    name: String,
    lines_seen: usize,
}

pub struct DirectoryJournal {
    dir: PathBuf,
    files: Vec<SourceFile>,
    entries: Vec<HashMap<String, String>>,
    /// `(file name, zero-based line)` per entry, backing cursor tokens.
    origins: Vec<(String, usize)>,
    pos: isize,
    matches: Vec<(String, String)>,
}

impl DirectoryJournal {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let dir = dir.into();
        if !std::fs::metadata(&dir)?.is_dir() {
            return Err(JournalError::Source(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let mut journal = DirectoryJournal {
            dir,
            files: Vec::new(),
            entries: Vec::new(),
            origins: Vec::new(),
            pos: -1,
            matches: Vec::new(),
        };
        let loaded = journal.refresh()?;
        debug!(dir = %journal.dir.display(), entries = loaded, "opened directory journal");
        Ok(journal)
    }

    /// Picks up new files and appended lines. Returns the number of entries
    /// added. Files are never dropped from the index; rotated-away files
    /// simply stop growing.
    fn refresh(&mut self) -> Result<usize, JournalError> {
        let mut discovered: Vec<(String, PathBuf)> = Vec::new();
        for dir_entry in std::fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            discovered.push((name, path));
        }
        discovered.sort();

        for (name, path) in discovered {
            if !self.files.iter().any(|f| f.name == name) {
                self.files.push(SourceFile {
                    path,
                    name,
                    lines_seen: 0,
                });
            }
        }

        let mut added = 0;
        for idx in 0..self.files.len() {
            added += self.load_new_lines(idx)?;
        }
        Ok(added)
    }

    fn load_new_lines(&mut self, idx: usize) -> Result<usize, JournalError> {
        let file = match File::open(&self.files[idx].path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut added = 0;
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line_no < self.files[idx].lines_seen {
                continue;
            }
            self.files[idx].lines_seen = line_no + 1;
            if line.trim().is_empty() {
                continue;
            }
            match parse_entry(&line) {
                Ok(entry) => {
                    self.entries.push(entry);
                    self.origins.push((self.files[idx].name.clone(), line_no));
                    added += 1;
                }
                Err(err) => warn!(
                    file = %self.files[idx].name,
                    line = line_no,
                    "skipping undecodable journal line: {err}"
                ),
            }
        }
        Ok(added)
    }

    fn matches_entry(&self, idx: usize) -> bool {
        self.matches.is_empty()
            || self
                .matches
                .iter()
                .any(|(key, value)| self.entries[idx].get(key) == Some(value))
    }

    fn current(&self) -> Result<&HashMap<String, String>, JournalError> {
        usize::try_from(self.pos)
            .ok()
            .and_then(|idx| self.entries.get(idx))
            .ok_or(JournalError::NoEntry)
    }

    fn current_usec(&self, field: &str) -> Result<u64, JournalError> {
        let raw = self
            .current()?
            .get(field)
            .ok_or_else(|| JournalError::Source(format!("entry has no {field} field")))?;
        raw.parse::<u64>()
            .map_err(|_| JournalError::Source(format!("entry has an unparsable {field} field")))
    }
}

fn parse_entry(line: &str) -> Result<HashMap<String, String>, serde_json::Error> {
    let raw: HashMap<String, serde_json::Value> = serde_json::from_str(line)?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

impl Journal for DirectoryJournal {
    fn seek_head(&mut self) -> Result<(), JournalError> {
        self.pos = -1;
        Ok(())
    }

    fn seek_tail(&mut self) -> Result<(), JournalError> {
        self.refresh()?;
        self.pos = self.entries.len() as isize - 1;
        Ok(())
    }

    fn seek_cursor(&mut self, cursor: &str) -> Result<(), JournalError> {
        let (name, line) = cursor
            .rsplit_once(':')
            .ok_or_else(|| JournalError::InvalidCursor(cursor.to_string()))?;
        let line: usize = line
            .parse()
            .map_err(|_| JournalError::InvalidCursor(cursor.to_string()))?;
        let idx = self
            .origins
            .iter()
            .position(|(n, l)| n == name && *l == line)
            .ok_or_else(|| JournalError::InvalidCursor(cursor.to_string()))?;
        self.pos = idx as isize;
        Ok(())
    }

    fn next(&mut self) -> Result<u64, JournalError> {
        loop {
            let mut idx = self.pos + 1;
            while (idx as usize) < self.entries.len() {
                if self.matches_entry(idx as usize) {
                    self.pos = idx;
                    return Ok(1);
                }
                idx += 1;
            }
            if self.refresh()? == 0 {
                return Ok(0);
            }
        }
    }

    fn next_skip(&mut self, skip: u64) -> Result<u64, JournalError> {
        let mut moved = 0;
        while moved < skip && self.next()? == 1 {
            moved += 1;
        }
        Ok(moved)
    }

    fn previous(&mut self) -> Result<u64, JournalError> {
        self.previous_skip(1)
    }

    fn previous_skip(&mut self, skip: u64) -> Result<u64, JournalError> {
        let mut moved = 0;
        while moved < skip {
            if self.pos < 0 {
                break;
            }
            let mut idx = self.pos - 1;
            while idx >= 0 && !self.matches_entry(idx as usize) {
                idx -= 1;
            }
            self.pos = idx;
            moved += 1;
        }
        Ok(moved)
    }

    fn get_data_value(&self, field: &str) -> Result<String, JournalError> {
        Ok(self.current()?.get(field).cloned().unwrap_or_default())
    }

    fn get_realtime_usec(&self) -> Result<u64, JournalError> {
        self.current_usec("__REALTIME_TIMESTAMP")
    }

    fn get_monotonic_usec(&self) -> Result<u64, JournalError> {
        self.current_usec("__MONOTONIC_TIMESTAMP")
    }

    fn get_cursor(&self) -> Result<String, JournalError> {
        let idx = usize::try_from(self.pos).map_err(|_| JournalError::NoEntry)?;
        let (name, line) = self.origins.get(idx).ok_or(JournalError::NoEntry)?;
        Ok(format!("{name}:{line}"))
    }

    fn wait(&mut self, timeout: Option<Duration>) -> WaitStatus {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.refresh() {
                Ok(added) if added > 0 => return WaitStatus::Append,
                Ok(_) => {}
                Err(err) => {
                    warn!("journal directory became unreadable while waiting: {err}");
                    return WaitStatus::Invalidate;
                }
            }
            let step = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return WaitStatus::NoChange;
                    }
                    remaining.min(WAIT_POLL_STEP)
                }
                None => WAIT_POLL_STEP,
            };
            std::thread::sleep(step);
        }
    }

    fn add_log_filters(&mut self, config: &Config) {
        self.matches = priority_matches(config.min_priority());
        if !self.matches.is_empty() {
            debug!(matches = self.matches.len(), "installed priority filters");
        }
    }
}

impl std::fmt::Debug for DirectoryJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryJournal")
            .field("dir", &self.dir)
            .field("entries", &self.entries.len())
            .field("pos", &self.pos)
            .finish()
    }
}
