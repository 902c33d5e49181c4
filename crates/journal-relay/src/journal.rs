// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The journal source contract: a sequential, seekable log of key/value
//! entries with cursor navigation and a blocking wait-for-change primitive.
//!
//! The pipeline only depends on this trait; concrete backends
//! ([`crate::dir_journal::DirectoryJournal`], [`crate::mock::MemJournal`])
//! are selected at construction.

use std::time::Duration;

use crate::config::Config;
use crate::errors::JournalError;
use crate::record::Priority;

/// Outcome of [`Journal::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The timeout elapsed without a change.
    NoChange,
    /// New entries were appended.
    Append,
    /// The journal files were rotated or otherwise invalidated.
    Invalidate,
}

pub trait Journal: Send {
    /// Seeks to the oldest available entry.
    fn seek_head(&mut self) -> Result<(), JournalError>;

    /// Seeks to the most recent available entry.
    fn seek_tail(&mut self) -> Result<(), JournalError>;

    /// Seeks to a concrete cursor previously returned by
    /// [`Journal::get_cursor`].
    fn seek_cursor(&mut self, cursor: &str) -> Result<(), JournalError>;

    /// Advances the read pointer by one entry. Returns the number of entries
    /// actually advanced; zero means the read pointer is already at the end.
    fn next(&mut self) -> Result<u64, JournalError>;

    /// Advances the read pointer by up to `skip` entries at once.
    fn next_skip(&mut self, skip: u64) -> Result<u64, JournalError>;

    /// Sets the read pointer back by one entry.
    fn previous(&mut self) -> Result<u64, JournalError>;

    /// Sets the read pointer back by up to `skip` entries at once.
    fn previous_skip(&mut self, skip: u64) -> Result<u64, JournalError>;

    /// Returns the value of `field` on the current entry. Absent fields
    /// yield an empty string.
    fn get_data_value(&self, field: &str) -> Result<String, JournalError>;

    /// Realtime (wallclock) timestamp of the current entry, in microseconds.
    fn get_realtime_usec(&self) -> Result<u64, JournalError>;

    /// Monotonic timestamp of the current entry, in microseconds.
    fn get_monotonic_usec(&self) -> Result<u64, JournalError>;

    /// Opaque token for the current read position, portable across process
    /// restarts.
    fn get_cursor(&self) -> Result<String, JournalError>;

    /// Blocks until the journal changes or the timeout elapses. `None` waits
    /// indefinitely. Reports the outcome instead of failing.
    fn wait(&mut self, timeout: Option<Duration>) -> WaitStatus;

    /// Installs the configured entry filters. Invoked once after
    /// construction.
    fn add_log_filters(&mut self, config: &Config);
}

/// The disjunctive PRIORITY matches for a minimum-priority threshold: one
/// match per level from EMERG up to the threshold, inclusive. Empty when the
/// threshold is `Debug` (nothing to filter).
pub(crate) fn priority_matches(threshold: Priority) -> Vec<(String, String)> {
    if threshold >= Priority::Debug {
        return Vec::new();
    }
    Priority::ALL
        .iter()
        .filter(|p| **p <= threshold)
        .map(|p| ("PRIORITY".to_string(), p.number().to_string()))
        .collect()
}
