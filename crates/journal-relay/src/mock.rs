// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory stand-ins for the journal source and the log sink.
//!
//! [`MemJournal`] backs unit and pipeline tests. [`MockSink`] is also
//! selected at runtime by the `mock-cloud-watch` flag: it logs every event
//! locally and hands out synthetic sequence tokens, so the whole pipeline
//! can be exercised without network access.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::Config;
use crate::delivery::{LogEvent, LogSink, LogStreamSummary};
use crate::errors::{JournalError, SinkError};
use crate::journal::{priority_matches, Journal, WaitStatus};

const MEM_CURSOR_PREFIX: &str = "mem:";

/// A journal over a fixed list of entries, with injectable read errors.
pub struct MemJournal {
    entries: Vec<HashMap<String, String>>,
    pos: isize,
    errors: VecDeque<JournalError>,
    realtime_usec: u64,
    monotonic_usec: u64,
    fail_realtime: bool,
    matches: Vec<(String, String)>,
    wait_calls: Arc<AtomicU64>,
}

impl MemJournal {
    /// Positions before the first entry, like a freshly opened journal.
    pub fn new(entries: Vec<HashMap<String, String>>) -> Self {
        MemJournal {
            entries,
            pos: -1,
            errors: VecDeque::new(),
            realtime_usec: 1_480_549_576_015_541,
            monotonic_usec: 1_710_127_404,
            fail_realtime: false,
            matches: Vec::new(),
            wait_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A single entry with the read pointer already on it, for projection
    /// tests.
    pub fn with_entry(entry: HashMap<String, String>) -> Self {
        let mut journal = MemJournal::new(vec![entry]);
        journal.pos = 0;
        journal
    }

    /// The same entry replayed `count` times.
    pub fn repeat_entry(entry: HashMap<String, String>, count: usize) -> Self {
        MemJournal::new(vec![entry; count])
    }

    /// Queues an error to be returned by the next [`Journal::next`] call.
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push_back(JournalError::Source(message.into()));
    }

    pub fn realtime_usec(mut self, usec: u64) -> Self {
        self.realtime_usec = usec;
        self
    }

    pub fn fail_realtime(mut self) -> Self {
        self.fail_realtime = true;
        self
    }

    /// Shared counter of [`Journal::wait`] invocations, usable after the
    /// journal has been moved into a reader.
    pub fn wait_observer(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.wait_calls)
    }

    fn matches_entry(&self, idx: usize) -> bool {
        self.matches.is_empty()
            || self
                .matches
                .iter()
                .any(|(key, value)| self.entries[idx].get(key) == Some(value))
    }
}

impl Journal for MemJournal {
    fn seek_head(&mut self) -> Result<(), JournalError> {
        self.pos = -1;
        Ok(())
    }

    fn seek_tail(&mut self) -> Result<(), JournalError> {
        self.pos = self.entries.len() as isize - 1;
        Ok(())
    }

    fn seek_cursor(&mut self, cursor: &str) -> Result<(), JournalError> {
        let idx = cursor
            .strip_prefix(MEM_CURSOR_PREFIX)
            .and_then(|raw| raw.parse::<isize>().ok())
            .filter(|idx| *idx >= 0 && (*idx as usize) < self.entries.len())
            .ok_or_else(|| JournalError::InvalidCursor(cursor.to_string()))?;
        self.pos = idx;
        Ok(())
    }

    fn next(&mut self) -> Result<u64, JournalError> {
        if let Some(err) = self.errors.pop_front() {
            return Err(err);
        }
        let mut idx = self.pos + 1;
        while (idx as usize) < self.entries.len() {
            if self.matches_entry(idx as usize) {
                self.pos = idx;
                return Ok(1);
            }
            idx += 1;
        }
        Ok(0)
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
        let idx = usize::try_from(self.pos).map_err(|_| JournalError::NoEntry)?;
        let entry = self.entries.get(idx).ok_or(JournalError::NoEntry)?;
        Ok(entry.get(field).cloned().unwrap_or_default())
    }

    fn get_realtime_usec(&self) -> Result<u64, JournalError> {
        if self.fail_realtime {
            return Err(JournalError::Source("realtime clock unavailable".to_string()));
        }
        Ok(self.realtime_usec)
    }

    fn get_monotonic_usec(&self) -> Result<u64, JournalError> {
        Ok(self.monotonic_usec)
    }

    fn get_cursor(&self) -> Result<String, JournalError> {
        if self.pos < 0 {
            return Err(JournalError::NoEntry);
        }
        Ok(format!("{MEM_CURSOR_PREFIX}{}", self.pos))
    }

    fn wait(&mut self, _timeout: Option<Duration>) -> WaitStatus {
        self.wait_calls.fetch_add(1, Ordering::Relaxed);
        WaitStatus::NoChange
    }

    fn add_log_filters(&mut self, config: &Config) {
        self.matches = priority_matches(config.min_priority());
    }
}

/// One recorded append call on a [`MockSink`].
#[derive(Debug, Clone)]
pub struct PutCall {
    pub sequence_token: Option<String>,
    pub events: Vec<LogEvent>,
}

#[derive(Default)]
struct MockSinkState {
    puts: Mutex<Vec<PutCall>>,
    token_counter: AtomicU64,
}

/// Log-only sink: every event is written to the local log, nothing leaves
/// the host. Clones share the recorded calls.
#[derive(Clone, Default)]
pub struct MockSink {
    inner: Arc<MockSinkState>,
}

impl MockSink {
    pub fn new() -> Self {
        MockSink::default()
    }

    pub fn put_calls(&self) -> Vec<PutCall> {
        #[allow(clippy::expect_used)]
        let calls = self.inner.puts.lock().expect("lock poisoned");
        calls.clone()
    }

    fn current_token(&self) -> Option<String> {
        let count = self.inner.token_counter.load(Ordering::Acquire);
        if count == 0 {
            None
        } else {
            Some(format!("mock-token-{count}"))
        }
    }
}

#[async_trait]
impl LogSink for MockSink {
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        sequence_token: Option<&str>,
        events: &[LogEvent],
    ) -> Result<Option<String>, SinkError> {
        for event in events {
            info!(group, stream, timestamp = event.timestamp, "{}", event.message);
        }
        #[allow(clippy::expect_used)]
        self.inner.puts.lock().expect("lock poisoned").push(PutCall {
            sequence_token: sequence_token.map(str::to_string),
            events: events.to_vec(),
        });
        let count = self.inner.token_counter.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(Some(format!("mock-token-{count}")))
    }

    async fn describe_log_streams(
        &self,
        _group: &str,
        stream_prefix: &str,
        _limit: usize,
    ) -> Result<Vec<LogStreamSummary>, SinkError> {
        Ok(vec![LogStreamSummary {
            log_stream_name: stream_prefix.to_string(),
            upload_sequence_token: self.current_token(),
        }])
    }

    async fn create_log_stream(&self, _group: &str, _stream: &str) -> Result<(), SinkError> {
        Ok(())
    }

    async fn create_log_group(&self, _group: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_entries(count: usize) -> Vec<HashMap<String, String>> {
        (0..count)
            .map(|i| {
                [
                    ("MESSAGE".to_string(), format!("entry {i}")),
                    ("PRIORITY".to_string(), "6".to_string()),
                ]
                .into_iter()
                .collect()
            })
            .collect()
    }

    #[test]
    fn test_next_walks_entries_in_order() {
        let mut journal = MemJournal::new(numbered_entries(3));
        for i in 0..3 {
            assert_eq!(journal.next().unwrap(), 1);
            assert_eq!(journal.get_data_value("MESSAGE").unwrap(), format!("entry {i}"));
        }
        assert_eq!(journal.next().unwrap(), 0);
    }

    #[test]
    fn test_tail_and_rewind() {
        let mut journal = MemJournal::new(numbered_entries(10));
        journal.seek_tail().unwrap();
        assert_eq!(journal.next().unwrap(), 0);

        assert_eq!(journal.previous_skip(3).unwrap(), 3);
        assert_eq!(journal.next().unwrap(), 1);
        assert_eq!(journal.get_data_value("MESSAGE").unwrap(), "entry 7");
    }

    #[test]
    fn test_rewind_past_head_stops_at_start() {
        let mut journal = MemJournal::new(numbered_entries(2));
        journal.seek_tail().unwrap();
        assert_eq!(journal.previous_skip(10).unwrap(), 2);
        assert_eq!(journal.next().unwrap(), 1);
        assert_eq!(journal.get_data_value("MESSAGE").unwrap(), "entry 0");
    }

    #[test]
    fn test_cursor_round_trip() {
        let mut journal = MemJournal::new(numbered_entries(3));
        journal.next().unwrap();
        journal.next().unwrap();
        let cursor = journal.get_cursor().unwrap();

        journal.seek_head().unwrap();
        journal.seek_cursor(&cursor).unwrap();
        assert_eq!(journal.get_data_value("MESSAGE").unwrap(), "entry 1");

        assert!(journal.seek_cursor("mem:99").is_err());
        assert!(journal.seek_cursor("bogus").is_err());
    }

    #[test]
    fn test_injected_error_is_returned_once() {
        let mut journal = MemJournal::new(numbered_entries(1));
        journal.push_error("TEST ERROR");
        assert!(journal.next().is_err());
        assert_eq!(journal.next().unwrap(), 1);
    }

    #[test]
    fn test_priority_filter_skips_entries() {
        let mut entries = numbered_entries(4);
        entries[1].insert("PRIORITY".to_string(), "3".to_string());
        entries[3].insert("PRIORITY".to_string(), "2".to_string());
        let mut journal = MemJournal::new(entries);

        let config = Config {
            log_priority: "err".to_string(),
            ..Config::default()
        };
        journal.add_log_filters(&config);

        assert_eq!(journal.next().unwrap(), 1);
        assert_eq!(journal.get_data_value("MESSAGE").unwrap(), "entry 1");
        assert_eq!(journal.next().unwrap(), 1);
        assert_eq!(journal.get_data_value("MESSAGE").unwrap(), "entry 3");
        assert_eq!(journal.next().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mock_sink_records_calls_and_rotates_tokens() {
        let sink = MockSink::new();
        let events = vec![LogEvent {
            timestamp: 1,
            message: "{}".to_string(),
        }];

        let token = sink
            .put_log_events("group", "stream", None, &events)
            .await
            .unwrap();
        assert_eq!(token.as_deref(), Some("mock-token-1"));

        let streams = sink.describe_log_streams("group", "stream", 1).await.unwrap();
        assert_eq!(streams[0].upload_sequence_token.as_deref(), Some("mock-token-1"));

        let calls = sink.put_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].sequence_token.is_none());
        assert_eq!(calls[0].events.len(), 1);
    }
}
