// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery engine: owns the sink's append-only stream semantics.
//!
//! The engine holds the stream's sequence token and drives the classified
//! recovery paths around `PutLogEvents`: missing stream/group creation,
//! duplicate-submission acceptance, and stale-token resynchronization. At
//! most one append call is ever in flight; the token is never shared.

use async_trait::async_trait;
use tracing::{debug, error};

use crate::config::Config;
use crate::errors::{DeliveryError, SinkError, SinkErrorKind};
use crate::record::Record;

/// One wire event: the serialized record and its event time in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub timestamp: i64,
    pub message: String,
}

/// One row of a stream lookup.
#[derive(Debug, Clone, Default)]
pub struct LogStreamSummary {
    pub log_stream_name: String,
    pub upload_sequence_token: Option<String>,
}

/// The remote log sink, reduced to the four operations the engine needs.
/// Implementations classify their failures through [`SinkErrorKind`].
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Appends a batch of events in order. Returns the sink's next sequence
    /// token.
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        sequence_token: Option<&str>,
        events: &[LogEvent],
    ) -> Result<Option<String>, SinkError>;

    /// Looks up streams by name prefix.
    async fn describe_log_streams(
        &self,
        group: &str,
        stream_prefix: &str,
        limit: usize,
    ) -> Result<Vec<LogStreamSummary>, SinkError>;

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), SinkError>;

    async fn create_log_group(&self, group: &str) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: LogSink + ?Sized> LogSink for Box<S> {
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        sequence_token: Option<&str>,
        events: &[LogEvent],
    ) -> Result<Option<String>, SinkError> {
        (**self)
            .put_log_events(group, stream, sequence_token, events)
            .await
    }

    async fn describe_log_streams(
        &self,
        group: &str,
        stream_prefix: &str,
        limit: usize,
    ) -> Result<Vec<LogStreamSummary>, SinkError> {
        (**self)
            .describe_log_streams(group, stream_prefix, limit)
            .await
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), SinkError> {
        (**self).create_log_stream(group, stream).await
    }

    async fn create_log_group(&self, group: &str) -> Result<(), SinkError> {
        (**self).create_log_group(group).await
    }
}

#[async_trait]
impl<S: LogSink + Sync + ?Sized> LogSink for &S {
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        sequence_token: Option<&str>,
        events: &[LogEvent],
    ) -> Result<Option<String>, SinkError> {
        (**self)
            .put_log_events(group, stream, sequence_token, events)
            .await
    }

    async fn describe_log_streams(
        &self,
        group: &str,
        stream_prefix: &str,
        limit: usize,
    ) -> Result<Vec<LogStreamSummary>, SinkError> {
        (**self)
            .describe_log_streams(group, stream_prefix, limit)
            .await
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), SinkError> {
        (**self).create_log_stream(group, stream).await
    }

    async fn create_log_group(&self, group: &str) -> Result<(), SinkError> {
        (**self).create_log_group(group).await
    }
}

pub struct DeliveryEngine<S> {
    sink: S,
    log_group_name: String,
    log_stream_name: String,
    next_sequence_token: Option<String>,
    max_events_per_put: usize,
    next_seq_id: i64,
}

impl<S: LogSink> DeliveryEngine<S> {
    pub fn new(sink: S, config: &Config) -> Self {
        DeliveryEngine {
            sink,
            log_group_name: config.log_group.clone(),
            log_stream_name: config.log_stream.clone(),
            next_sequence_token: None,
            max_events_per_put: config.buffer_size.max(1),
            next_seq_id: 0,
        }
    }

    /// Writes one batch to the sink, running the one-shot recovery paths on
    /// classified failures. A returned error means the batch (or its
    /// remainder) is lost; the caller decides whether that tears anything
    /// down.
    pub async fn write_batch(&mut self, mut records: Vec<Record>) -> Result<(), DeliveryError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut events = Vec::with_capacity(records.len());
        for record in &mut records {
            self.next_seq_id += 1;
            record.seq_id = self.next_seq_id;
            events.push(LogEvent {
                timestamp: record.time_usec,
                message: serde_json::to_string_pretty(record)?,
            });
        }

        for chunk in events.chunks(self.max_events_per_put) {
            self.put_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn put_chunk(&mut self, events: &[LogEvent]) -> Result<(), DeliveryError> {
        if self.next_sequence_token.is_none() {
            // The stream may not exist yet; a failed lookup here is fine,
            // the append's own error classification takes over.
            if let Err(err) = self.lookup_sequence_token().await {
                debug!("no sequence token before append: {err}");
            }
        }

        match self.put(events).await {
            Ok(()) => Ok(()),
            Err(err) => self.recover(err, events).await,
        }
    }

    async fn put(&mut self, events: &[LogEvent]) -> Result<(), SinkError> {
        let next = self
            .sink
            .put_log_events(
                &self.log_group_name,
                &self.log_stream_name,
                self.next_sequence_token.as_deref(),
                events,
            )
            .await?;
        self.next_sequence_token = next;
        Ok(())
    }

    /// Refreshes the cached token from a limit-1 stream lookup.
    async fn lookup_sequence_token(&mut self) -> Result<(), DeliveryError> {
        let streams = self
            .sink
            .describe_log_streams(&self.log_group_name, &self.log_stream_name, 1)
            .await
            .map_err(DeliveryError::TokenLookup)?;
        let stream = streams.into_iter().next().ok_or_else(|| {
            DeliveryError::NoMatchingStream {
                stream: self.log_stream_name.clone(),
            }
        })?;
        debug!(stream = %stream.log_stream_name, "refreshed sequence token");
        self.next_sequence_token = stream.upload_sequence_token;
        Ok(())
    }

    async fn recover(&mut self, err: SinkError, events: &[LogEvent]) -> Result<(), DeliveryError> {
        match err.kind {
            SinkErrorKind::ResourceNotFound => self.recover_resource_not_found(events).await,
            SinkErrorKind::DataAlreadyAccepted => {
                // The batch is already on the sink's side; resync the token
                // and move on without resending.
                error!(
                    stream = %self.log_stream_name,
                    "sink already accepted this batch: {err}"
                );
                self.next_sequence_token = None;
                self.lookup_sequence_token().await?;
                Ok(())
            }
            SinkErrorKind::InvalidSequenceToken => {
                error!(stream = %self.log_stream_name, "stale sequence token: {err}");
                self.next_sequence_token = None;
                self.lookup_sequence_token().await?;
                self.put(events)
                    .await
                    .map_err(DeliveryError::PutAfterTokenLookup)
            }
            SinkErrorKind::Other => {
                error!(
                    stream = %self.log_stream_name,
                    events = events.len(),
                    "failed to put events: {err}"
                );
                Err(DeliveryError::Put(err))
            }
        }
    }

    /// The stream (or the whole group) doesn't exist yet: create it, then
    /// retry the append once. A brand-new stream takes no token.
    async fn recover_resource_not_found(
        &mut self,
        events: &[LogEvent],
    ) -> Result<(), DeliveryError> {
        debug!(stream = %self.log_stream_name, "creating log stream");
        if let Err(err) = self
            .sink
            .create_log_stream(&self.log_group_name, &self.log_stream_name)
            .await
        {
            if err.kind != SinkErrorKind::ResourceNotFound {
                return Err(DeliveryError::CreateStream(err));
            }
            debug!(group = %self.log_group_name, "creating log group");
            self.sink
                .create_log_group(&self.log_group_name)
                .await
                .map_err(DeliveryError::CreateGroup)?;
            self.sink
                .create_log_stream(&self.log_group_name, &self.log_stream_name)
                .await
                .map_err(DeliveryError::CreateStream)?;
        }

        self.next_sequence_token = None;
        self.put(events).await.map_err(DeliveryError::PutAfterCreate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Priority;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum SinkCall {
        Put { token: Option<String>, events: usize },
        Describe,
        CreateStream,
        CreateGroup,
    }

    /// Sink test double: scripted failures up front, then canned successes.
    #[derive(Default)]
    struct ScriptedSink {
        put_failures: Mutex<VecDeque<SinkError>>,
        describe_failures: Mutex<VecDeque<SinkError>>,
        create_stream_failures: Mutex<VecDeque<SinkError>>,
        create_group_failures: Mutex<VecDeque<SinkError>>,
        describe_token: Mutex<Option<String>>,
        calls: Mutex<Vec<SinkCall>>,
        put_counter: Mutex<u64>,
    }

    impl ScriptedSink {
        fn fail_put(&self, code: &str) {
            self.put_failures
                .lock()
                .unwrap()
                .push_back(SinkError::new(code, "scripted failure"));
        }

        fn fail_create_stream(&self, code: &str) {
            self.create_stream_failures
                .lock()
                .unwrap()
                .push_back(SinkError::new(code, "scripted failure"));
        }

        fn set_describe_token(&self, token: &str) {
            *self.describe_token.lock().unwrap() = Some(token.to_string());
        }

        fn calls(&self) -> Vec<SinkCall> {
            self.calls.lock().unwrap().clone()
        }

        fn take_calls(&self) -> Vec<SinkCall> {
            std::mem::take(&mut self.calls.lock().unwrap())
        }
    }

    #[async_trait]
    impl LogSink for ScriptedSink {
        async fn put_log_events(
            &self,
            _group: &str,
            _stream: &str,
            sequence_token: Option<&str>,
            events: &[LogEvent],
        ) -> Result<Option<String>, SinkError> {
            self.calls.lock().unwrap().push(SinkCall::Put {
                token: sequence_token.map(str::to_string),
                events: events.len(),
            });
            if let Some(err) = self.put_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            let mut counter = self.put_counter.lock().unwrap();
            *counter += 1;
            Ok(Some(format!("token-{counter}")))
        }

        async fn describe_log_streams(
            &self,
            _group: &str,
            stream_prefix: &str,
            _limit: usize,
        ) -> Result<Vec<LogStreamSummary>, SinkError> {
            self.calls.lock().unwrap().push(SinkCall::Describe);
            if let Some(err) = self.describe_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(vec![LogStreamSummary {
                log_stream_name: stream_prefix.to_string(),
                upload_sequence_token: self.describe_token.lock().unwrap().clone(),
            }])
        }

        async fn create_log_stream(&self, _group: &str, _stream: &str) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(SinkCall::CreateStream);
            if let Some(err) = self.create_stream_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(())
        }

        async fn create_log_group(&self, _group: &str) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(SinkCall::CreateGroup);
            if let Some(err) = self.create_group_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(())
        }
    }

    fn engine(sink: &ScriptedSink) -> DeliveryEngine<&ScriptedSink> {
        let config = Config {
            log_group: "relay-group".to_string(),
            log_stream: "relay-stream".to_string(),
            buffer_size: 10,
            ..Config::default()
        };
        DeliveryEngine::new(sink, &config)
    }

    fn records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| Record {
                message: format!("message {i}"),
                priority: Priority::Info,
                time_usec: 1_480_459_022_025 + i as i64,
                ..Record::default()
            })
            .collect()
    }

    fn put_count(calls: &[SinkCall]) -> usize {
        calls
            .iter()
            .filter(|c| matches!(c, SinkCall::Put { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_successful_append_caches_token() {
        let sink = ScriptedSink::default();
        sink.set_describe_token("seeded");
        let mut engine = engine(&sink);

        engine.write_batch(records(2)).await.unwrap();
        engine.write_batch(records(1)).await.unwrap();

        let calls = sink.calls();
        // one lookup before the first append, none after
        assert_eq!(
            calls,
            vec![
                SinkCall::Describe,
                SinkCall::Put {
                    token: Some("seeded".to_string()),
                    events: 2
                },
                SinkCall::Put {
                    token: Some("token-1".to_string()),
                    events: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_stream_is_created_and_batch_retried() {
        let sink = ScriptedSink::default();
        let mut engine = engine(&sink);
        sink.fail_put("ResourceNotFoundException");

        engine.write_batch(records(3)).await.unwrap();

        let calls = sink.calls();
        assert_eq!(
            calls,
            vec![
                SinkCall::Describe,
                SinkCall::Put {
                    token: None,
                    events: 3
                },
                SinkCall::CreateStream,
                SinkCall::Put {
                    token: None,
                    events: 3
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_group_is_created_before_stream() {
        let sink = ScriptedSink::default();
        let mut engine = engine(&sink);
        sink.fail_put("ResourceNotFoundException");
        sink.fail_create_stream("ResourceNotFoundException");

        engine.write_batch(records(1)).await.unwrap();

        let calls = sink.calls();
        assert_eq!(
            &calls[2..],
            &[
                SinkCall::CreateStream,
                SinkCall::CreateGroup,
                SinkCall::CreateStream,
                SinkCall::Put {
                    token: None,
                    events: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_group_creation_is_fatal_for_the_batch() {
        let sink = ScriptedSink::default();
        let mut engine = engine(&sink);
        sink.fail_put("ResourceNotFoundException");
        sink.fail_create_stream("ResourceNotFoundException");
        sink.create_group_failures
            .lock()
            .unwrap()
            .push_back(SinkError::new("AccessDeniedException", "no"));

        let err = engine.write_batch(records(1)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::CreateGroup(_)));
    }

    #[tokio::test]
    async fn test_stale_token_resyncs_and_retries_once() {
        let sink = ScriptedSink::default();
        sink.set_describe_token("initial");
        let mut engine = engine(&sink);

        // establish the token with a clean write first
        engine.write_batch(records(1)).await.unwrap();
        sink.take_calls();

        sink.set_describe_token("refreshed");
        sink.fail_put("InvalidSequenceTokenException");
        engine.write_batch(records(2)).await.unwrap();

        let calls = sink.calls();
        // exactly one describe and one successful append after the failure
        assert_eq!(
            calls,
            vec![
                SinkCall::Put {
                    token: Some("token-1".to_string()),
                    events: 2
                },
                SinkCall::Describe,
                SinkCall::Put {
                    token: Some("refreshed".to_string()),
                    events: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_batch_resyncs_without_resending() {
        let sink = ScriptedSink::default();
        sink.set_describe_token("initial");
        let mut engine = engine(&sink);

        engine.write_batch(records(1)).await.unwrap();
        sink.take_calls();

        sink.fail_put("DataAlreadyAcceptedException");
        engine.write_batch(records(1)).await.unwrap();

        let calls = sink.calls();
        assert_eq!(put_count(&calls), 1);
        assert!(calls.contains(&SinkCall::Describe));
    }

    #[tokio::test]
    async fn test_unclassified_error_propagates_without_retry() {
        let sink = ScriptedSink::default();
        let mut engine = engine(&sink);
        sink.fail_put("ThrottlingException");

        let err = engine.write_batch(records(4)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Put(_)));
        assert_eq!(put_count(&sink.calls()), 1);
    }

    #[tokio::test]
    async fn test_large_batches_are_chunked_in_order() {
        let sink = ScriptedSink::default();
        let config = Config {
            log_group: "relay-group".to_string(),
            log_stream: "relay-stream".to_string(),
            buffer_size: 2,
            ..Config::default()
        };
        let mut engine = DeliveryEngine::new(&sink, &config);

        engine.write_batch(records(5)).await.unwrap();

        let sizes: Vec<usize> = sink
            .calls()
            .iter()
            .filter_map(|c| match c {
                SinkCall::Put { events, .. } => Some(*events),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_seq_ids_are_monotonic_across_batches() {
        let sink = ScriptedSink::default();
        let mut engine = engine(&sink);

        let mut batch = records(2);
        batch[0].message = "first".to_string();
        engine.write_batch(batch).await.unwrap();
        engine.write_batch(records(2)).await.unwrap();
        assert_eq!(engine.next_seq_id, 4);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let sink = ScriptedSink::default();
        let mut engine = engine(&sink);

        engine.write_batch(Vec::new()).await.unwrap();
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_event_payload_is_pretty_json_with_record_time() {
        // the scripted sink doesn't keep payloads, so check through a mock
        let mock = crate::mock::MockSink::new();
        let config = Config {
            log_group: "g".to_string(),
            log_stream: "s".to_string(),
            ..Config::default()
        };
        let mut engine = DeliveryEngine::new(mock.clone(), &config);
        let record = Record {
            message: "Journal started".to_string(),
            priority: Priority::Info,
            time_usec: 1_480_459_022_025,
            ..Record::default()
        };
        engine.write_batch(vec![record]).await.unwrap();

        let calls = mock.put_calls();
        assert_eq!(calls.len(), 1);
        let event = &calls[0].events[0];
        assert_eq!(event.timestamp, 1_480_459_022_025);
        assert!(event.message.contains("\"message\": \"Journal started\""));
        assert!(event.message.contains("\"priority\": \"INFO\""));
        assert!(event.message.contains("\"seq\": 1"));
    }
}
