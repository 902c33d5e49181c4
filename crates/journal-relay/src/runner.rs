// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline orchestration: cursor positioning, task wiring, and the batch
//! drain that feeds the delivery engine.
//!
//! A positioning failure at startup is fatal. A per-batch delivery failure
//! is logged with its context and the pipeline carries on; that batch is
//! lost, which is the documented at-least-once tradeoff.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cloudwatch::CloudWatchSink;
use crate::config::Config;
use crate::delivery::{DeliveryEngine, LogSink};
use crate::dir_journal::DirectoryJournal;
use crate::errors::{ConfigError, JournalError, PipelineError};
use crate::journal::Journal;
use crate::mock::MockSink;
use crate::queue::QueueManager;
use crate::reader::JournalReader;
use crate::record::Record;
use crate::sigv4::Credentials;

/// Seeks the journal to its starting position: tail plus rewind, or head.
/// Failing here means the process cannot safely begin reading.
pub fn position_cursor(journal: &mut dyn Journal, config: &Config) -> Result<(), JournalError> {
    if config.tail {
        journal.seek_tail()?;
        info!("seeked to the end of the journal");
        let count = journal.previous_skip(config.rewind)?;
        info!(requested = config.rewind, count, "rewound the journal");
    } else {
        journal.seek_head()?;
        info!("seeked to the start of the journal");
    }
    Ok(())
}

/// Opens the configured journal backend with its filters installed.
pub fn build_journal(config: &Config) -> Result<Box<dyn Journal>, PipelineError> {
    let dir = config.journal_dir.as_ref().ok_or_else(|| {
        PipelineError::Config(ConfigError::Invalid("journal_dir must be set".to_string()))
    })?;
    info!(dir = %dir.display(), "opening directory journal");
    let mut journal = DirectoryJournal::open(dir).map_err(PipelineError::JournalOpen)?;
    journal.add_log_filters(config);
    Ok(Box::new(journal))
}

/// Builds the configured sink: CloudWatch Logs, or the log-only mock.
pub fn build_sink(config: &Config) -> Result<Box<dyn LogSink>, ConfigError> {
    if config.mock_cloud_watch {
        warn!("using the mock log sink; events will not leave this host");
        return Ok(Box::new(MockSink::new()));
    }
    info!(
        group = %config.log_group,
        stream = %config.log_stream,
        "connecting to CloudWatch Logs"
    );
    let credentials = Credentials::from_env()?;
    Ok(Box::new(CloudWatchSink::new(config, credentials)?))
}

/// Wires the read loop, queue manager, and delivery engine together and
/// drives them until `shutdown` fires and the queue drains.
pub async fn run_pipeline(
    config: Arc<Config>,
    mut journal: Box<dyn Journal>,
    sink: Box<dyn LogSink>,
    shutdown: CancellationToken,
) -> Result<(), PipelineError> {
    info!("starting the relay pipeline");

    position_cursor(journal.as_mut(), &config).map_err(PipelineError::Positioning)?;

    let (queue, handle, batches) = QueueManager::new(&config);
    let queue_task = tokio::spawn(queue.run());

    let reader = JournalReader::new(journal, &config);
    let reader_queue = handle.clone();
    let reader_task = tokio::task::spawn_blocking(move || reader.run(&reader_queue));

    let stop_handle = handle.clone();
    let shutdown_watch = shutdown.clone();
    tokio::spawn(async move {
        shutdown_watch.cancelled().await;
        info!("shutdown requested, stopping the record queue");
        stop_handle.stop();
    });

    drain_batches(&config, sink, batches).await;

    if let Err(err) = reader_task.await {
        error!("journal reader task failed: {err}");
    }
    if let Err(err) = queue_task.await {
        error!("record queue task failed: {err}");
    }
    info!("relay pipeline stopped");
    Ok(())
}

async fn drain_batches(
    config: &Config,
    sink: Box<dyn LogSink>,
    mut batches: mpsc::Receiver<Vec<Record>>,
) {
    let mut engine = DeliveryEngine::new(sink, config);
    while let Some(batch) = batches.recv().await {
        let records = batch.len();
        debug!(records, "writing batch");
        if let Err(err) = engine.write_batch(batch).await {
            // This batch is gone; a delivery failure never tears down the
            // pipeline.
            error!(
                records,
                stream = %config.log_stream,
                "failed to write batch to the log sink: {err}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemJournal;
    use std::collections::HashMap;

    fn entries(count: usize) -> Vec<HashMap<String, String>> {
        (0..count)
            .map(|i| {
                [
                    ("MESSAGE".to_string(), format!("m{i}")),
                    ("PRIORITY".to_string(), "6".to_string()),
                ]
                .into_iter()
                .collect()
            })
            .collect()
    }

    #[test]
    fn test_position_cursor_head() {
        let mut journal = MemJournal::new(entries(5));
        journal.seek_tail().unwrap();

        let config = Config::default();
        position_cursor(&mut journal, &config).unwrap();
        assert_eq!(journal.next().unwrap(), 1);
        assert_eq!(journal.get_data_value("MESSAGE").unwrap(), "m0");
    }

    #[test]
    fn test_position_cursor_tail_with_rewind() {
        let mut journal = MemJournal::new(entries(10));
        let config = Config {
            tail: true,
            rewind: 3,
            ..Config::default()
        };

        position_cursor(&mut journal, &config).unwrap();
        assert_eq!(journal.next().unwrap(), 1);
        assert_eq!(journal.get_data_value("MESSAGE").unwrap(), "m7");
    }

    #[test]
    fn test_build_journal_requires_a_directory() {
        let config = Config::default();
        assert!(matches!(
            build_journal(&config),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_build_sink_mock_flag() {
        let config = Config {
            mock_cloud_watch: true,
            ..Config::default()
        };
        assert!(build_sink(&config).is_ok());
    }
}
