// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching stage: turns the continuous record stream into right-sized,
//! latency-bounded batches for the delivery engine.
//!
//! Split into a [`QueueManager`] service driving the buffers and a cloneable
//! [`QueueHandle`] for producers. A batch is released when the active buffer
//! reaches the configured size or when the flush timer (armed on the first
//! record after an empty period) elapses. Released batches leave through a
//! bounded channel in FIFO order; the channel bound is the pipeline's only
//! backpressure mechanism.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::record::Record;

const SUMMARY_INTERVAL: Duration = Duration::from_secs(120);

/// Instrumentation counters, owned per queue instance and shared with its
/// handles. Observable side effects only; nothing branches on them.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Batches released downstream.
    pub batches: AtomicU64,
    /// Poll ticks that flushed a partial buffer because nothing new arrived.
    pub idle_polls: AtomicU64,
    /// Poll ticks that found nothing buffered at all.
    pub empty_polls: AtomicU64,
}

/// The rotating buffer pair. The batch handed downstream is always a
/// different allocation from the one the next batch fills, so the consumer
/// can hold a released batch for as long as it likes.
struct RecordBuffers {
    bufs: [Vec<Record>; 2],
    active: usize,
    capacity: usize,
}

impl RecordBuffers {
    fn new(capacity: usize) -> Self {
        RecordBuffers {
            bufs: [Vec::with_capacity(capacity), Vec::with_capacity(capacity)],
            active: 0,
            capacity,
        }
    }

    fn push(&mut self, record: Record) -> usize {
        self.bufs[self.active].push(record);
        self.bufs[self.active].len()
    }

    fn is_empty(&self) -> bool {
        self.bufs[self.active].is_empty()
    }

    fn release(&mut self) -> Vec<Record> {
        let batch = mem::replace(
            &mut self.bufs[self.active],
            Vec::with_capacity(self.capacity),
        );
        self.active = 1 - self.active;
        batch
    }
}

/// Returned when a record is offered to a stopped queue.
#[derive(Debug, thiserror::Error)]
#[error("record queue is stopped")]
pub struct QueueStopped;

/// Producer side of the queue. Cheap to clone.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Record>,
    stop: CancellationToken,
    stats: Arc<QueueStats>,
}

impl QueueHandle {
    /// Enqueues a record, applying channel backpressure.
    pub async fn enqueue(&self, record: Record) -> Result<(), QueueStopped> {
        if self.stop.is_cancelled() {
            return Err(QueueStopped);
        }
        self.tx.send(record).await.map_err(|_| QueueStopped)
    }

    /// Enqueues from a blocking thread (the journal reader).
    pub fn enqueue_blocking(&self, record: Record) -> Result<(), QueueStopped> {
        if self.stop.is_cancelled() {
            return Err(QueueStopped);
        }
        self.tx.blocking_send(record).map_err(|_| QueueStopped)
    }

    /// Stops the queue. Idempotent. Further enqueues are rejected; records
    /// already accepted are drained and flushed as a final partial batch
    /// before the batch channel closes.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Non-blocking poll used by the read loop to decide between "wait for
    /// more" and "terminate".
    pub fn stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

pub struct QueueManager {
    rx: mpsc::Receiver<Record>,
    out: mpsc::Sender<Vec<Record>>,
    stop: CancellationToken,
    stats: Arc<QueueStats>,
    batch_size: usize,
    flush_interval: Duration,
    poll_interval: Duration,
}

impl QueueManager {
    /// Builds the service, its producer handle, and the batch channel's
    /// receiving end.
    pub fn new(config: &Config) -> (QueueManager, QueueHandle, mpsc::Receiver<Vec<Record>>) {
        let capacity = config.queue_channel_buffer_size.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let stop = CancellationToken::new();
        let stats = Arc::new(QueueStats::default());

        let manager = QueueManager {
            rx,
            out: out_tx,
            stop: stop.clone(),
            stats: Arc::clone(&stats),
            batch_size: config.queue_batch_size.max(1),
            flush_interval: config.flush_interval(),
            poll_interval: config.poll_interval(),
        };
        let handle = QueueHandle { tx, stop, stats };

        (manager, handle, out_rx)
    }

    pub async fn run(mut self) {
        debug!("record queue started");

        let mut buffers = RecordBuffers::new(self.batch_size);
        let mut flush_deadline: Option<Instant> = None;
        let mut arrived_since_poll = false;
        let mut draining = false;

        let mut poll_tick = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut summary_tick = interval_at(Instant::now() + SUMMARY_INTERVAL, SUMMARY_INTERVAL);
        summary_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let flush_timer = async {
                match flush_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                maybe_record = self.rx.recv() => match maybe_record {
                    Some(record) => {
                        arrived_since_poll = true;
                        let len = buffers.push(record);
                        if len == 1 {
                            flush_deadline = Some(Instant::now() + self.flush_interval);
                        }
                        if len >= self.batch_size {
                            self.release(&mut buffers, &mut flush_deadline, "size").await;
                        }
                    }
                    None => {
                        // producers are gone (or the stop drain finished)
                        self.release(&mut buffers, &mut flush_deadline, "final").await;
                        break;
                    }
                },

                _ = flush_timer => {
                    self.release(&mut buffers, &mut flush_deadline, "timer").await;
                }

                _ = poll_tick.tick() => {
                    if !arrived_since_poll {
                        if buffers.is_empty() {
                            self.stats.empty_polls.fetch_add(1, Ordering::Relaxed);
                        } else {
                            self.release(&mut buffers, &mut flush_deadline, "idle").await;
                            self.stats.idle_polls.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    arrived_since_poll = false;
                }

                _ = summary_tick.tick() => {
                    info!(
                        batches = self.stats.batches.load(Ordering::Relaxed),
                        idle = self.stats.idle_polls.load(Ordering::Relaxed),
                        empty = self.stats.empty_polls.load(Ordering::Relaxed),
                        "record queue summary"
                    );
                }

                _ = self.stop.cancelled(), if !draining => {
                    // reject new sends, then drain what was already accepted
                    self.rx.close();
                    draining = true;
                }
            }
        }

        debug!("record queue stopped");
    }

    async fn release(
        &self,
        buffers: &mut RecordBuffers,
        flush_deadline: &mut Option<Instant>,
        reason: &str,
    ) {
        *flush_deadline = None;
        if buffers.is_empty() {
            return;
        }
        let batch = buffers.release();
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        debug!(records = batch.len(), reason, "releasing batch");
        if self.out.send(batch).await.is_err() {
            warn!("batch consumer is gone; discarding batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn record(message: impl Into<String>) -> Record {
        Record {
            message: message.into(),
            ..Record::default()
        }
    }

    fn config(batch_size: usize, flush_ms: u64, poll_ms: u64) -> Config {
        Config {
            queue_batch_size: batch_size,
            queue_flush_log_ms: flush_ms,
            queue_poll_duration_ms: poll_ms,
            queue_channel_buffer_size: 16,
            ..Config::default()
        }
    }

    async fn recv_batch(rx: &mut mpsc::Receiver<Vec<Record>>) -> Vec<Record> {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a batch")
            .expect("batch channel closed early")
    }

    #[tokio::test]
    async fn test_size_cutoff_releases_full_batches() {
        let (manager, handle, mut batches) = QueueManager::new(&config(3, 10_000, 10_000));
        tokio::spawn(manager.run());

        for i in 0..7 {
            handle.enqueue(record(format!("r{i}"))).await.unwrap();
        }

        let first = recv_batch(&mut batches).await;
        let second = recv_batch(&mut batches).await;
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);

        handle.stop();
        let last = recv_batch(&mut batches).await;
        assert_eq!(last.len(), 1);
        assert!(batches.recv().await.is_none());

        let all: Vec<String> = [first, second, last]
            .concat()
            .into_iter()
            .map(|r| r.message)
            .collect();
        let expected: Vec<String> = (0..7).map(|i| format!("r{i}")).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn test_timer_flush_releases_partial_batch() {
        let (manager, handle, mut batches) = QueueManager::new(&config(100, 50, 10_000));
        tokio::spawn(manager.run());

        handle.enqueue(record("a")).await.unwrap();
        handle.enqueue(record("b")).await.unwrap();

        let batch = recv_batch(&mut batches).await;
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        handle.stop();
    }

    #[tokio::test]
    async fn test_idle_poll_flushes_partial_batch() {
        let (manager, handle, mut batches) = QueueManager::new(&config(100, 60_000, 20));
        tokio::spawn(manager.run());

        handle.enqueue(record("a")).await.unwrap();

        let batch = recv_batch(&mut batches).await;
        assert_eq!(batch.len(), 1);
        assert!(handle.stats().idle_polls.load(Ordering::Relaxed) >= 1);
        handle.stop();
    }

    #[tokio::test]
    async fn test_empty_polls_are_counted() {
        let (manager, handle, _batches) = QueueManager::new(&config(100, 60_000, 10));
        tokio::spawn(manager.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.stats().empty_polls.load(Ordering::Relaxed) >= 1);
        handle.stop();
    }

    #[tokio::test]
    async fn test_stop_drains_accepted_records() {
        let (manager, handle, mut batches) = QueueManager::new(&config(100, 60_000, 60_000));
        tokio::spawn(manager.run());

        for i in 0..5 {
            handle.enqueue(record(format!("r{i}"))).await.unwrap();
        }
        handle.stop();
        handle.stop(); // idempotent

        let batch = recv_batch(&mut batches).await;
        assert_eq!(batch.len(), 5);
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_is_rejected() {
        let (manager, handle, _batches) = QueueManager::new(&config(100, 60_000, 60_000));
        tokio::spawn(manager.run());

        handle.stop();
        assert!(handle.stopped());
        assert!(handle.enqueue(record("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_batches_preserve_enqueue_order() {
        let (manager, handle, mut batches) = QueueManager::new(&config(7, 20, 60_000));
        tokio::spawn(manager.run());

        let total = 250;
        let producer = {
            let handle = handle.clone();
            tokio::spawn(async move {
                for i in 0..total {
                    handle.enqueue(record(format!("{i}"))).await.unwrap();
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < total {
            let batch = recv_batch(&mut batches).await;
            assert!(!batch.is_empty());
            assert!(batch.len() <= 7);
            seen.extend(batch.into_iter().map(|r| r.message));
        }
        producer.await.unwrap();
        handle.stop();
        while let Some(batch) = batches.recv().await {
            seen.extend(batch.into_iter().map(|r| r.message));
        }

        let expected: Vec<String> = (0..total).map(|i| format!("{i}")).collect();
        assert_eq!(seen, expected);
        assert!(handle.stats().batches.load(Ordering::Relaxed) >= (total / 7) as u64);
    }

    #[test]
    fn test_record_buffers_rotate() {
        let mut buffers = RecordBuffers::new(4);
        assert!(buffers.is_empty());
        buffers.push(record("a"));
        buffers.push(record("b"));

        let batch = buffers.release();
        assert_eq!(batch.len(), 2);
        assert!(buffers.is_empty());

        // the released batch stays intact while the next one fills
        buffers.push(record("c"));
        assert_eq!(batch[0].message, "a");
        assert_eq!(buffers.release().len(), 1);
    }
}
