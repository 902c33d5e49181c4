// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The read loop: one blocking reader pulling entries off the journal and
//! emitting records into the queue, in strict journal order.
//!
//! Journal read failures become synthetic error records followed by a fixed
//! backoff; an empty journal parks in the cursor's bounded wait. The loop
//! checks the queue's stop state every iteration, so shutdown latency is
//! bounded by one wait or backoff interval.

use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::journal::Journal;
use crate::policy::FieldPolicy;
use crate::queue::QueueHandle;
use crate::record::{error_record, project};

const WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

pub struct JournalReader {
    journal: Box<dyn Journal>,
    policy: FieldPolicy,
    instance_id: String,
    wait_timeout: Duration,
    error_backoff: Duration,
}

impl JournalReader {
    pub fn new(journal: Box<dyn Journal>, config: &Config) -> Self {
        JournalReader {
            journal,
            policy: config.field_policy(),
            instance_id: config.ec2_instance_id.clone(),
            wait_timeout: WAIT_TIMEOUT,
            error_backoff: ERROR_BACKOFF,
        }
    }

    /// Shrinks the wait and backoff intervals. For tests.
    pub fn with_intervals(mut self, wait_timeout: Duration, error_backoff: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self.error_backoff = error_backoff;
        self
    }

    /// Runs until the queue reports stopped. Call from a blocking thread;
    /// emission applies the queue's backpressure.
    pub fn run(mut self, queue: &QueueHandle) {
        info!("journal reader started");
        while !queue.stopped() {
            self.read_once(queue);
        }
        info!("journal reader stopped");
    }

    fn read_once(&mut self, queue: &QueueHandle) {
        match self.journal.next() {
            Err(err) => {
                error!("error reading from journal: {err}");
                let record = error_record(
                    &self.instance_id,
                    format!("error reading from journal: {err}"),
                );
                if queue.enqueue_blocking(record).is_err() {
                    return;
                }
                std::thread::sleep(self.error_backoff);
            }
            Ok(0) => {
                debug!("journal is drained, waiting for new entries");
                self.journal.wait(Some(self.wait_timeout));
            }
            Ok(_) => {
                let mut record = project(self.journal.as_ref(), &self.policy);
                record.instance_id = self.instance_id.clone();
                let _ = queue.enqueue_blocking(record);
            }
        }
    }
}
