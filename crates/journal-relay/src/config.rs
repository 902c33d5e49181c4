// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration: a TOML file of relay settings.
//!
//! Unset or zero values fall back to the documented defaults before
//! validation, so an explicit `queue_batch_size = 0` behaves like leaving the
//! key out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::errors::ConfigError;
use crate::policy::FieldPolicy;
use crate::record::Priority;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// AWS region hosting the log group. Empty selects the client default.
    pub aws_region: String,
    /// Instance identifier stamped on every record.
    pub ec2_instance_id: String,
    pub log_group: String,
    pub log_stream: String,
    /// Minimum severity to ship: a syslog keyword or numeric level.
    pub log_priority: String,
    /// Directory of journal files to read. Required unless a journal is
    /// supplied directly.
    pub journal_dir: Option<PathBuf>,
    /// Bound of the record and batch hand-off channels.
    pub queue_channel_buffer_size: usize,
    pub queue_poll_duration_ms: u64,
    pub queue_flush_log_ms: u64,
    /// Hard cutoff for a released batch.
    pub queue_batch_size: usize,
    /// Maximum events per append call to the sink.
    pub buffer_size: usize,
    pub debug: bool,
    /// Start at the journal tail instead of the head.
    pub tail: bool,
    /// Entries to rewind after seeking to the tail.
    pub rewind: u64,
    /// Journal keys allowed into records. Empty allows everything.
    pub fields: Vec<String>,
    /// Journal keys excluded from records. Wins over `fields`.
    pub omit_fields: Vec<String>,
    pub field_length: usize,
    /// Route events to the log-only sink instead of CloudWatch.
    #[serde(rename = "mock-cloud-watch")]
    pub mock_cloud_watch: bool,
    /// Sink URL override, for integration tests.
    pub aws_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            aws_region: String::new(),
            ec2_instance_id: String::new(),
            log_group: String::new(),
            log_stream: String::new(),
            log_priority: "debug".to_string(),
            journal_dir: None,
            queue_channel_buffer_size: 3,
            queue_poll_duration_ms: 10,
            queue_flush_log_ms: 100,
            queue_batch_size: 10_000,
            buffer_size: 10,
            debug: false,
            tail: false,
            rewind: 0,
            fields: Vec::new(),
            omit_fields: Vec::new(),
            field_length: 255,
            mock_cloud_watch: false,
            aws_endpoint: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Config, ConfigError> {
        let mut config: Config = toml::from_str(data)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        let defaults = Config::default();
        if self.queue_channel_buffer_size == 0 {
            debug!("queue channel size not set, using the default");
            self.queue_channel_buffer_size = defaults.queue_channel_buffer_size;
        }
        if self.queue_poll_duration_ms == 0 {
            debug!("queue poll duration not set, using the default");
            self.queue_poll_duration_ms = defaults.queue_poll_duration_ms;
        }
        if self.queue_flush_log_ms == 0 {
            debug!("queue flush interval not set, using the default");
            self.queue_flush_log_ms = defaults.queue_flush_log_ms;
        }
        if self.queue_batch_size == 0 {
            debug!("queue batch size not set, using the default");
            self.queue_batch_size = defaults.queue_batch_size;
        }
        if self.buffer_size == 0 {
            debug!("delivery buffer size not set, using the default");
            self.buffer_size = defaults.buffer_size;
        }
        if self.field_length == 0 {
            self.field_length = defaults.field_length;
        }
        if self.log_priority.is_empty() {
            self.log_priority = defaults.log_priority;
        }
        if self.tail && self.rewind == 0 {
            debug!("tail is set without a rewind, rewinding 10 entries");
            self.rewind = 10;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if Priority::from_keyword(&self.log_priority).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unrecognized log_priority {:?}",
                self.log_priority
            )));
        }
        if !self.mock_cloud_watch {
            if self.log_group.trim().is_empty() {
                return Err(ConfigError::Invalid("log_group must be set".to_string()));
            }
            if self.log_stream.trim().is_empty() {
                return Err(ConfigError::Invalid("log_stream must be set".to_string()));
            }
        }
        Ok(())
    }

    /// The configured minimum priority threshold.
    pub fn min_priority(&self) -> Priority {
        Priority::from_keyword(&self.log_priority).unwrap_or(Priority::Debug)
    }

    pub fn field_policy(&self) -> FieldPolicy {
        FieldPolicy::new(&self.fields, &self.omit_fields, self.field_length)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.queue_flush_log_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_gets_defaults() {
        let config = Config::from_toml_str("mock-cloud-watch = true").unwrap();
        assert_eq!(config.queue_channel_buffer_size, 3);
        assert_eq!(config.queue_poll_duration_ms, 10);
        assert_eq!(config.queue_flush_log_ms, 100);
        assert_eq!(config.queue_batch_size, 10_000);
        assert_eq!(config.buffer_size, 10);
        assert_eq!(config.field_length, 255);
        assert_eq!(config.log_priority, "debug");
        assert_eq!(config.min_priority(), Priority::Debug);
        assert!(!config.tail);
        assert_eq!(config.rewind, 0);
    }

    #[test]
    fn test_full_config_parses() {
        let config = Config::from_toml_str(
            r#"
            aws_region = "us-east-1"
            ec2_instance_id = "i-0123456789"
            log_group = "relay-group"
            log_stream = "web-01"
            log_priority = "3"
            journal_dir = "/var/log/relay-journal"
            queue_channel_buffer_size = 8
            queue_batch_size = 500
            buffer_size = 25
            tail = true
            rewind = 50
            fields = ["MESSAGE", "_PID"]
            field_length = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.aws_region, "us-east-1");
        assert_eq!(config.log_group, "relay-group");
        assert_eq!(config.min_priority(), Priority::Error);
        assert_eq!(
            config.journal_dir.as_deref(),
            Some(Path::new("/var/log/relay-journal"))
        );
        assert_eq!(config.queue_batch_size, 500);
        assert_eq!(config.buffer_size, 25);
        assert!(config.tail);
        assert_eq!(config.rewind, 50);
        assert_eq!(config.fields, vec!["MESSAGE", "_PID"]);
        assert_eq!(config.flush_interval(), Duration::from_millis(100));
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_zero_values_fall_back_to_defaults() {
        let config = Config::from_toml_str(
            r#"
            mock-cloud-watch = true
            queue_batch_size = 0
            buffer_size = 0
            field_length = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.queue_batch_size, 10_000);
        assert_eq!(config.buffer_size, 10);
        assert_eq!(config.field_length, 255);
    }

    #[test]
    fn test_tail_defaults_rewind() {
        let config = Config::from_toml_str(
            r#"
            mock-cloud-watch = true
            tail = true
            "#,
        )
        .unwrap();
        assert_eq!(config.rewind, 10);
    }

    #[test]
    fn test_group_and_stream_required_without_mock() {
        let err = Config::from_toml_str("log_stream = \"web-01\"").unwrap_err();
        assert!(err.to_string().contains("log_group"));

        let err = Config::from_toml_str("log_group = \"relay-group\"").unwrap_err();
        assert!(err.to_string().contains("log_stream"));

        assert!(Config::from_toml_str("mock-cloud-watch = true").is_ok());
    }

    #[test]
    fn test_unknown_priority_is_rejected() {
        let err = Config::from_toml_str(
            r#"
            mock-cloud-watch = true
            log_priority = "verbose"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("log_priority"));
    }

    #[test]
    fn test_priority_keywords_and_numbers() {
        for (keyword, expected) in [
            ("emerg", Priority::Emergency),
            ("0", Priority::Emergency),
            ("err", Priority::Error),
            ("3", Priority::Error),
            ("warning", Priority::Warning),
            ("debug", Priority::Debug),
        ] {
            let config = Config {
                log_priority: keyword.to_string(),
                ..Config::default()
            };
            assert_eq!(config.min_priority(), expected, "keyword {keyword}");
        }
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let err = Config::from_toml_str("log_group = [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_a_read_error() {
        let err = Config::load(Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
