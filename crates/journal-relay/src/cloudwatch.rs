// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CloudWatch Logs sink over the service's JSON protocol.
//!
//! Every operation is a signed POST to the regional endpoint with an
//! `X-Amz-Target` header naming the action. Failures carry a JSON body whose
//! `__type` field is the error code the delivery engine classifies on.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::delivery::{LogEvent, LogSink, LogStreamSummary};
use crate::errors::{ConfigError, SinkError};
use crate::sigv4::{Credentials, RequestSigner};

const TARGET_PREFIX: &str = "Logs_20140328";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const SERVICE: &str = "logs";
const DEFAULT_REGION: &str = "us-west-2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl Credentials {
    /// Resolves credentials from the standard AWS environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            ConfigError::Invalid("AWS_ACCESS_KEY_ID environment variable is not set".to_string())
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            ConfigError::Invalid(
                "AWS_SECRET_ACCESS_KEY environment variable is not set".to_string(),
            )
        })?;
        Ok(Credentials {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

pub struct CloudWatchSink {
    client: reqwest::Client,
    endpoint: String,
    host: String,
    region: String,
    credentials: Credentials,
}

impl CloudWatchSink {
    pub fn new(config: &Config, credentials: Credentials) -> Result<Self, ConfigError> {
        let region = if config.aws_region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            config.aws_region.clone()
        };
        let endpoint = config
            .aws_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://logs.{region}.amazonaws.com"));

        let url: reqwest::Url = endpoint
            .parse()
            .map_err(|err| ConfigError::Invalid(format!("invalid sink endpoint: {err}")))?;
        let mut host = url
            .host_str()
            .ok_or_else(|| ConfigError::Invalid("sink endpoint has no host".to_string()))?
            .to_string();
        if let Some(port) = url.port() {
            host = format!("{host}:{port}");
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ConfigError::Invalid(format!("unable to build HTTP client: {err}")))?;

        Ok(CloudWatchSink {
            client,
            endpoint,
            host,
            region,
            credentials,
        })
    }

    async fn dispatch(
        &self,
        action: &str,
        body: &impl Serialize,
    ) -> Result<Vec<u8>, SinkError> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| SinkError::transport(format!("unable to encode {action}: {err}")))?;
        let target = format!("{TARGET_PREFIX}.{action}");

        let signer = RequestSigner {
            region: &self.region,
            service: SERVICE,
            credentials: &self.credentials,
        };
        let headers = signer.sign(
            &self.host,
            &target,
            CONTENT_TYPE,
            &payload,
            chrono::Utc::now(),
        );

        let mut request = self.client.post(&self.endpoint).body(payload);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|err| SinkError::transport(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| SinkError::transport(err.to_string()))?;

        if status.is_success() {
            debug!(action, "sink call succeeded");
            Ok(bytes.to_vec())
        } else {
            Err(classify_error_body(&bytes, status.as_u16()))
        }
    }
}

/// Maps an error response body onto a classified [`SinkError`]. The `__type`
/// field sometimes carries a `namespace#Code` prefix; only the code matters.
fn classify_error_body(bytes: &[u8], status: u16) -> SinkError {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(rename = "__type")]
        code: Option<String>,
        #[serde(alias = "Message")]
        message: Option<String>,
    }

    match serde_json::from_slice::<ErrorBody>(bytes) {
        Ok(body) => {
            let raw_code = body.code.unwrap_or_default();
            let code = raw_code.rsplit('#').next().unwrap_or(&raw_code);
            let code = if code.is_empty() {
                format!("Http{status}")
            } else {
                code.to_string()
            };
            SinkError::new(code, body.message.unwrap_or_default())
        }
        Err(_) => SinkError::new(
            format!("Http{status}"),
            String::from_utf8_lossy(bytes).into_owned(),
        ),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InputLogEvent<'a> {
    timestamp: i64,
    message: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_token: Option<&'a str>,
    log_events: Vec<InputLogEvent<'a>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsResponse {
    #[serde(default)]
    next_sequence_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsRequest<'a> {
    log_group_name: &'a str,
    log_stream_name_prefix: &'a str,
    limit: usize,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsResponse {
    #[serde(default)]
    log_streams: Vec<LogStreamRow>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct LogStreamRow {
    #[serde(default)]
    log_stream_name: String,
    #[serde(default)]
    upload_sequence_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogStreamRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogGroupRequest<'a> {
    log_group_name: &'a str,
}

#[async_trait]
impl LogSink for CloudWatchSink {
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        sequence_token: Option<&str>,
        events: &[LogEvent],
    ) -> Result<Option<String>, SinkError> {
        let request = PutLogEventsRequest {
            log_group_name: group,
            log_stream_name: stream,
            sequence_token,
            log_events: events
                .iter()
                .map(|event| InputLogEvent {
                    timestamp: event.timestamp,
                    message: &event.message,
                })
                .collect(),
        };
        let bytes = self.dispatch("PutLogEvents", &request).await?;
        let response: PutLogEventsResponse = serde_json::from_slice(&bytes)
            .map_err(|err| SinkError::transport(format!("undecodable PutLogEvents response: {err}")))?;
        Ok(response.next_sequence_token)
    }

    async fn describe_log_streams(
        &self,
        group: &str,
        stream_prefix: &str,
        limit: usize,
    ) -> Result<Vec<LogStreamSummary>, SinkError> {
        let request = DescribeLogStreamsRequest {
            log_group_name: group,
            log_stream_name_prefix: stream_prefix,
            limit,
        };
        let bytes = self.dispatch("DescribeLogStreams", &request).await?;
        let response: DescribeLogStreamsResponse = serde_json::from_slice(&bytes).map_err(|err| {
            SinkError::transport(format!("undecodable DescribeLogStreams response: {err}"))
        })?;
        Ok(response
            .log_streams
            .into_iter()
            .map(|row| LogStreamSummary {
                log_stream_name: row.log_stream_name,
                upload_sequence_token: row.upload_sequence_token,
            })
            .collect())
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), SinkError> {
        let request = CreateLogStreamRequest {
            log_group_name: group,
            log_stream_name: stream,
        };
        self.dispatch("CreateLogStream", &request).await.map(|_| ())
    }

    async fn create_log_group(&self, group: &str) -> Result<(), SinkError> {
        let request = CreateLogGroupRequest {
            log_group_name: group,
        };
        self.dispatch("CreateLogGroup", &request).await.map(|_| ())
    }
}
