// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the relay pipeline.

use std::path::PathBuf;

/// Errors raised while loading or validating the agent configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by a journal source.
///
/// Fatal during startup positioning, downgraded to synthetic error records
/// during steady-state reading.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid journal cursor {0:?}")]
    InvalidCursor(String),

    #[error("no journal entry at the current read position")]
    NoEntry,

    #[error("journal source error: {0}")]
    Source(String),
}

/// Classified error category reported by the log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkErrorKind {
    /// Stream or group does not exist yet.
    ResourceNotFound,
    /// The batch was already accepted by the sink.
    DataAlreadyAccepted,
    /// The supplied sequence token is stale.
    InvalidSequenceToken,
    /// Anything the delivery engine has no recovery path for.
    Other,
}

impl SinkErrorKind {
    /// Maps a sink-reported error code onto a recovery category.
    pub fn from_code(code: &str) -> Self {
        match code {
            "ResourceNotFoundException" => SinkErrorKind::ResourceNotFound,
            "DataAlreadyAcceptedException" => SinkErrorKind::DataAlreadyAccepted,
            "InvalidSequenceTokenException" => SinkErrorKind::InvalidSequenceToken,
            _ => SinkErrorKind::Other,
        }
    }
}

/// An error returned by a log sink operation, carrying the sink's error code
/// alongside its classification.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct SinkError {
    pub kind: SinkErrorKind,
    pub code: String,
    pub message: String,
}

impl SinkError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        SinkError {
            kind: SinkErrorKind::from_code(&code),
            code,
            message: message.into(),
        }
    }

    /// An unclassified transport-level failure (connection refused, timeout).
    pub fn transport(message: impl Into<String>) -> Self {
        SinkError {
            kind: SinkErrorKind::Other,
            code: "TransportError".to_string(),
            message: message.into(),
        }
    }
}

/// Errors returned by `DeliveryEngine::write_batch`.
///
/// None of these are retried internally beyond the one-shot recovery paths;
/// the runner logs them and moves on to the next batch.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to put events: {0}")]
    Put(SinkError),

    #[error("failed to create log stream: {0}")]
    CreateStream(SinkError),

    #[error("failed to create log group: {0}")]
    CreateGroup(SinkError),

    #[error("failed to put events after creating stream: {0}")]
    PutAfterCreate(SinkError),

    #[error("sequence token lookup failed: {0}")]
    TokenLookup(SinkError),

    #[error("sequence token lookup found no stream matching {stream:?}")]
    NoMatchingStream { stream: String },

    #[error("failed to put events after sequence lookup: {0}")]
    PutAfterTokenLookup(SinkError),
}

/// Fatal pipeline errors; everything else is logged and survived.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unable to position journal cursor: {0}")]
    Positioning(JournalError),

    #[error("unable to open journal: {0}")]
    JournalOpen(JournalError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
