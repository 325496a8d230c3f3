//! Error taxonomy for the validation pipeline
//!
//! Per-item errors (`ParseError`, `ProbeError`, `CoreError`) never abort a
//! batch; they are folded into a [`FailureKind`] on the candidate and counted
//! in the run summary. `StoreError` aborts the run, `OutputError` only the
//! artifact it belongs to.

use crate::proxy::models::Scheme;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Errors raised while turning raw text into candidates
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed URI {uri}: {reason}")]
    Malformed { uri: String, reason: String },
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

impl ParseError {
    pub fn malformed(uri: &str, reason: impl Into<String>) -> Self {
        ParseError::Malformed {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ParseError::Malformed { .. } => FailureKind::MalformedUri,
            ParseError::UnsupportedScheme(_) => FailureKind::UnsupportedScheme,
        }
    }
}

/// Errors raised by the Stage 1 and Stage 2 probers
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("endpoint is not a proxy: {0}")]
    NotAProxy(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProbeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProbeError::Timeout => FailureKind::ProbeTimeout,
            ProbeError::ConnectionRefused => FailureKind::ProbeConnectionRefused,
            ProbeError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                FailureKind::ProbeConnectionRefused
            }
            ProbeError::Io(e) if e.kind() == io::ErrorKind::TimedOut => FailureKind::ProbeTimeout,
            _ => FailureKind::ProbeFailed,
        }
    }
}

/// Errors raised by the Stage 3 core validator
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("core does not support scheme {0}")]
    Unsupported(Scheme),
    #[error("failed to start core: {0}")]
    Start(String),
    #[error("request through core failed: {0}")]
    Response(String),
    #[error("core validation timed out")]
    Timeout,
}

impl CoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CoreError::Unsupported(_) => FailureKind::CoreUnsupported,
            CoreError::Start(_) => FailureKind::CoreStartFailure,
            CoreError::Response(_) | CoreError::Timeout => FailureKind::CoreResponseError,
        }
    }
}

/// Errors raised by the durable stability store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open stability store: {0}")]
    Open(#[source] sqlx::Error),
    #[error("failed to read stability store: {0}")]
    Read(#[source] sqlx::Error),
    #[error("failed to write stability store: {0}")]
    Write(#[source] sqlx::Error),
    #[error("corrupt stability record {fingerprint}: {reason}")]
    Corrupt { fingerprint: String, reason: String },
}

/// Error writing one output artifact
#[derive(Debug, thiserror::Error)]
#[error("failed to write {path}: {source}")]
pub struct OutputError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Errors that abort a whole run
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no network connectivity, run aborted before probing")]
    NoConnectivity,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            PipelineError::NoConnectivity => None,
            PipelineError::Store(_) => Some(FailureKind::StoreWriteFailure),
        }
    }
}

/// Failure classification used in candidate results and run summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MalformedUri,
    UnsupportedScheme,
    ProbeTimeout,
    ProbeConnectionRefused,
    ProbeFailed,
    CoreStartFailure,
    CoreResponseError,
    CoreUnsupported,
    StoreWriteFailure,
    OutputWriteFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::MalformedUri => "malformed_uri",
            FailureKind::UnsupportedScheme => "unsupported_scheme",
            FailureKind::ProbeTimeout => "probe_timeout",
            FailureKind::ProbeConnectionRefused => "probe_connection_refused",
            FailureKind::ProbeFailed => "probe_failed",
            FailureKind::CoreStartFailure => "core_start_failure",
            FailureKind::CoreResponseError => "core_response_error",
            FailureKind::CoreUnsupported => "core_unsupported",
            FailureKind::StoreWriteFailure => "store_write_failure",
            FailureKind::OutputWriteFailure => "output_write_failure",
        };
        write!(f, "{}", name)
    }
}
