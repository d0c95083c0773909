use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid paper id: {0}")]
    InvalidPaperId(String),

    #[error("invalid paper record: {0}")]
    InvalidRecord(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    #[diagnostic(help("check paper-harvest.json or the command-line overrides"))]
    InvalidConfig(String),

    #[error("failed to read paper records: {0}")]
    RecordsRead(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("destination root is not writable: {0}")]
    RootNotWritable(String),

    #[error("HTTP client setup failed: {0}")]
    HttpClient(String),

    #[error("illegal state transition for {id}: {from} -> {to}")]
    StateTransition {
        id: String,
        from: String,
        to: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("attempt timed out after {}s", secs(.0))]
    Timeout(Duration),

    #[error("server returned status {0}")]
    HttpStatus(u16),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("malformed URL: {0}")]
    MalformedUrl(String),

    #[error(
        "integrity check failed: expected {}, found {actual} bytes{}",
        describe_expected(.expected),
        magic_suffix(.bad_magic)
    )]
    IntegrityMismatch {
        expected: Option<u64>,
        actual: u64,
        bad_magic: bool,
    },

    #[error("{tool} failed: {message}")]
    ToolFailed {
        tool: String,
        message: String,
        retryable: bool,
    },

    #[error("io error: {0}")]
    Io(String),

    #[error("cancelled by caller")]
    CancelledByCaller,
}

impl FailureReason {
    pub fn kind(&self) -> &'static str {
        match self {
            FailureReason::BackendUnavailable(_) => "BackendUnavailable",
            FailureReason::TransientNetwork(_) => "TransientNetwork",
            FailureReason::Timeout(_) => "Timeout",
            FailureReason::HttpStatus(_) => "HttpStatus",
            FailureReason::NotFound(_) => "NotFound",
            FailureReason::PermissionDenied(_) => "PermissionDenied",
            FailureReason::MalformedUrl(_) => "MalformedUrl",
            FailureReason::IntegrityMismatch { .. } => "IntegrityMismatch",
            FailureReason::ToolFailed { .. } => "ToolFailed",
            FailureReason::Io(_) => "Io",
            FailureReason::CancelledByCaller => "CancelledByCaller",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::TransientNetwork(_)
            | FailureReason::Timeout(_)
            | FailureReason::IntegrityMismatch { .. } => true,
            FailureReason::HttpStatus(status) => is_retryable_status(*status),
            FailureReason::ToolFailed { retryable, .. } => *retryable,
            FailureReason::BackendUnavailable(_)
            | FailureReason::NotFound(_)
            | FailureReason::PermissionDenied(_)
            | FailureReason::MalformedUrl(_)
            | FailureReason::Io(_)
            | FailureReason::CancelledByCaller => false,
        }
    }
}

fn secs(duration: &Duration) -> u64 {
    duration.as_secs()
}

fn describe_expected(expected: &Option<u64>) -> String {
    match expected {
        Some(size) => format!("{size} bytes"),
        None => "a non-empty file".to_string(),
    }
}

fn magic_suffix(bad_magic: &bool) -> &'static str {
    if *bad_magic { " (not a PDF)" } else { "" }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}
