use thiserror::Error;

use crate::types::ConnectionState;

/// Why a single line was rejected by the frame decoder.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("expected {expected} fields, got {actual}")]
    TokenCount { expected: usize, actual: usize },
    #[error("field {index} is not a valid number: {token:?}")]
    InvalidField { index: usize, token: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("history capacity must be greater than zero")]
    InvalidCapacity,
    #[error("{name} scale must be a positive finite number, got {value}")]
    InvalidScale { name: &'static str, value: f64 },
    #[error("the eight-field layout carries no heart rate; use the estimated heart rate source")]
    HeartRateUnavailable,
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("ingest rejected: device is not connected")]
    NotConnected,
    #[error("invalid connection transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("no derived samples available yet")]
    NoSamples,
    #[error("chunk source failed: {0}")]
    Source(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

/// Failure reported by a persistence or prediction collaborator.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("collaborator rejected the request: {0}")]
    Rejected(String),
    #[error("collaborator timed out")]
    Timeout,
    #[error("i/o failure while forwarding: {0}")]
    Io(#[from] std::io::Error),
    #[error("forwarding worker is no longer running")]
    WorkerGone,
}
