//! Error types shared across the gateway

use thiserror::Error;

use crate::types::ParamType;

/// Invalid profile or template input
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid connection profile: {0}")]
    Profile(String),

    #[error("Missing required parameter: {0}")]
    MissingParam(String),

    #[error("Parameter {name} must be of type {expected:?}")]
    ParamType { name: String, expected: ParamType },

    #[error("Invalid identifier: {0:?}")]
    InvalidId(String),
}

/// Storage failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub type StorageResult<T> = Result<T, StorageError>;
