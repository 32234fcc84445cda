use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

/// Setup problems that stop the SDK from starting.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no app token configured and none stored from a previous run")]
    MissingAppToken,
    #[error("package name {actual} does not match the registered package {expected}")]
    PackageMismatch { expected: String, actual: String },
    #[error("no platform data directory available; set filesDir and storePath")]
    NoDataDirectory,
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum SdkError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to start background runtime: {0}")]
    Runtime(#[source] std::io::Error),
}
