//! Top-level error aggregation for the gateway binary.
//!
//! Subsystems (`identity`, `storage`, `api_client`, `node_manager`) each define
//! their own `thiserror` enum, matching the `dimse` crate's `DimseError`
//! pattern. `GatewayError` wraps them for the CLI boundary, where `anyhow` is
//! used for the final glue per the workspace convention.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Identity(#[from] crate::identity::IdentityError),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    #[error(transparent)]
    Api(#[from] crate::api_client::ApiError),

    #[error(transparent)]
    NodeManager(#[from] crate::node_manager::NodeManagerError),

    #[error(transparent)]
    Dimse(#[from] dimse::DimseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
