//! Error types for Perps Core

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PerpsError {
    #[error("Invalid time window: {0}. Valid windows: 1h, 4h, 8h, 24h")]
    InvalidWindow(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),
}

pub type PerpsResult<T> = Result<T, PerpsError>;
