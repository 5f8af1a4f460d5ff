use diesel::r2d2::PoolError;
use diesel::result::Error as DieselError;

/// Failures of the telemetry store and the operations built on it.
///
/// A lost race to create a sensor is not an error: the loser reads back the
/// winner's row.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] DieselError),
}

impl From<PoolError> for StoreError {
    fn from(err: PoolError) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
