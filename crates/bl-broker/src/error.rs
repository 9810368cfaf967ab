use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The receipt handle is not (or no longer) the current claim.
    #[error("Receipt not found: {0}")]
    NotFound(String),
}

impl BrokerError {
    /// Errors worth backing off and retrying.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for BrokerError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                BrokerError::Unavailable(e.to_string())
            }
            sqlx::Error::Database(ref db) if db.message().contains("database is locked") => {
                BrokerError::Unavailable(e.to_string())
            }
            other => BrokerError::Database(other.to_string()),
        }
    }
}
