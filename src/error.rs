use std::time::Duration;

use thiserror::Error;

use crate::db::migrate::MigrationError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    #[error("Pool construction failed: {0}")]
    PoolConstruction(#[source] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("No connection available within {timeout:?}: {source}")]
    ConnectionUnavailable {
        timeout: Duration,
        #[source]
        source: sqlx::Error,
    },

    #[error("Data source is not started")]
    NotStarted,

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Builds a configuration error from a plain message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(config::ConfigError::Message(message.into()))
    }

    /// True when the lease failed because the pool had been closed underneath
    /// the caller, as opposed to running out of connections.
    pub fn is_pool_closed(&self) -> bool {
        matches!(
            self,
            Error::ConnectionUnavailable {
                source: sqlx::Error::PoolClosed,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_closed_detection() {
        let closed = Error::ConnectionUnavailable {
            timeout: Duration::from_secs(1),
            source: sqlx::Error::PoolClosed,
        };
        let timed_out = Error::ConnectionUnavailable {
            timeout: Duration::from_secs(1),
            source: sqlx::Error::PoolTimedOut,
        };

        assert!(closed.is_pool_closed());
        assert!(!timed_out.is_pool_closed());
        assert!(!Error::NotStarted.is_pool_closed());
    }

    #[test]
    fn test_configuration_message() {
        let err = Error::configuration("unsupported driver: mysql");
        assert!(err.to_string().contains("unsupported driver: mysql"));
    }
}
