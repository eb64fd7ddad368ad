use thiserror::Error;

/// Result type used across the library
pub type Result<T> = std::result::Result<T, BotError>;

/// How a failure should be handled by the loop that observed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, empty data. Retried with a bounded counter.
    TransientFeed,
    /// Requotes and temporary rejects. Retried a few times by the executor.
    TransientOrder,
    /// The single signal is discarded, surrounding loops continue.
    FatalSignal,
    /// Trading cannot start.
    FatalProcess,
}

#[derive(Error, Debug)]
pub enum BotError {
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("no data returned for {0}")]
    EmptyData(String),

    #[error("gateway request failed: {0}")]
    Gateway(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("order rejected with status {status}: {raw}")]
    OrderRejected { status: u32, raw: String },

    #[error("instrument metadata unavailable for {0}")]
    InstrumentUnavailable(String),

    #[error("sizing failed: {0}")]
    Sizing(String),

    #[error("strategy {strategy} failed: {reason}")]
    Strategy { strategy: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("startup failed: {0}")]
    Startup(String),
}

impl BotError {
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        BotError::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    pub fn strategy(strategy: impl Into<String>, reason: impl Into<String>) -> Self {
        BotError::Strategy {
            strategy: strategy.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BotError::Timeout { .. }
            | BotError::EmptyData(_)
            | BotError::Gateway(_)
            | BotError::Http(_)
            | BotError::Json(_) => ErrorKind::TransientFeed,
            BotError::OrderRejected { .. } => ErrorKind::TransientOrder,
            BotError::InstrumentUnavailable(_)
            | BotError::Sizing(_)
            | BotError::Strategy { .. } => ErrorKind::FatalSignal,
            BotError::Configuration(_) | BotError::Startup(_) => ErrorKind::FatalProcess,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            BotError::timeout("fetch_latest_bar_timestamp", 10).kind(),
            ErrorKind::TransientFeed
        );
        assert_eq!(
            BotError::Sizing("zero distance".into()).kind(),
            ErrorKind::FatalSignal
        );
        assert_eq!(
            BotError::Startup("login".into()).kind(),
            ErrorKind::FatalProcess
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = BotError::timeout("list_open_positions", 5);
        assert_eq!(err.to_string(), "list_open_positions timed out after 5s");
    }
}
