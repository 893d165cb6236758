use thiserror::Error;

use crate::bot::ConversationKey;

/// The analytics engine has exactly one way to fail: the series cannot
/// support a full report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyticsError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No timer facility; background scanning is disabled for the process.
    #[error("scheduling unavailable: {0}")]
    Unavailable(String),
    #[error("scan tick failed for chat {key}: {reason}")]
    TickFailure { key: ConversationKey, reason: String },
}

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bybit api error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("rate limited by exchange")]
    RateLimited,
    #[error("malformed exchange response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker pool is closed")]
    Closed,
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
