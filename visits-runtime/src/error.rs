use {
    std::time::Duration,
    thiserror::Error,
    hyper::StatusCode,
    crate::{kv::StorageError, config::ConfigError, metrics::MetricsError},
};

/// Reasons a single counter invocation failed. None of them leave a partial update behind.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum CounterError {
    #[error("counter store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("counter store throttled: {reason}")]
    StoreThrottled { reason: String },

    #[error("counter store did not respond within {timeout:?}")]
    StoreTimeout { timeout: Duration },

    #[error("counter store returned malformed result: {reason}")]
    MalformedResult { reason: String },

    #[error("counter key rejected by store: {reason}")]
    InvalidKey { reason: String },

    #[error("counter store task failed: {reason}")]
    TaskFailed { reason: String },
}

impl CounterError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::StoreUnavailable { .. } | Self::StoreThrottled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::StoreTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::MalformedResult { .. } | Self::InvalidKey { .. } | Self::TaskFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label used for the `counter_errors_total` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreUnavailable { .. } => "unavailable",
            Self::StoreThrottled { .. } => "throttled",
            Self::StoreTimeout { .. } => "timeout",
            Self::MalformedResult { .. } => "malformed",
            Self::InvalidKey { .. } => "invalid_key",
            Self::TaskFailed { .. } => "task_failed",
        }
    }

    pub(crate) fn response_text(&self) -> &'static str {
        match self {
            Self::StoreUnavailable { .. } => "visits: counter store unavailable.\n",
            Self::StoreThrottled { .. } => "visits: counter store throttled.\n",
            Self::StoreTimeout { .. } => "visits: counter store timed out.\n",
            Self::MalformedResult { .. } | Self::InvalidKey { .. } | Self::TaskFailed { .. } => "visits: internal error.\n",
        }
    }
}

impl From<StorageError> for CounterError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable { description } => Self::StoreUnavailable { reason: description },
            StorageError::Throttled { description } => Self::StoreThrottled { reason: description },
            StorageError::MalformedValue { description } => Self::MalformedResult { reason: description },
            StorageError::KeyConstraintError { description } => Self::InvalidKey { reason: description },
            StorageError::Cancelled => Self::TaskFailed { reason: "store operation was cancelled".to_owned() },
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("failed to bind listener on {addr}: {reason}")]
    Bind { addr: String, reason: String },
}
