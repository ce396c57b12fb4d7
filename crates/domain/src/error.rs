/// Shared error type used across all VidScribe crates.
///
/// The step executor keys its retry decision off [`Error::is_retriable`]:
/// transient network/storage failures are retried with backoff, everything
/// else propagates immediately.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store: {0}")]
    Store(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("data anomaly: {0}")]
    DataAnomaly(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("run cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the step executor may retry after this error.
    ///
    /// 4xx-like conditions, validation and schema failures, and data
    /// anomalies are permanent; network, storage, and 5xx-like conditions
    /// are worth another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Store(_) | Self::Transient(_))
    }

    /// Stable label recorded in `step_error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Store(_) => "store",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
            Self::DataAnomaly(_) => "data_anomaly",
            Self::Provider { .. } => "provider",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retriable() {
        assert!(Error::Transient("503".into()).is_retriable());
        assert!(Error::Store("disk full".into()).is_retriable());
        assert!(Error::Io(std::io::Error::other("nope")).is_retriable());
    }

    #[test]
    fn permanent_errors_are_not_retriable() {
        assert!(!Error::NotFound("no transcript".into()).is_retriable());
        assert!(!Error::Fatal("HTTP 403".into()).is_retriable());
        assert!(!Error::Validation("bad id".into()).is_retriable());
        assert!(!Error::Cancelled.is_retriable());
        assert!(!Error::DataAnomaly("row without artifact".into()).is_retriable());
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(Error::Transient("x".into()).kind(), "transient");
        assert_eq!(Error::NotFound("x".into()).kind(), "not_found");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
    }
}
