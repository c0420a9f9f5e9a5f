use thiserror::Error;

/// Outcome of a failed cluster call, as distinguished by the cluster state API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The request itself was rejected as invalid; resending it cannot help.
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("transport: {0}")]
    Transport(String),
}

/// Classified reconcile failure handed to the worker pool. The queue never sees raw errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Transient(_))
    }
}

impl From<ApiError> for ReconcileError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Invalid(_) => ReconcileError::Permanent(e.to_string()),
            ApiError::AlreadyExists(_) | ApiError::Conflict(_) | ApiError::NotFound(_) | ApiError::Transport(_) => {
                ReconcileError::Transient(e.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key {0:?} has no namespace separator")]
    MissingSeparator(String),
    #[error("malformed key {0:?}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("workers must be at least 1")]
    NoWorkers,
    #[error("max_attempts must be at least 1")]
    NoAttempts,
    #[error("retry_burst must be at least 1 when retry_qps is set")]
    NoRetryBurst,
    #[error("base_delay {base:?} exceeds max_delay {max:?}")]
    DelayOrder { base: std::time::Duration, max: std::time::Duration },
    #[error("fallback port {0} outside 1..=65535")]
    FallbackPort(i32),
    #[error("invalid port policy {0:?}")]
    PortPolicy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invalid_requests_are_permanent() {
        assert!(!ReconcileError::from(ApiError::Invalid("bad port".into())).is_retryable());
        assert!(ReconcileError::from(ApiError::Conflict("rv".into())).is_retryable());
        assert!(ReconcileError::from(ApiError::Transport("reset".into())).is_retryable());
    }
}
