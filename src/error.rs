//! Classified errors surfaced by the router.
//!
//! Every failure that crosses the crate boundary carries a kind from the
//! closed [`ErrorKind`] set, the binding and request id when known, the
//! number of attempts made, and an optional retry-after hint. `AllFailed`
//! additionally carries the per-spec causes in input order.

use std::fmt;
use std::time::Duration;

/// Closed classification of router failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request, unknown model, or a 4xx other than 408/429.
    ClientError,
    /// 401 or 403 from the provider.
    AuthError,
    /// 429 or a provider-signaled quota; may carry a retry-after hint.
    RateLimited,
    /// 5xx from the provider.
    ServerError,
    /// DNS, TCP, TLS, or connection-level failure.
    NetworkError,
    /// Per-attempt deadline exceeded (internal cancellation).
    Timeout,
    /// Caller cancellation.
    Canceled,
    /// Short-circuited by an open circuit breaker.
    BreakerOpen,
    /// Unknown binding or invalid orchestrator state.
    ConfigError,
    /// A race exhausted every spec; `causes` holds the individual errors.
    AllFailed,
}

impl ErrorKind {
    /// Whether the retry executor may attempt again after this kind.
    /// `BreakerOpen` has its own window-based rule in the executor.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::ServerError
                | ErrorKind::NetworkError
                | ErrorKind::Timeout
        )
    }

    /// Whether this kind counts toward the circuit breaker failure counter.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::ServerError
                | ErrorKind::NetworkError
                | ErrorKind::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClientError => "client_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::BreakerOpen => "breaker_open",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::AllFailed => "all_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified router error. No stack traces cross this boundary.
#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub binding: Option<String>,
    pub request_id: Option<String>,
    /// Attempts made before this error was surfaced (0 when the call never
    /// reached the provider).
    pub attempts: u32,
    pub retry_after: Option<Duration>,
    /// Populated only for `AllFailed`, in spec input order.
    pub causes: Vec<Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            binding: None,
            request_id: None,
            attempts: 0,
            retry_after: None,
            causes: Vec::new(),
        }
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "canceled by caller")
    }

    pub fn timeout(elapsed: Duration, limit: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("attempt exceeded deadline after {elapsed:?} (limit {limit:?})"),
        )
    }

    pub fn breaker_open(remaining: Duration) -> Self {
        Self::new(
            ErrorKind::BreakerOpen,
            format!("circuit open, {}ms until half-open", remaining.as_millis()),
        )
        .with_retry_after(remaining)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigError, message)
    }

    pub fn all_failed(causes: Vec<Error>) -> Self {
        let mut err = Self::new(
            ErrorKind::AllFailed,
            format!("all {} specs failed", causes.len()),
        );
        err.causes = causes;
        err
    }

    /// Classify an HTTP status from a provider response.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::AuthError,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            400..=499 => ErrorKind::ClientError,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::ServerError,
        };
        Self::new(kind, message)
    }

    pub fn with_binding(mut self, binding: impl Into<String>) -> Self {
        self.binding = Some(binding.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_breaker_open(&self) -> bool {
        self.kind == ErrorKind::BreakerOpen
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(binding) = &self.binding {
            write!(f, " [binding={binding}]")?;
        }
        if self.attempts > 0 {
            write!(f, " [attempts={}]", self.attempts)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.causes.last().map(|e| e as &dyn std::error::Error)
    }
}

/// Construction-time configuration errors from the orchestrator builder.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("at least one provider is required")]
    NoProviders,
    #[error("registry entry {key:?} names a provider that was not supplied")]
    UnknownProvider { key: String },
    #[error("limit for {key:?}: rps must be > 0 (got {rps})")]
    InvalidRate { key: String, rps: f64 },
    #[error("limit for {key:?}: burst must be >= rps (got burst={burst}, rps={rps})")]
    InvalidBurst { key: String, burst: f64, rps: f64 },
    #[error("retry max_attempts must be >= 1")]
    InvalidMaxAttempts,
    #[error("breaker failure_threshold must be >= 1")]
    InvalidFailureThreshold,
    #[error("breaker half_open_probes must be >= 1")]
    InvalidHalfOpenProbes,
}
