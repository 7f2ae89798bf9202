use std::time::Duration;

use crate::api::Problem;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error raised by a publisher callback; always treated as transient by the
/// poller.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Everything that can go wrong talking to an ACME provider.
///
/// The variants map onto a small classification ([`ErrorKind`]) that the
/// order poller uses to decide between retrying in place and failing the
/// order.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The local rate-limit gate denied admission. The gate never sleeps on
    /// the caller's behalf; retry after backing off.
    #[error("local rate limit exceeded for bucket {bucket}")]
    Throttled { bucket: String },

    /// HTTP 429 / `urn:ietf:params:acme:error:rateLimited` from the server.
    #[error("acme rate limited: {problem}")]
    RateLimited {
        /// Parsed `Retry-After` header, when the server sent one.
        retry_after: Option<Duration>,
        problem: Problem,
    },

    /// 5xx or `serverInternal` problem document.
    #[error("acme server error: {problem}")]
    Server { problem: Problem },

    /// Any other problem document (`unauthorized`, `malformed`, `caa`, ...).
    #[error("acme problem (http {status}): {problem}")]
    Protocol { status: u16, problem: Problem },

    /// An authorization reached the `invalid` status; terminal for the order.
    #[error("authorization for {identifier} is invalid")]
    AuthorizationInvalid {
        identifier: String,
        problem: Option<Problem>,
    },

    /// The finalize request was rejected.
    #[error("finalization rejected: {problem}")]
    Finalization { problem: Problem },

    /// A per-state time budget ran out.
    #[error("{what} did not complete within {budget:?}")]
    Timeout {
        what: &'static str,
        budget: Duration,
    },

    #[error("http transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("missing response header: {0}")]
    MissingHeader(&'static str),

    /// The server sent a response this client cannot make sense of.
    #[error("invalid acme response: {0}")]
    InvalidResponse(String),

    /// A KID-mode request was attempted before `newAccount` supplied one.
    #[error("account key ID not set; call new_account first")]
    MissingKeyId,

    /// An authorization offered neither `dns-01` nor `http-01`.
    #[error("no supported challenge offered for {identifier}")]
    NoSupportedChallenge { identifier: String },

    /// Callback failure, wrapped so retry classification sees it as transient.
    #[error("publisher callback failed: {0}")]
    Callback(CallbackError),

    /// The poller was cancelled; no further callbacks fire.
    #[error("order poller cancelled")]
    Cancelled,
}

/// Coarse classification used by the poller's retry logic and surfaced to
/// callers through [`PollerStatus`](crate::poll::PollerStatus).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Throttled,
    RateLimited,
    ServerError,
    AuthorizationInvalid,
    Finalization,
    Timeout,
    Malformed,
    Transport,
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Throttled { .. } => ErrorKind::Throttled,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Server { .. } => ErrorKind::ServerError,
            Error::AuthorizationInvalid { .. } => ErrorKind::AuthorizationInvalid,
            Error::Finalization { .. } => ErrorKind::Finalization,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Transport(_) | Error::Callback(_) => ErrorKind::Transport,
            Error::Cancelled => ErrorKind::Cancelled,

            Error::Protocol { .. }
            | Error::Json(_)
            | Error::Crypto(_)
            | Error::MissingHeader(_)
            | Error::InvalidResponse(_)
            | Error::MissingKeyId
            | Error::NoSupportedChallenge { .. } => ErrorKind::Malformed,
        }
    }

    /// Whether the poller may retry the current state after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Throttled
                | ErrorKind::RateLimited
                | ErrorKind::ServerError
                | ErrorKind::Transport
        )
    }

    /// Server-mandated wait before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn is_bad_nonce(&self) -> bool {
        match self {
            Error::Protocol { problem, .. } => problem.is_bad_nonce(),
            _ => false,
        }
    }
}

/// Classify a non-2xx response into an [`Error`].
pub(crate) fn classify_problem(
    status: u16,
    problem: Problem,
    retry_after: Option<Duration>,
) -> Error {
    if status == 429 || problem.is_rate_limited() {
        Error::RateLimited {
            retry_after,
            problem,
        }
    } else if status >= 500 || problem.is_server_internal() {
        Error::Server { problem }
    } else {
        Error::Protocol { status, problem }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(_type: &str) -> Problem {
        Problem {
            _type: _type.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_rate_limited() {
        let err = classify_problem(
            429,
            problem("urn:ietf:params:acme:error:rateLimited"),
            Some(Duration::from_secs(2)),
        );
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_classify_server_internal() {
        let err = classify_problem(500, problem("urn:ietf:params:acme:error:serverInternal"), None);
        assert_eq!(err.kind(), ErrorKind::ServerError);
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_malformed_is_terminal() {
        let err = classify_problem(400, problem("urn:ietf:params:acme:error:malformed"), None);
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_bad_nonce_detection() {
        let err = classify_problem(400, problem("urn:ietf:params:acme:error:badNonce"), None);
        assert!(err.is_bad_nonce());
    }

    #[test]
    fn test_authorization_invalid_is_terminal() {
        let err = Error::AuthorizationInvalid {
            identifier: "example.com".to_owned(),
            problem: None,
        };
        assert_eq!(err.kind(), ErrorKind::AuthorizationInvalid);
        assert!(!err.is_transient());
    }
}
