use thiserror::Error;

/// Coarse error classification shared by every service.
///
/// Each kind carries its own retry policy: `Transport` is retried with
/// backoff at the source, `Validation`/`Auth`/`NotFound`/`Conflict` are
/// rejected without retry, `Timeout` is surfaced to the originator,
/// `Overload` sheds new work, `Internal` fails the operation and keeps
/// the service running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Validation,
    Auth,
    NotFound,
    Conflict,
    Timeout,
    Overload,
    Internal,
}

impl ErrorKind {
    /// Wire label used in error envelopes and HTTP bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::Overload => "overload",
            Self::Internal => "internal",
        }
    }

    /// HTTP status code equivalent for the synchronous surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Transport => 502,
            Self::Validation => 400,
            Self::Auth => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Timeout => 504,
            Self::Overload => 503,
            Self::Internal => 500,
        }
    }
}

#[derive(Error, Debug)]
pub enum AliciaError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("overloaded: {0}")]
    Overload(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl AliciaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Validation(_) | Self::Serialize(_) => ErrorKind::Validation,
            Self::Auth(_) => ErrorKind::Auth,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Overload(_) => ErrorKind::Overload,
            Self::Internal(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_to_http_status() {
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::Auth.http_status(), 401);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::Overload.http_status(), 503);
    }

    #[test]
    fn error_carries_its_kind() {
        assert_eq!(
            AliciaError::Overload("queue full".into()).kind(),
            ErrorKind::Overload
        );
        assert_eq!(
            AliciaError::Validation("empty text".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn kind_wire_labels() {
        assert_eq!(ErrorKind::NotFound.as_str(), "not_found");
        assert_eq!(ErrorKind::Transport.as_str(), "transport");
    }
}
