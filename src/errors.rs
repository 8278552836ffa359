//! Error types for every layer, plus the playback failure classifier

use thiserror::Error;

/// Rejected before any engine interaction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("invalid playback request: missing {missing}")]
    InvalidRequest { missing: &'static str },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP response code {0}")]
    InvalidResponseCode(u16),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Connection-level failures that are worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::ConnectionFailed(_))
    }
}

impl From<ureq::Error> for TransportError {
    fn from(err: ureq::Error) -> Self {
        let text = err.to_string();
        match err {
            ureq::Error::StatusCode(code) => TransportError::InvalidResponseCode(code),
            ureq::Error::Timeout(_) => TransportError::Timeout(text),
            ureq::Error::HostNotFound | ureq::Error::ConnectionFailed => TransportError::ConnectionFailed(text),
            // The default connector reports refused or dropped sockets as plain I/O
            ureq::Error::Io(io) if is_connection_error(&io) => TransportError::ConnectionFailed(text),
            ureq::Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => TransportError::Timeout(text),
            ureq::Error::Io(io) => TransportError::Io(io),
            _ => TransportError::Request(text),
        }
    }
}

fn is_connection_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | AddrNotAvailable
            | HostUnreachable
            | NetworkUnreachable
    )
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache index unreadable: {0}")]
    Index(#[from] serde_json::Error),
    #[error("corrupt cache entry {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("library I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("library data unreadable: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
    #[error("engine failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session is no longer usable")]
    Terminated,
    #[error("no engine attached")]
    NoEngine,
    #[error("track belongs to another session")]
    StaleTrack,
    #[error("could not start session thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Engine-level reason for a failure, mirroring the media framework's codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackErrorCode {
    IoNetworkConnectionFailed,
    IoNetworkConnectionTimeout,
    IoBadHttpStatus,
    IoFileNotFound,
    ParsingContainerMalformed,
    DecoderInitFailed,
    Unspecified,
}

/// A failure reported by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackFailure {
    pub code: PlaybackErrorCode,
    /// Set when the failure was caused by an HTTP response
    pub http_status: Option<u16>,
    pub message: Option<String>,
}

impl PlaybackFailure {
    pub fn new(code: PlaybackErrorCode, message: impl Into<String>) -> Self {
        Self { code, http_status: None, message: Some(message.into()) }
    }

    pub fn http(status: u16) -> Self {
        Self {
            code: PlaybackErrorCode::IoBadHttpStatus,
            http_status: Some(status),
            message: Some(format!("Response code: {}", status)),
        }
    }
}

impl From<&TransportError> for PlaybackFailure {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::InvalidResponseCode(code) => PlaybackFailure::http(*code),
            TransportError::ConnectionFailed(msg) => {
                PlaybackFailure::new(PlaybackErrorCode::IoNetworkConnectionFailed, msg.clone())
            }
            TransportError::Timeout(msg) => {
                PlaybackFailure::new(PlaybackErrorCode::IoNetworkConnectionTimeout, msg.clone())
            }
            other => PlaybackFailure::new(PlaybackErrorCode::Unspecified, other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    ResourceNotFound,
    AccessDenied,
    ServerError(u16),
    Connectivity,
    Playback,
}

impl ErrorClass {
    /// Every engine-originated class ends the session; recovery means a new request.
    pub fn is_terminal(&self) -> bool {
        true
    }
}

/// What the owner shows the user before closing the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub class: ErrorClass,
    pub title: String,
    pub message: String,
}

impl ErrorReport {
    /// Message with the footnote that the fault lies with the broadcaster
    pub fn user_message(&self) -> String {
        format!("{}\n\nNote: this error comes from the stream provider, not the app.", self.message)
    }
}

pub fn classify(failure: &PlaybackFailure) -> ErrorReport {
    if let Some(status) = failure.http_status {
        let (class, message) = match status {
            404 => (ErrorClass::ResourceNotFound, "Resource not found."),
            403 => (ErrorClass::AccessDenied, "Access denied."),
            other => (ErrorClass::ServerError(other), "Server error."),
        };
        return ErrorReport {
            class,
            title: format!("Server Error ({})", status),
            message: message.to_string(),
        };
    }

    if failure.code == PlaybackErrorCode::IoNetworkConnectionFailed {
        return ErrorReport {
            class: ErrorClass::Connectivity,
            title: "No Connection".to_string(),
            message: "Connection error.".to_string(),
        };
    }

    ErrorReport {
        class: ErrorClass::Playback,
        title: "Error".to_string(),
        message: failure.message.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_statuses() {
        let report = classify(&PlaybackFailure::http(404));
        assert_eq!(report.class, ErrorClass::ResourceNotFound);
        assert_eq!(report.title, "Server Error (404)");
        assert_eq!(report.message, "Resource not found.");

        assert_eq!(classify(&PlaybackFailure::http(403)).class, ErrorClass::AccessDenied);

        let report = classify(&PlaybackFailure::http(503));
        assert_eq!(report.class, ErrorClass::ServerError(503));
        assert_eq!(report.message, "Server error.");
    }

    #[test]
    fn test_connectivity() {
        let failure = PlaybackFailure::new(PlaybackErrorCode::IoNetworkConnectionFailed, "refused");
        let report = classify(&failure);
        assert_eq!(report.class, ErrorClass::Connectivity);
        assert_eq!(report.title, "No Connection");
    }

    #[test]
    fn test_everything_else_keeps_message() {
        let failure = PlaybackFailure::new(PlaybackErrorCode::DecoderInitFailed, "no decoder for hevc");
        let report = classify(&failure);
        assert_eq!(report.class, ErrorClass::Playback);
        assert_eq!(report.message, "no decoder for hevc");
        assert!(report.class.is_terminal());

        // Timeouts are not the connection-failed code
        let timeout = PlaybackFailure::new(PlaybackErrorCode::IoNetworkConnectionTimeout, "read timed out");
        assert_eq!(classify(&timeout).class, ErrorClass::Playback);
    }

    #[test]
    fn test_transport_errors_map_to_failures() {
        let failure = PlaybackFailure::from(&TransportError::InvalidResponseCode(403));
        assert_eq!(failure.http_status, Some(403));

        let failure = PlaybackFailure::from(&TransportError::ConnectionFailed("dns".into()));
        assert_eq!(classify(&failure).class, ErrorClass::Connectivity);
    }

    #[test]
    fn test_refused_socket_is_a_connection_failure() {
        let refused = ureq::Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        let err = TransportError::from(refused);
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert!(err.is_transient());

        let timed_out = TransportError::from(ureq::Error::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)));
        assert!(matches!(timed_out, TransportError::Timeout(_)));
        assert!(!timed_out.is_transient());

        let other = TransportError::from(ureq::Error::Io(std::io::Error::from(std::io::ErrorKind::InvalidData)));
        assert!(matches!(other, TransportError::Io(_)));
    }

    #[test]
    fn test_user_message_footnote() {
        let report = classify(&PlaybackFailure::http(404));
        assert!(report.user_message().starts_with("Resource not found."));
        assert!(report.user_message().contains("stream provider"));
    }
}
