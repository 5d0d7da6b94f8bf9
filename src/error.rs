//! Error types shared by the protocol client, discovery engine and registry.

use thiserror::Error;

/// Failures inside the core. None of these terminate the process: the
/// protocol operations fold them into their result types and log them.
#[derive(Debug, Error)]
pub enum ZeroError {
    /// Connection, timeout or body-read failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The CSE answered with a status the operation does not accept.
    #[error("unexpected status {status}")]
    Status { status: u16 },

    /// Malformed or missing JSON fields.
    #[error("parse error: {0}")]
    Parse(String),

    /// The multicast resolver could not be started.
    #[error("discovery resolver unavailable: {0}")]
    DiscoveryInit(String),

    /// Another discovery run is still in flight.
    #[error("a discovery run is already in progress")]
    DiscoveryBusy,

    /// The registry actor is gone or did not answer.
    #[error("registry actor error: {0}")]
    Actor(String),

    /// A configured header name or value is not valid HTTP.
    #[error("invalid header: {0}")]
    Header(String),
}

impl From<serde_json::Error> for ZeroError {
    fn from(e: serde_json::Error) -> Self {
        ZeroError::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_display() {
        let error = ZeroError::Status { status: 500 };
        assert_eq!(error.to_string(), "unexpected status 500");
    }

    #[test]
    fn test_json_error_becomes_parse_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = ZeroError::from(json_err);
        assert!(matches!(error, ZeroError::Parse(_)));
    }
}
