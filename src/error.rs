//! The error taxonomy shared by the protocol engine, producer and consumer.
use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The socket (or TLS session) failed, or the server went away.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server sent something this client can't make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server refused the credentials offered in the handshake.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A job, filter or operation was rejected locally, before any I/O.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An explicit `-<CODE> <message>` reply. The message is the server's,
    /// unmodified.
    #[error("server replied {code}: {message}")]
    Server { code: String, message: String },

    /// A bounded wait on the socket ran out.
    #[error("timed out after {0:?} waiting for the server")]
    Timeout(Duration),

    /// Client or consumer configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this failure happened below the protocol, so that redialling
    /// the server may cure it.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::Connection(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed JSON payload: {error}"))
    }
}

/// An error a job handler can return to report a specific `errtype` to the
/// server. Handlers may return any `anyhow::Error`; this type only matters
/// when the kind should be something other than the generic default.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        assert!(Error::Connection("reset".into()).is_transport());
        assert!(Error::Timeout(Duration::from_secs(1)).is_transport());
        assert!(!Error::protocol("bad").is_transport());
        assert!(!Error::Server {
            code: "ERR".into(),
            message: "nope".into()
        }
        .is_transport());
    }

    #[test]
    fn server_message_is_kept_verbatim() {
        let e = Error::Server {
            code: "NOTUNIQUE".into(),
            message: "Job not unique".into(),
        };
        assert_eq!(e.to_string(), "server replied NOTUNIQUE: Job not unique");
    }
}
