use crate::route::RouteError;
use std::io;
use thiserror::Error;

/// Per-connection failures.
///
/// Every handshake phase returns one of these instead of raising through the
/// stack; only the connection task converts the final error into a log line
/// and a socket close.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("database or tenant identity in user is required for routing")]
    MissingIdentity,
    #[error("malformed {what}: {detail}")]
    HandshakeParse { what: &'static str, detail: String },
    #[error("failed to reach upstream {addr}: {source}")]
    UpstreamDial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake did not complete within the allowed time")]
    HandshakeTimeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl GatewayError {
    pub fn handshake_parse(what: &'static str, detail: impl Into<String>) -> Self {
        GatewayError::HandshakeParse {
            what,
            detail: detail.into(),
        }
    }
}
