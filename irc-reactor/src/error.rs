//! Error taxonomy for the reactor.
//!
//! Transport and decode faults are recoverable: they end one connection or
//! skip one line. Contract violations (missing payload fields, unknown or
//! duplicate connection names) are programming errors and surface at the
//! call site that caused them.

use std::io;

use crate::message::ParseError;

pub type Result<T, E = ReactorError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// TCP connect to the server failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TLS handshake with the server failed.
    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    /// The connection has no transport (never connected, or already closed).
    #[error("connection {0:?} is not connected")]
    NotConnected(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed line: {0}")]
    Parse(#[from] ParseError),

    #[error("malformed CAP line: {0}")]
    MalformedCap(String),

    #[error("a server connection named {0:?} already exists")]
    DuplicateServer(String),

    #[error("no server connection named {0:?}")]
    UnknownServer(String),

    /// A handler asked the payload for a parameter the line does not carry.
    #[error("{command} event has no parameter at index {index}")]
    MissingParam { command: String, index: usize },

    /// Identity fields are frozen once the connection has a transport.
    #[error("connection {0:?} is already connected")]
    AlreadyConnected(String),

    #[error("receive loop for {0:?} is already running")]
    ReceiveLoopRunning(String),
}

impl ReactorError {
    /// True for errors caused by misuse of the API rather than by the network
    /// or the remote server.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateServer(_)
                | Self::UnknownServer(_)
                | Self::MissingParam { .. }
                | Self::AlreadyConnected(_)
                | Self::ReceiveLoopRunning(_)
        )
    }
}
