//! Error types for the loopback harness
//!
//! Failures are classified by the phase they occur in: context setup,
//! TLS negotiation, the one-byte application exchange, or plain socket I/O.
//! [`ExchangeError`] additionally records which endpoint raised the failure,
//! since the server runs on its own thread and its errors are captured
//! rather than thrown.

use std::fmt;

/// Endpoint that raised a failure during an exchange run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The accepting endpoint (background thread).
    Server,
    /// The connecting endpoint (caller's thread).
    Client,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Server => write!(f, "server"),
            Side::Client => write!(f, "client"),
        }
    }
}

/// Harness errors
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Context or channel setup failed before any negotiation took place.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The TLS handshake itself was rejected or aborted.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer completed the handshake but sent the wrong application byte,
    /// or closed the stream before sending one.
    #[error("protocol mismatch: expected {expected:?}, received {received:?}")]
    ProtocolMismatch {
        expected: char,
        received: Option<char>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Build a [`HarnessError::ProtocolMismatch`] from raw wire bytes.
    pub fn mismatch(expected: u8, received: Option<u8>) -> Self {
        HarnessError::ProtocolMismatch {
            expected: char::from(expected),
            received: received.map(char::from),
        }
    }
}

impl From<openssl::error::ErrorStack> for HarnessError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        // ErrorStack only surfaces from setup paths; negotiation failures
        // arrive as ssl::HandshakeError and are classified at the call site.
        HarnessError::Configuration(e.to_string())
    }
}

impl From<rustls::Error> for HarnessError {
    fn from(e: rustls::Error) -> Self {
        HarnessError::Configuration(e.to_string())
    }
}

/// A failure from one side of an exchange run.
#[derive(Debug, thiserror::Error)]
#[error("{side} activity failed: {source}")]
pub struct ExchangeError {
    pub side: Side,
    #[source]
    pub source: HarnessError,
}

impl ExchangeError {
    pub fn server(source: HarnessError) -> Self {
        ExchangeError {
            side: Side::Server,
            source,
        }
    }

    pub fn client(source: HarnessError) -> Self {
        ExchangeError {
            side: Side::Client,
            source,
        }
    }
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;
