//! tlsloop - In-process TLS handshake harness
//!
//! This crate establishes a real TLS connection between a server on a
//! background thread and a client on the caller's thread, over a
//! loopback TCP socket, and exchanges one application byte in each
//! direction. Both endpoints draw identity and trust from the same
//! bundled PKCS#12 keystore and are driven by a selectable backend:
//! the platform default (OpenSSL) or an alternate pure-Rust stack
//! (rustls).
//!
//! # Example
//!
//! ```no_run
//! use tlsloop::run_handshake_exchange;
//!
//! // Both endpoints on the default backend.
//! let summary = run_handshake_exchange(false).unwrap();
//! println!("negotiated {}", summary.client_version);
//!
//! // Same exchange on the alternate backend.
//! run_handshake_exchange(true).unwrap();
//! ```
//!
//! Runs are fully isolated from each other: contexts, channels and the
//! server thread belong to a single [`Exchange`] and are torn down with
//! it, whichever side fails.

pub mod error;
pub mod exchange;
pub mod identity;
pub mod provider;

pub use error::{ExchangeError, HarnessError, Result, Side};
pub use exchange::{
    run_handshake_exchange, Exchange, ExchangeSummary, CHALLENGE_BYTE, RESPONSE_BYTE,
};
pub use identity::Identity;
pub use provider::{
    build_security_context, select, NativeProvider, Protocol, RustlsProvider, SecureChannel,
    SecurityContext, TlsProvider,
};
