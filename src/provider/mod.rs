//! Pluggable TLS providers
//!
//! A provider turns shared key material into role-specific security
//! contexts, and a context turns an accepted or connecting TCP stream into
//! an encrypted channel. The exchange logic only ever talks to these
//! traits, so both endpoints can be driven by the platform default
//! backend (OpenSSL) or by the alternate pure-Rust backend (rustls)
//! without changing the harness.
//!
//! Providers are handed around explicitly as `Arc<dyn TlsProvider>`;
//! nothing is registered process-wide, so concurrent runs with different
//! backends cannot observe each other.

pub mod native;
pub mod rustls;

use std::io;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use crate::error::{HarnessError, Result};
use crate::identity::Identity;

pub use self::native::NativeProvider;
pub use self::rustls::RustlsProvider;

/// Protocol selection for a security context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Let the endpoints negotiate the highest mutually supported version.
    #[default]
    Negotiated,
    /// Pin both endpoints to TLS 1.2.
    Tls12,
    /// Pin both endpoints to TLS 1.3.
    Tls13,
}

impl Protocol {
    /// Parse a protocol name (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TLS" => Ok(Protocol::Negotiated),
            "TLSV1.2" | "TLS1.2" => Ok(Protocol::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(Protocol::Tls13),
            _ => Err(HarnessError::Configuration(format!(
                "unsupported protocol: {s}"
            ))),
        }
    }

    /// Get protocol as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Negotiated => "TLS",
            Protocol::Tls12 => "TLSv1.2",
            Protocol::Tls13 => "TLSv1.3",
        }
    }
}

/// A TLS backend capable of building security contexts.
pub trait TlsProvider: Send + Sync {
    /// Short backend name, used in logs and summaries.
    fn name(&self) -> &'static str;

    /// Build a security context holding the given identity as both key
    /// material and trust anchor.
    fn build_context(&self, protocol: Protocol, identity: &Identity)
        -> Result<Box<dyn SecurityContext>>;
}

/// A built security context, ready to wrap TCP streams on either side.
pub trait SecurityContext: Send + Sync {
    /// Run the client side of the handshake over `stream`.
    ///
    /// `server_name` is sent as SNI; whether it is also checked against
    /// the server certificate is backend-specific.
    fn connect(&self, stream: TcpStream, server_name: &str) -> Result<Box<dyn SecureChannel>>;

    /// Run the server side of the handshake over an accepted `stream`.
    fn accept(&self, stream: TcpStream) -> Result<Box<dyn SecureChannel>>;
}

/// An established TLS channel carrying application bytes.
pub trait SecureChannel: io::Read + io::Write + Send {
    /// Negotiated protocol version, e.g. `TLSv1.3`.
    fn version(&self) -> String;

    /// Send the TLS close alert and shut the transport down.
    fn shutdown(&mut self) -> Result<()>;
}

/// Pick the backend for a run: the platform default, or the alternate
/// pure-Rust implementation.
pub fn select(use_alternate: bool) -> Arc<dyn TlsProvider> {
    if use_alternate {
        Arc::new(RustlsProvider::default())
    } else {
        Arc::new(NativeProvider)
    }
}

/// Load a keystore and build a security context from it in one step.
///
/// Both endpoint activities go through here, so a missing or broken
/// keystore is classified identically on either side, before any
/// socket is opened.
pub fn build_security_context(
    provider: &dyn TlsProvider,
    protocol: Protocol,
    keystore: &Path,
    passphrase: &str,
) -> Result<Box<dyn SecurityContext>> {
    let identity = Identity::load(keystore, passphrase)?;
    provider.build_context(protocol, &identity)
}
