//! rustls-backed provider
//!
//! The alternate backend. Unlike the OpenSSL context, rustls keeps
//! client and server configuration apart, so the context pre-builds one
//! of each from the shared identity. The inner cryptographic provider
//! is injected explicitly as well (ring unless overridden), keeping the
//! whole stack free of process-global registration.
//!
//! One behavioral difference from the default backend: the rustls
//! client verifies that the server certificate actually matches the
//! requested server name, so a name the keystore certificate does not
//! cover fails the handshake instead of being ignored.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{
    ClientConfig, ClientConnection, ProtocolVersion, RootCertStore, ServerConfig,
    ServerConnection, StreamOwned,
};

use crate::error::{HarnessError, Result};
use crate::identity::Identity;
use crate::provider::{Protocol, SecureChannel, SecurityContext, TlsProvider};

/// The alternate, pure-Rust TLS backend.
pub struct RustlsProvider {
    crypto: Arc<CryptoProvider>,
}

impl Default for RustlsProvider {
    fn default() -> Self {
        RustlsProvider {
            crypto: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl RustlsProvider {
    /// Replace the inner cryptographic provider.
    pub fn with_crypto_provider(crypto: Arc<CryptoProvider>) -> Self {
        RustlsProvider { crypto }
    }
}

impl TlsProvider for RustlsProvider {
    fn name(&self) -> &'static str {
        "rustls"
    }

    fn build_context(
        &self,
        protocol: Protocol,
        identity: &Identity,
    ) -> Result<Box<dyn SecurityContext>> {
        let mut chain: Vec<CertificateDer<'static>> =
            vec![CertificateDer::from(identity.certificate_der().to_vec())];
        chain.extend(
            identity
                .chain_der()
                .iter()
                .map(|der| CertificateDer::from(der.clone())),
        );

        // The keystore certificates are the only trust anchors.
        let mut roots = RootCertStore::empty();
        for cert in &chain {
            roots.add(cert.clone()).map_err(|e| {
                HarnessError::Configuration(format!("keystore certificate rejected: {e}"))
            })?;
        }

        let client_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            identity.private_key_der().to_vec(),
        ));
        let client_builder = ClientConfig::builder_with_provider(self.crypto.clone());
        let client_builder = match protocol {
            Protocol::Negotiated => client_builder.with_safe_default_protocol_versions(),
            Protocol::Tls12 => client_builder.with_protocol_versions(&[&rustls::version::TLS12]),
            Protocol::Tls13 => client_builder.with_protocol_versions(&[&rustls::version::TLS13]),
        }
        .map_err(|e| HarnessError::Configuration(format!("client protocol selection: {e}")))?;
        let client = client_builder
            .with_root_certificates(roots)
            .with_client_auth_cert(chain.clone(), client_key)
            .map_err(|e| HarnessError::Configuration(format!("client key material: {e}")))?;

        let server_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            identity.private_key_der().to_vec(),
        ));
        let server_builder = ServerConfig::builder_with_provider(self.crypto.clone());
        let server_builder = match protocol {
            Protocol::Negotiated => server_builder.with_safe_default_protocol_versions(),
            Protocol::Tls12 => server_builder.with_protocol_versions(&[&rustls::version::TLS12]),
            Protocol::Tls13 => server_builder.with_protocol_versions(&[&rustls::version::TLS13]),
        }
        .map_err(|e| HarnessError::Configuration(format!("server protocol selection: {e}")))?;
        let server = server_builder
            .with_no_client_auth()
            .with_single_cert(chain, server_key)
            .map_err(|e| HarnessError::Configuration(format!("server key material: {e}")))?;

        Ok(Box::new(RustlsContext {
            client: Arc::new(client),
            server: Arc::new(server),
        }))
    }
}

struct RustlsContext {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl SecurityContext for RustlsContext {
    fn connect(&self, mut stream: TcpStream, server_name: &str) -> Result<Box<dyn SecureChannel>> {
        let name = ServerName::try_from(server_name)
            .map_err(|e| {
                HarnessError::Configuration(format!("invalid server name {server_name:?}: {e}"))
            })?
            .to_owned();
        let mut conn = ClientConnection::new(self.client.clone(), name)?;

        while conn.is_handshaking() {
            conn.complete_io(&mut stream)
                .map_err(|e| HarnessError::Handshake(format!("client handshake failed: {e}")))?;
        }

        Ok(Box::new(RustlsChannel::Client(StreamOwned::new(
            conn, stream,
        ))))
    }

    fn accept(&self, mut stream: TcpStream) -> Result<Box<dyn SecureChannel>> {
        let mut conn = ServerConnection::new(self.server.clone())?;

        while conn.is_handshaking() {
            conn.complete_io(&mut stream)
                .map_err(|e| HarnessError::Handshake(format!("server handshake failed: {e}")))?;
        }

        Ok(Box::new(RustlsChannel::Server(StreamOwned::new(
            conn, stream,
        ))))
    }
}

enum RustlsChannel {
    Client(StreamOwned<ClientConnection, TcpStream>),
    Server(StreamOwned<ServerConnection, TcpStream>),
}

impl Read for RustlsChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RustlsChannel::Client(stream) => stream.read(buf),
            RustlsChannel::Server(stream) => stream.read(buf),
        }
    }
}

impl Write for RustlsChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RustlsChannel::Client(stream) => stream.write(buf),
            RustlsChannel::Server(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RustlsChannel::Client(stream) => stream.flush(),
            RustlsChannel::Server(stream) => stream.flush(),
        }
    }
}

impl SecureChannel for RustlsChannel {
    fn version(&self) -> String {
        let version = match self {
            RustlsChannel::Client(stream) => stream.conn.protocol_version(),
            RustlsChannel::Server(stream) => stream.conn.protocol_version(),
        };
        match version {
            Some(ProtocolVersion::TLSv1_2) => "TLSv1.2".to_string(),
            Some(ProtocolVersion::TLSv1_3) => "TLSv1.3".to_string(),
            Some(other) => format!("{other:?}"),
            None => "unknown".to_string(),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        // close_notify is best effort, the peer may already be gone
        match self {
            RustlsChannel::Client(stream) => {
                stream.conn.send_close_notify();
                let _ = stream.flush();
            }
            RustlsChannel::Server(stream) => {
                stream.conn.send_close_notify();
                let _ = stream.flush();
            }
        }
        let sock = match self {
            RustlsChannel::Client(stream) => &stream.sock,
            RustlsChannel::Server(stream) => &stream.sock,
        };
        sock.shutdown(Shutdown::Both).map_err(HarnessError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{bundled_keystore, KEYSTORE_PASSPHRASE};
    use std::net::TcpListener;
    use std::thread;

    fn test_identity() -> Identity {
        Identity::load(&bundled_keystore(), KEYSTORE_PASSPHRASE).unwrap()
    }

    #[test]
    fn test_loopback_handshake_and_io() {
        let identity = test_identity();
        let provider = RustlsProvider::default();
        let server_ctx = provider
            .build_context(Protocol::Negotiated, &identity)
            .unwrap();
        let client_ctx = provider
            .build_context(Protocol::Negotiated, &identity)
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_handle = thread::spawn(move || {
            let (tcp_stream, _) = listener.accept().unwrap();
            let mut channel = server_ctx.accept(tcp_stream).unwrap();

            let mut buf = vec![0u8; 5];
            let n = channel.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"Hello");

            channel.write_all(b"World").unwrap();
            channel.flush().unwrap();
            let _ = channel.shutdown();
        });

        let tcp_stream = TcpStream::connect(addr).unwrap();
        let mut channel = client_ctx.connect(tcp_stream, "localhost").unwrap();
        // With both versions enabled the endpoints settle on 1.3.
        assert_eq!(channel.version(), "TLSv1.3");

        channel.write_all(b"Hello").unwrap();
        channel.flush().unwrap();

        let mut buf = vec![0u8; 5];
        let n = channel.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"World");
        let _ = channel.shutdown();

        server_handle.join().unwrap();
    }

    #[test]
    fn test_pinned_tls12_is_negotiated() {
        let identity = test_identity();
        let provider = RustlsProvider::default();
        let server_ctx = provider.build_context(Protocol::Tls12, &identity).unwrap();
        let client_ctx = provider.build_context(Protocol::Tls12, &identity).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_handle = thread::spawn(move || {
            let (tcp_stream, _) = listener.accept().unwrap();
            let mut channel = server_ctx.accept(tcp_stream).unwrap();
            assert_eq!(channel.version(), "TLSv1.2");

            let mut buf = [0u8; 1];
            assert_eq!(channel.read(&mut buf).unwrap(), 1);
            let _ = channel.shutdown();
        });

        let tcp_stream = TcpStream::connect(addr).unwrap();
        let mut channel = client_ctx.connect(tcp_stream, "localhost").unwrap();
        assert_eq!(channel.version(), "TLSv1.2");

        channel.write_all(b"!").unwrap();
        channel.flush().unwrap();
        let _ = channel.shutdown();

        server_handle.join().unwrap();
    }

    #[test]
    fn test_injected_crypto_provider_builds_contexts() {
        let identity = test_identity();
        let provider = RustlsProvider::with_crypto_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ));
        provider
            .build_context(Protocol::Negotiated, &identity)
            .unwrap();
    }

    #[test]
    fn test_unparseable_server_name_is_configuration_error() {
        let identity = test_identity();
        let provider = RustlsProvider::default();
        let client_ctx = provider
            .build_context(Protocol::Negotiated, &identity)
            .unwrap();

        // The name is rejected before any bytes touch the socket, so the
        // other end never needs to speak TLS.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let result = client_ctx.connect(stream, "not a host name");
        assert!(matches!(result, Err(HarnessError::Configuration(_))));
    }
}
