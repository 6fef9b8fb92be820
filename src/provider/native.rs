//! OpenSSL-backed provider
//!
//! This is the platform default backend. A single role-neutral
//! `SslContext` carries both the keystore identity and the trust store,
//! so one context can drive either end of the handshake; the role is
//! fixed only when a stream is wrapped via `connect` or `accept`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use openssl::ssl::{
    HandshakeError, Ssl, SslContext, SslContextBuilder, SslMethod, SslStream, SslVerifyMode,
    SslVersion,
};

use crate::error::{HarnessError, Result};
use crate::identity::Identity;
use crate::provider::{Protocol, SecureChannel, SecurityContext, TlsProvider};

/// The platform default TLS backend.
pub struct NativeProvider;

impl TlsProvider for NativeProvider {
    fn name(&self) -> &'static str {
        "openssl"
    }

    fn build_context(
        &self,
        protocol: Protocol,
        identity: &Identity,
    ) -> Result<Box<dyn SecurityContext>> {
        let mut builder = SslContextBuilder::new(SslMethod::tls())?;

        // Key material for the accepting role.
        builder.set_certificate(identity.certificate())?;
        builder.set_private_key(identity.private_key())?;
        for ca in identity.ca_chain() {
            builder.add_extra_chain_cert(ca.clone())?;
        }

        // The same certificates double as trust anchors for the
        // connecting role.
        builder
            .cert_store_mut()
            .add_cert(identity.certificate().clone())?;
        for ca in identity.ca_chain() {
            builder.cert_store_mut().add_cert(ca.clone())?;
        }

        match protocol {
            Protocol::Negotiated => {}
            Protocol::Tls12 => {
                builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
                builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
            }
            Protocol::Tls13 => {
                builder.set_min_proto_version(Some(SslVersion::TLS1_3))?;
                builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
            }
        }

        Ok(Box::new(NativeContext {
            ctx: builder.build(),
        }))
    }
}

struct NativeContext {
    ctx: SslContext,
}

impl SecurityContext for NativeContext {
    fn connect(&self, stream: TcpStream, server_name: &str) -> Result<Box<dyn SecureChannel>> {
        let mut ssl = Ssl::new(&self.ctx)?;
        ssl.set_hostname(server_name)?;
        // The server certificate is checked against the keystore trust
        // anchors. The SNI name is not matched against it, mirroring a
        // plain socket-factory client.
        ssl.set_verify(SslVerifyMode::PEER);

        let stream = match ssl.connect(stream) {
            Ok(stream) => stream,
            Err(HandshakeError::SetupFailure(e)) => {
                return Err(HarnessError::Configuration(format!(
                    "client stream setup failed: {e}"
                )));
            }
            Err(e) => {
                return Err(HarnessError::Handshake(format!(
                    "client handshake failed: {e}"
                )));
            }
        };

        Ok(Box::new(NativeChannel { stream }))
    }

    fn accept(&self, stream: TcpStream) -> Result<Box<dyn SecureChannel>> {
        let mut ssl = Ssl::new(&self.ctx)?;
        // Client certificates are configured but never requested.
        ssl.set_verify(SslVerifyMode::NONE);

        let stream = match ssl.accept(stream) {
            Ok(stream) => stream,
            Err(HandshakeError::SetupFailure(e)) => {
                return Err(HarnessError::Configuration(format!(
                    "server stream setup failed: {e}"
                )));
            }
            Err(e) => {
                return Err(HarnessError::Handshake(format!(
                    "server handshake failed: {e}"
                )));
            }
        };

        Ok(Box::new(NativeChannel { stream }))
    }
}

struct NativeChannel {
    stream: SslStream<TcpStream>,
}

impl Read for NativeChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for NativeChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl SecureChannel for NativeChannel {
    fn version(&self) -> String {
        self.stream.ssl().version_str().to_string()
    }

    fn shutdown(&mut self) -> Result<()> {
        // close_notify is best effort, the peer may already be gone
        let _ = self.stream.shutdown();
        self.stream
            .get_mut()
            .shutdown(Shutdown::Both)
            .map_err(HarnessError::from)
    }
}
