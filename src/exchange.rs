//! Loopback exchange orchestration
//!
//! One run spins up an accepting endpoint on a background thread, hands
//! its bound address to the caller's thread over a single-use channel,
//! and performs a one-byte challenge/response over freshly built TLS
//! channels. The server never throws across the thread boundary: its
//! outcome is captured and folded into the run result during teardown,
//! so a failure is always attributed to the side that raised it.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::{ExchangeError, HarnessError, Result};
use crate::identity;
use crate::provider::{self, Protocol, SecurityContext, TlsProvider};

/// Byte the client sends once its channel is established.
pub const CHALLENGE_BYTE: u8 = b'X';

/// Byte the server answers with after reading the challenge.
pub const RESPONSE_BYTE: u8 = b'Y';

/// Accept queue depth for the loopback listener.
const ACCEPT_BACKLOG: i32 = 50;

/// Name the client presents via SNI. The bundled certificate covers it.
const DEFAULT_SERVER_NAME: &str = "localhost";

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct ExchangeSummary {
    /// Backend that drove both endpoints.
    pub provider: &'static str,
    /// Protocol version negotiated by the client channel.
    pub client_version: String,
    /// Protocol version negotiated by the server channel.
    pub server_version: String,
}

/// What one side reports back after finishing its half of the exchange.
struct SideReport {
    version: String,
}

/// A single loopback exchange run.
///
/// Running consumes the value: contexts, sockets and the server thread
/// all belong to exactly one run and are torn down with it.
pub struct Exchange {
    provider: Arc<dyn TlsProvider>,
    protocol: Protocol,
    keystore: PathBuf,
    passphrase: String,
    server_name: String,
}

impl Exchange {
    /// Create a run driven by the given provider, using the bundled
    /// keystore and negotiated protocol selection.
    pub fn new(provider: Arc<dyn TlsProvider>) -> Self {
        Exchange {
            provider,
            protocol: Protocol::Negotiated,
            keystore: identity::bundled_keystore(),
            passphrase: identity::KEYSTORE_PASSPHRASE.to_string(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
        }
    }

    /// Pin both endpoints to a protocol version.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Use a different PKCS#12 keystore.
    pub fn keystore(mut self, path: impl Into<PathBuf>) -> Self {
        self.keystore = path.into();
        self
    }

    /// Passphrase for the keystore.
    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = passphrase.into();
        self
    }

    /// Name the client presents via SNI.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Run the exchange to completion.
    ///
    /// The server endpoint runs on its own thread; the client endpoint
    /// runs on the caller's thread. Both load the keystore fresh and
    /// build their own security context, so nothing is shared between
    /// runs.
    pub fn run(self) -> std::result::Result<ExchangeSummary, ExchangeError> {
        let provider_name = self.provider.name();
        info!(
            provider = provider_name,
            protocol = self.protocol.as_str(),
            "starting loopback TLS exchange"
        );

        let (addr_tx, addr_rx) = mpsc::channel();

        let server = {
            let provider = Arc::clone(&self.provider);
            let protocol = self.protocol;
            let keystore = self.keystore.clone();
            let passphrase = self.passphrase.clone();
            thread::Builder::new()
                .name("tls-loopback-server".to_string())
                .spawn(move || server_activity(provider, protocol, keystore, passphrase, addr_tx))
                .map_err(|e| ExchangeError::client(HarnessError::Io(e)))?
        };

        // Client side, on this thread. The context is built before the
        // address is awaited, so a broken keystore fails fast.
        let client_result = provider::build_security_context(
            &*self.provider,
            self.protocol,
            &self.keystore,
            &self.passphrase,
        );
        let context = match client_result {
            Ok(context) => context,
            Err(source) => {
                warn!(%source, "client context build failed");
                return Err(ExchangeError::client(source));
            }
        };

        let addr = match addr_rx.recv() {
            Ok(addr) => addr,
            // The sender was dropped without publishing: the server died
            // during setup and its captured outcome has the real error.
            Err(_) => {
                let source = match server_outcome(server) {
                    Err(source) => source,
                    Ok(_) => HarnessError::Configuration(
                        "server exited without publishing its address".to_string(),
                    ),
                };
                warn!(%source, "server activity failed");
                return Err(ExchangeError::server(source));
            }
        };

        let client_report = match client_exchange(&*context, addr, &self.server_name) {
            Ok(report) => report,
            Err(source) => {
                // Wake a server still parked in accept so it can be
                // reaped; the client failure is the one reported.
                if TcpStream::connect(addr).is_ok() {
                    let _ = server_outcome(server);
                }
                warn!(%source, "client activity failed");
                return Err(ExchangeError::client(source));
            }
        };

        let server_report = match server_outcome(server) {
            Ok(report) => report,
            Err(source) => {
                warn!(%source, "server activity failed");
                return Err(ExchangeError::server(source));
            }
        };

        info!(
            provider = provider_name,
            client_version = %client_report.version,
            server_version = %server_report.version,
            "loopback TLS exchange completed"
        );

        Ok(ExchangeSummary {
            provider: provider_name,
            client_version: client_report.version,
            server_version: server_report.version,
        })
    }
}

/// Run one exchange with both endpoints on the default backend, or both
/// on the alternate backend.
pub fn run_handshake_exchange(
    use_alternate_provider: bool,
) -> std::result::Result<ExchangeSummary, ExchangeError> {
    Exchange::new(provider::select(use_alternate_provider)).run()
}

/// Everything the server does, from keystore to response byte. Runs on
/// the background thread; the returned result is read back via join.
fn server_activity(
    provider: Arc<dyn TlsProvider>,
    protocol: Protocol,
    keystore: PathBuf,
    passphrase: String,
    published: mpsc::Sender<SocketAddr>,
) -> Result<SideReport> {
    let context = provider::build_security_context(&*provider, protocol, &keystore, &passphrase)?;

    let listener = bind_loopback()?;
    let addr = listener.local_addr()?;
    debug!(%addr, "server listening");

    if published.send(addr).is_err() {
        return Err(HarnessError::Configuration(
            "client abandoned the run before the address was published".to_string(),
        ));
    }

    let (stream, peer) = listener.accept()?;
    debug!(%peer, "connection accepted");

    let mut channel = context.accept(stream)?;
    let version = channel.version();
    debug!(version = %version, "server handshake complete");

    expect_byte(&mut *channel, CHALLENGE_BYTE)?;
    send_byte(&mut *channel, RESPONSE_BYTE)?;

    if let Err(e) = channel.shutdown() {
        debug!("server channel shutdown: {e}");
    }
    Ok(SideReport { version })
}

/// The client's half: connect, handshake, challenge, response.
fn client_exchange(
    context: &dyn SecurityContext,
    addr: SocketAddr,
    server_name: &str,
) -> Result<SideReport> {
    let stream = TcpStream::connect(addr)?;
    let mut channel = context.connect(stream, server_name)?;
    let version = channel.version();
    debug!(version = %version, "client handshake complete");

    send_byte(&mut *channel, CHALLENGE_BYTE)?;
    expect_byte(&mut *channel, RESPONSE_BYTE)?;

    if let Err(e) = channel.shutdown() {
        debug!("client channel shutdown: {e}");
    }
    Ok(SideReport { version })
}

/// Collect the server thread's result, treating a panic as a harness
/// defect rather than unwinding into the caller.
fn server_outcome(handle: thread::JoinHandle<Result<SideReport>>) -> Result<SideReport> {
    match handle.join() {
        Ok(outcome) => outcome,
        Err(_) => Err(HarnessError::Configuration(
            "server activity panicked".to_string(),
        )),
    }
}

/// Bind the accepting socket on an ephemeral loopback port.
fn bind_loopback() -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    socket.bind(&addr.into())?;
    socket.listen(ACCEPT_BACKLOG)?;
    Ok(socket.into())
}

/// Read exactly one byte and require it to match.
fn expect_byte<R: Read + ?Sized>(reader: &mut R, expected: u8) -> Result<()> {
    let mut buf = [0u8; 1];
    let n = reader.read(&mut buf)?;
    if n == 0 {
        return Err(HarnessError::mismatch(expected, None));
    }
    if buf[0] != expected {
        return Err(HarnessError::mismatch(expected, Some(buf[0])));
    }
    Ok(())
}

/// Write one byte and push it onto the wire.
fn send_byte<W: Write + ?Sized>(writer: &mut W, byte: u8) -> Result<()> {
    writer.write_all(&[byte])?;
    writer.flush()?;
    Ok(())
}
