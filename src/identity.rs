//! Keystore loading and key material
//!
//! Both endpoints of an exchange draw their key material from the same
//! PKCS#12 keystore: the certificate serves as the server's identity and,
//! at the same time, as the only trust anchor the client accepts. The
//! keystore is opened fresh for every context build so that a missing or
//! corrupt file fails the run it belongs to instead of poisoning
//! process-global state.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use crate::error::{HarnessError, Result};

/// Passphrase protecting the bundled keystore.
pub const KEYSTORE_PASSPHRASE: &str = "password";

/// Path of the keystore shipped with the crate for loopback runs.
pub fn bundled_keystore() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("testdata")
        .join("loopback.p12")
}

/// Key material extracted from a PKCS#12 keystore.
///
/// Holds both the native OpenSSL handles and the raw DER encodings, so
/// every TLS backend can consume the same identity without re-reading
/// the keystore.
pub struct Identity {
    cert: X509,
    key: PKey<Private>,
    ca_chain: Vec<X509>,
    cert_der: Vec<u8>,
    chain_der: Vec<Vec<u8>>,
    key_der: Vec<u8>,
}

impl Identity {
    /// Load an identity from a PKCS#12 keystore file.
    pub fn load(path: &Path, passphrase: &str) -> Result<Self> {
        let der = fs::read(path).map_err(|e| {
            HarnessError::Configuration(format!("cannot read keystore {}: {e}", path.display()))
        })?;
        Self::from_pkcs12(&der, passphrase)
    }

    /// Parse an identity from DER-encoded PKCS#12 bytes.
    pub fn from_pkcs12(der: &[u8], passphrase: &str) -> Result<Self> {
        let parsed = Pkcs12::from_der(der)
            .map_err(|e| HarnessError::Configuration(format!("keystore is not PKCS#12: {e}")))?
            .parse2(passphrase)
            .map_err(|e| HarnessError::Configuration(format!("cannot open keystore: {e}")))?;

        let cert = parsed.cert.ok_or_else(|| {
            HarnessError::Configuration("keystore holds no certificate".to_string())
        })?;
        let key = parsed.pkey.ok_or_else(|| {
            HarnessError::Configuration("keystore holds no private key".to_string())
        })?;
        let ca_chain: Vec<X509> = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        let cert_der = cert.to_der()?;
        let chain_der = ca_chain
            .iter()
            .map(|ca| ca.to_der())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let key_der = key.private_key_to_pkcs8()?;

        Ok(Identity {
            cert,
            key,
            ca_chain,
            cert_der,
            chain_der,
            key_der,
        })
    }

    /// The end-entity certificate.
    pub fn certificate(&self) -> &X509 {
        &self.cert
    }

    /// The private key matching [`certificate`](Self::certificate).
    pub fn private_key(&self) -> &PKey<Private> {
        &self.key
    }

    /// Additional CA certificates bundled in the keystore, if any.
    pub fn ca_chain(&self) -> &[X509] {
        &self.ca_chain
    }

    /// DER encoding of the end-entity certificate.
    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// DER encodings of the bundled CA certificates.
    pub fn chain_der(&self) -> &[Vec<u8>] {
        &self.chain_der
    }

    /// Unencrypted PKCS#8 DER encoding of the private key.
    pub fn private_key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// Common Name of the certificate subject.
    pub fn subject_common_name(&self) -> Option<String> {
        self.cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|s| s.to_string())
    }
}

// Key material stays out of the debug output.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("subject", &self.subject_common_name())
            .field("ca_certs", &self.ca_chain.len())
            .finish_non_exhaustive()
    }
}
