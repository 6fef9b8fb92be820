//! End-to-end loopback exchange tests
//!
//! These tests drive the full harness through its public surface:
//! - one-byte challenge/response over the default (OpenSSL) backend
//! - the same exchange over the alternate (rustls) backend
//! - protocol pinning on both backends
//! - failure classification and side attribution for broken setups

use tlsloop::{
    run_handshake_exchange, select, Exchange, HarnessError, Protocol, Side,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn test_exchange_completes_with_default_provider() {
    init_logging();

    let summary = run_handshake_exchange(false).unwrap();

    assert_eq!(summary.provider, "openssl");
    assert!(summary.client_version.starts_with("TLSv1."));
    assert_eq!(summary.client_version, summary.server_version);
}

#[test]
fn test_exchange_completes_with_alternate_provider() {
    init_logging();

    let summary = run_handshake_exchange(true).unwrap();

    assert_eq!(summary.provider, "rustls");
    assert!(summary.client_version.starts_with("TLSv1."));
    assert_eq!(summary.client_version, summary.server_version);
}

#[test]
fn test_default_provider_honors_pinned_tls13() {
    init_logging();

    let summary = Exchange::new(select(false))
        .protocol(Protocol::Tls13)
        .run()
        .unwrap();

    assert_eq!(summary.client_version, "TLSv1.3");
    assert_eq!(summary.server_version, "TLSv1.3");
}

#[test]
fn test_alternate_provider_honors_pinned_tls12() {
    init_logging();

    let summary = Exchange::new(select(true))
        .protocol(Protocol::Tls12)
        .run()
        .unwrap();

    assert_eq!(summary.client_version, "TLSv1.2");
    assert_eq!(summary.server_version, "TLSv1.2");
}

#[test]
fn test_missing_keystore_is_a_configuration_error() {
    init_logging();

    let dir = tempfile::tempdir().unwrap();
    let err = Exchange::new(select(false))
        .keystore(dir.path().join("absent.p12"))
        .run()
        .unwrap_err();

    // The caller's own context build fails before any socket is opened.
    assert_eq!(err.side, Side::Client);
    assert!(matches!(err.source, HarnessError::Configuration(_)));
}

#[test]
fn test_wrong_passphrase_is_a_configuration_error() {
    init_logging();

    let err = Exchange::new(select(true))
        .passphrase("not-the-passphrase")
        .run()
        .unwrap_err();

    assert_eq!(err.side, Side::Client);
    assert!(matches!(err.source, HarnessError::Configuration(_)));
}

#[test]
fn test_alternate_provider_rejects_unknown_server_name() {
    init_logging();

    // The keystore certificate does not cover this name; the rustls
    // client verifies names, so its handshake is the one that fails.
    let err = Exchange::new(select(true))
        .server_name("nonexistent.invalid")
        .run()
        .unwrap_err();

    assert_eq!(err.side, Side::Client);
    assert!(matches!(err.source, HarnessError::Handshake(_)));
}

#[test]
fn test_default_provider_does_not_verify_server_name() {
    init_logging();

    // The OpenSSL client sends the name as SNI but only validates the
    // certificate chain, so the same exchange completes.
    let summary = Exchange::new(select(false))
        .server_name("nonexistent.invalid")
        .run()
        .unwrap();

    assert!(summary.client_version.starts_with("TLSv1."));
}
