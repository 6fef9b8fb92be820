//! Descriptor accounting across repeated runs
//!
//! Every run opens a listener, two TCP endpoints and a keystore; all of
//! them must be closed again by the time the run reports its outcome.
//! This lives in its own test binary so no sibling test opens sockets
//! while descriptors are being counted.

#![cfg(target_os = "linux")]

use std::thread;
use std::time::Duration;

use tlsloop::{run_handshake_exchange, select, Exchange, Side};

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

/// A failed run may reap its server thread slightly after returning, so
/// give the count a moment to settle.
fn settles_back_to(baseline: usize) -> bool {
    for _ in 0..100 {
        if open_fds() <= baseline {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_runs_do_not_leak_descriptors() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    // Warm up both backends once so lazily initialized globals (RNG
    // handles and the like) are excluded from the measurement.
    run_handshake_exchange(false).unwrap();
    run_handshake_exchange(true).unwrap();
    let _ = Exchange::new(select(true))
        .server_name("nonexistent.invalid")
        .run();

    let baseline = open_fds();

    for _ in 0..5 {
        run_handshake_exchange(false).unwrap();
        run_handshake_exchange(true).unwrap();
    }
    assert_eq!(open_fds(), baseline, "successful runs leaked descriptors");

    let err = Exchange::new(select(true))
        .server_name("nonexistent.invalid")
        .run()
        .unwrap_err();
    assert_eq!(err.side, Side::Client);
    assert!(
        settles_back_to(baseline),
        "failed run leaked descriptors: {} open, baseline {}",
        open_fds(),
        baseline
    );
}
