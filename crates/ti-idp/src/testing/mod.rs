//! Test fixtures: a throwaway PKI, a simulated smartcard and an in-process
//! IDP. Compiled for this crate's tests and behind the `test-util` feature
//! for downstream crates.

pub mod card_sim;
pub mod fake_idp;
pub mod harness;
pub mod pki;

pub use card_sim::SimulatedCard;
pub use fake_idp::FakeIdp;
pub use harness::Harness;
pub use pki::{Issued, PkiOcspResponder, StaticOcspResponder, TestPki};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs a test subscriber honoring `RUST_LOG` (default `warn`).
/// Repeated calls are no-ops.
pub fn init_test_tracing() {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
