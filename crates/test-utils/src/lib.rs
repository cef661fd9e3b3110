pub mod builders;
pub mod fake_backend;

use std::sync::{Arc, Once};

use taskweave::clock::ManualClock;
use taskweave::engine::{CoreMaster, MasterSettings};
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=taskweave=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// A core master on a manual clock, seeded for reproducible placement.
pub fn seeded_core(settings: MasterSettings) -> (CoreMaster, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let settings = MasterSettings {
        rng_seed: settings.rng_seed.or(Some(7)),
        ..settings
    };
    let core = CoreMaster::new(settings, clock.clone());
    (core, clock)
}
