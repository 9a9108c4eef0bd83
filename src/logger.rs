//! Logging setup.
//!
//! The runtime only emits `tracing` events; installing a subscriber is left to
//! the application. These helpers install a compact `tracing-subscriber`
//! formatter for binaries and tests that have no subscriber of their own.
//!
//! ```ignore
//! spindle::logger::init();
//! tracing::info!("runtime ready");
//! ```

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;

/// Installs the default subscriber at INFO level.
pub fn init() {
    init_with_level(Level::INFO);
}

/// Installs the default subscriber at the given level.
///
/// Calling it again, or after another subscriber was installed, does nothing.
pub fn init_with_level(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from_level(level))
        .without_time()
        .with_target(false)
        .with_thread_names(true)
        .with_ansi(false)
        .compact()
        .try_init();
}
