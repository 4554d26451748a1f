//! Tracing setup for processes embedding the engine.
//!
//! The library only emits `tracing` events; it never installs a subscriber on
//! its own. Call [`init_tracing`] once at startup (or in a test) to print them.

use tracing_subscriber::EnvFilter;

/// Installs a formatted subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (e.g. `"tickweave=info"`).
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .try_init()
    .is_ok()
}

/// Installs a subscriber that writes through the test harness's capture.
pub fn init_test_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::new("tickweave=debug"))
    .with_test_writer()
    .try_init();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_second_install_is_refused() {
    init_test_tracing();
    assert!(!init_tracing("tickweave=info"));
  }
}
