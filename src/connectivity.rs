//! Last-known network reachability.

use std::sync::atomic::{AtomicBool, Ordering};

/// Connectivity flag updated by whoever observes the network.
///
/// Reads never block and return the last value written.
#[derive(Debug)]
pub struct ConnectivityMonitor {
  connected: AtomicBool,
}

impl ConnectivityMonitor {
  pub fn new(connected: bool) -> Self {
    Self {
      connected: AtomicBool::new(connected),
    }
  }

  pub fn is_connected(&self) -> bool {
    self.connected.load(Ordering::Acquire)
  }

  pub fn set_connected(&self, connected: bool) {
    let previous = self.connected.swap(connected, Ordering::AcqRel);
    if previous != connected {
      tracing::info!(target: "scentshelf::connectivity", connected, "Connectivity changed");
    }
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}
