//! Host device (PCI/USB passthrough) collaborator boundary.
//!
//! The attach/detach mechanics live behind this trait; the supervisor only
//! cares that devices are reserved before a domain starts, reattached to the
//! host when it stops, and re-marked active when the daemon reconnects to a
//! running domain.

use anyhow::Result;
use tracing::debug;

pub trait HostdevBackend: Send + Sync {
    /// Reserve the domain's host devices before launch. `cold_boot` is true
    /// for a fresh start, false when hotplugging into a live domain.
    fn prepare(&self, domain: &str, devices: &[String], cold_boot: bool) -> Result<()>;

    /// Return the domain's host devices to the host after shutdown.
    fn reattach(&self, domain: &str, devices: &[String]) -> Result<()>;

    /// Re-mark the domain's host devices as in use during reconnection.
    fn update_active(&self, domain: &str, devices: &[String]) -> Result<()>;
}

/// Pass-through implementation for hosts without device assignment.
pub struct NoopHostdev;

impl HostdevBackend for NoopHostdev {
    fn prepare(&self, domain: &str, devices: &[String], cold_boot: bool) -> Result<()> {
        if !devices.is_empty() {
            debug!(domain = %domain, count = devices.len(), cold_boot, "preparing host devices");
        }
        Ok(())
    }

    fn reattach(&self, domain: &str, devices: &[String]) -> Result<()> {
        if !devices.is_empty() {
            debug!(domain = %domain, count = devices.len(), "reattaching host devices");
        }
        Ok(())
    }

    fn update_active(&self, domain: &str, devices: &[String]) -> Result<()> {
        if !devices.is_empty() {
            debug!(domain = %domain, count = devices.len(), "updating active host devices");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every call so tests can assert on supervisor ordering.
    #[derive(Default)]
    pub struct RecordingHostdev {
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingHostdev {
        /// Record into a log shared with other test doubles so ordering
        /// across backends can be asserted.
        pub fn with_shared_log(log: Arc<Mutex<Vec<String>>>) -> Self {
            Self { calls: log }
        }
    }

    impl HostdevBackend for RecordingHostdev {
        fn prepare(&self, domain: &str, _devices: &[String], cold_boot: bool) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("prepare {domain} cold_boot={cold_boot}"));
            Ok(())
        }

        fn reattach(&self, domain: &str, _devices: &[String]) -> Result<()> {
            self.calls.lock().unwrap().push(format!("reattach {domain}"));
            Ok(())
        }

        fn update_active(&self, domain: &str, _devices: &[String]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("update_active {domain}"));
            Ok(())
        }
    }
}
