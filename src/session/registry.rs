use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::capture::DeviceId;
use crate::error::{CaptureError, Result};

/// Devices currently held by a session in this process
static LEASES: Lazy<Mutex<HashSet<DeviceId>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive claim on a device, released on drop
#[derive(Debug)]
pub(crate) struct DeviceLease(DeviceId);

impl DeviceLease {
    pub(crate) fn acquire(device: &DeviceId) -> Result<Self> {
        let mut leases = LEASES.lock().unwrap_or_else(PoisonError::into_inner);
        if !leases.insert(device.clone()) {
            return Err(CaptureError::DeviceBusy(device.to_string()));
        }
        debug!("Leased {}", device);
        Ok(Self(device.clone()))
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut leases = LEASES.lock().unwrap_or_else(PoisonError::into_inner);
        leases.remove(&self.0);
        debug!("Returned lease on {}", self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive_until_dropped() {
        let id = DeviceId::from("pattern:lease-test");
        let lease = DeviceLease::acquire(&id).unwrap();
        assert!(matches!(
            DeviceLease::acquire(&id),
            Err(CaptureError::DeviceBusy(_))
        ));
        drop(lease);
        assert!(DeviceLease::acquire(&id).is_ok());
    }
}
