use crate::registry::{DeviceInstance, HcdDriver, HostInstance, UdcDriver};
use crate::Result;

/// Built-in host controller driver with no behavior of its own beyond logging.
///
/// Registered as `dummy_hcd` in [`DriverRegistry::global`](crate::registry::DriverRegistry::global).
pub struct DummyHcdDriver;

impl DummyHcdDriver {
    /// Creates a new `DummyHcdDriver`.
    pub fn new() -> Self {
        Self
    }
}

impl Default for DummyHcdDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HcdDriver for DummyHcdDriver {
    fn name(&self) -> &str {
        "dummy_hcd"
    }

    fn probe(&self, instance: &HostInstance) -> Result<()> {
        usb_debug!(
            "{}.{} probe: super speed {}, high speed {}",
            instance.name(),
            instance.id(),
            instance.config().super_speed,
            instance.config().high_speed
        );
        Ok(())
    }

    fn remove(&self, instance: &HostInstance) {
        usb_debug!("{}.{} remove", instance.name(), instance.id());
    }
}

/// Built-in device controller driver with the default endpoint table.
///
/// Registered as `dummy_udc` in [`DriverRegistry::global`](crate::registry::DriverRegistry::global).
pub struct DummyUdcDriver;

impl DummyUdcDriver {
    /// Creates a new `DummyUdcDriver`.
    pub fn new() -> Self {
        Self
    }
}

impl Default for DummyUdcDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl UdcDriver for DummyUdcDriver {
    fn name(&self) -> &str {
        "dummy_udc"
    }

    fn probe(&self, instance: &DeviceInstance) -> Result<()> {
        usb_debug!("{}.{} probe", instance.name(), instance.id());
        Ok(())
    }

    fn remove(&self, instance: &DeviceInstance) {
        usb_debug!("{}.{} remove", instance.name(), instance.id());
    }
}
