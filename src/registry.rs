//! Named host and device controller drivers, and the instances created from them.

use crate::config::HostConfig;
use crate::dummy::{DummyHcdDriver, DummyUdcDriver};
use crate::endpoint::DEFAULT_ENDPOINT_NAMES;
use crate::{Result, UsbError, UsbSpeed};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// A host controller implementation that can be instantiated by name.
pub trait HcdDriver: Send + Sync {
    /// Name the driver is registered under.
    fn name(&self) -> &str;

    /// Called when an instance is plugged into a link. An error aborts the attach.
    fn probe(&self, instance: &HostInstance) -> Result<()> {
        let _ = instance;
        Ok(())
    }

    /// Called when an instance is unplugged.
    fn remove(&self, instance: &HostInstance) {
        let _ = instance;
    }
}

/// A device controller implementation that can be instantiated by name.
pub trait UdcDriver: Send + Sync {
    /// Name the driver is registered under.
    fn name(&self) -> &str;

    /// Names of the controller's endpoints, `ep0` first. The names fix each endpoint's number,
    /// direction and transfer type where they say so.
    fn endpoint_names(&self) -> &'static [&'static str] {
        DEFAULT_ENDPOINT_NAMES
    }

    /// Fastest speed the controller can operate at.
    fn max_speed(&self) -> UsbSpeed {
        UsbSpeed::Super
    }

    fn probe(&self, instance: &DeviceInstance) -> Result<()> {
        let _ = instance;
        Ok(())
    }

    fn remove(&self, instance: &DeviceInstance) {
        let _ = instance;
    }
}

/// One host controller, ready to be attached.
pub struct HostInstance {
    name: String,
    id: u32,
    driver: Arc<dyn HcdDriver>,
    config: HostConfig,
}

impl HostInstance {
    pub fn new(driver: Arc<dyn HcdDriver>, id: u32, config: HostConfig) -> HostInstance {
        HostInstance {
            name: driver.name().to_owned(),
            id,
            driver,
            config,
        }
    }

    /// A `dummy_hcd` instance with the default configuration.
    pub fn dummy(id: u32) -> HostInstance {
        HostInstance::new(Arc::new(DummyHcdDriver::new()), id, HostConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn HcdDriver> {
        &self.driver
    }
}

/// One device controller, ready to be attached.
pub struct DeviceInstance {
    name: String,
    id: u32,
    driver: Arc<dyn UdcDriver>,
}

impl DeviceInstance {
    pub fn new(driver: Arc<dyn UdcDriver>, id: u32) -> DeviceInstance {
        DeviceInstance {
            name: driver.name().to_owned(),
            id,
            driver,
        }
    }

    /// A `dummy_udc` instance.
    pub fn dummy(id: u32) -> DeviceInstance {
        DeviceInstance::new(Arc::new(DummyUdcDriver::new()), id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn max_speed(&self) -> UsbSpeed {
        self.driver.max_speed()
    }

    pub fn driver(&self) -> &Arc<dyn UdcDriver> {
        &self.driver
    }
}

/// Named driver table. Instances keep their driver alive through an `Arc`, and a driver cannot
/// be unregistered while instances of it exist.
pub struct DriverRegistry {
    hcds: Mutex<Vec<Arc<dyn HcdDriver>>>,
    udcs: Mutex<Vec<Arc<dyn UdcDriver>>>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// An empty registry.
    pub const fn new() -> DriverRegistry {
        DriverRegistry {
            hcds: Mutex::new(Vec::new()),
            udcs: Mutex::new(Vec::new()),
        }
    }

    /// A registry holding the built-in `dummy_hcd` and `dummy_udc` drivers.
    pub fn with_dummy_drivers() -> DriverRegistry {
        let registry = DriverRegistry::new();
        registry
            .hcds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(DummyHcdDriver::new()));
        registry
            .udcs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(DummyUdcDriver::new()));
        registry
    }

    /// The process-wide registry, created with the built-in drivers on first use.
    pub fn global() -> &'static DriverRegistry {
        static GLOBAL: OnceLock<DriverRegistry> = OnceLock::new();
        GLOBAL.get_or_init(DriverRegistry::with_dummy_drivers)
    }

    pub fn register_hcd(&self, driver: Arc<dyn HcdDriver>) -> Result<()> {
        let mut hcds = self.hcds.lock().unwrap_or_else(PoisonError::into_inner);

        if hcds.iter().any(|d| d.name() == driver.name()) {
            return Err(UsbError::AlreadyExists);
        }

        usb_debug!("registered hcd driver {}", driver.name());
        hcds.push(driver);
        Ok(())
    }

    pub fn register_udc(&self, driver: Arc<dyn UdcDriver>) -> Result<()> {
        let mut udcs = self.udcs.lock().unwrap_or_else(PoisonError::into_inner);

        if udcs.iter().any(|d| d.name() == driver.name()) {
            return Err(UsbError::AlreadyExists);
        }

        usb_debug!("registered udc driver {}", driver.name());
        udcs.push(driver);
        Ok(())
    }

    pub fn lookup_hcd(&self, name: &str) -> Option<Arc<dyn HcdDriver>> {
        self.hcds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    pub fn lookup_udc(&self, name: &str) -> Option<Arc<dyn UdcDriver>> {
        self.udcs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// Removes a host controller driver. Fails with `Busy` while instances of it exist.
    pub fn unregister_hcd(&self, name: &str) -> Result<()> {
        let mut hcds = self.hcds.lock().unwrap_or_else(PoisonError::into_inner);
        let index = hcds
            .iter()
            .position(|d| d.name() == name)
            .ok_or(UsbError::NotFound)?;

        if Arc::strong_count(&hcds[index]) > 1 {
            return Err(UsbError::Busy);
        }

        hcds.remove(index);
        Ok(())
    }

    /// Removes a device controller driver. Fails with `Busy` while instances of it exist.
    pub fn unregister_udc(&self, name: &str) -> Result<()> {
        let mut udcs = self.udcs.lock().unwrap_or_else(PoisonError::into_inner);
        let index = udcs
            .iter()
            .position(|d| d.name() == name)
            .ok_or(UsbError::NotFound)?;

        if Arc::strong_count(&udcs[index]) > 1 {
            return Err(UsbError::Busy);
        }

        udcs.remove(index);
        Ok(())
    }

    /// Creates a host instance bound to the named driver.
    pub fn create_host(&self, name: &str, id: u32, config: HostConfig) -> Result<HostInstance> {
        let driver = self.lookup_hcd(name).ok_or(UsbError::NotFound)?;
        config.validate()?;
        Ok(HostInstance::new(driver, id, config))
    }

    /// Creates a device instance bound to the named driver.
    pub fn create_device(&self, name: &str, id: u32) -> Result<DeviceInstance> {
        let driver = self.lookup_udc(name).ok_or(UsbError::NotFound)?;
        Ok(DeviceInstance::new(driver, id))
    }
}
