//! Host controller options and link construction.

use crate::clock::{Clock, MonotonicClock};
use crate::link::Link;
use crate::registry::{DeviceInstance, HostInstance};
use crate::{Result, UsbError};
use std::sync::Arc;

macro_rules! builder_fields {
    ( $( $(#[$meta:meta])* $name:ident: $type:ty, )* ) => {
        $(
            $(#[$meta])*
            pub fn $name(mut self, $name: $type) -> Self {
                self.$name = $name;
                self
            }
        )*
    }
}

/// Options of an emulated host controller.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct HostConfig {
    /// Whether the controller also has a SuperSpeed (USB 3.0) root hub.
    pub super_speed: bool,
    /// Whether the controller supports high speed.
    pub high_speed: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            super_speed: false,
            high_speed: true,
        }
    }
}

impl HostConfig {
    builder_fields! {
        /// Adds a SuperSpeed root hub next to the USB 2.0 one. Requires high speed.
        ///
        /// Default: `false`
        super_speed: bool,

        /// Allows high speed on the USB 2.0 root hub. Without it, devices run at full speed.
        ///
        /// Default: `true`
        high_speed: bool,
    }

    pub fn validate(&self) -> Result<()> {
        if self.super_speed && !self.high_speed {
            usb_warn!("super speed requires high speed");
            return Err(UsbError::InvalidArgument);
        }
        Ok(())
    }
}

/// Wires a device instance to a host instance.
pub struct LinkBuilder {
    device: DeviceInstance,
    host: HostInstance,
    clock: Option<Arc<dyn Clock>>,
}

impl LinkBuilder {
    pub fn new(device: DeviceInstance, host: HostInstance) -> LinkBuilder {
        LinkBuilder {
            device,
            host,
            clock: None,
        }
    }

    /// Sets the time source for frame timers and signaling windows.
    ///
    /// Default: [`MonotonicClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Probes both drivers and brings the link up with the port unpowered.
    pub fn attach(self) -> Result<Link> {
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => MonotonicClock::new(),
        };
        Link::build(self.device, self.host, clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn super_speed_needs_high_speed() {
        assert!(HostConfig::default().validate().is_ok());
        assert!(HostConfig::default().super_speed(true).validate().is_ok());
        assert_eq!(
            HostConfig::default()
                .super_speed(true)
                .high_speed(false)
                .validate(),
            Err(UsbError::InvalidArgument)
        );
    }
}
