//! The shared connection between one host instance and one device instance.
//!
//! All state reachable from both sides (port status, endpoint queues, pending transfers) lives in
//! one [`LinkState`] behind one mutex. Code that calls out to drivers or completion callbacks
//! drops the guard first and takes it again afterwards, then re-reads whatever it depends on.

use crate::clock::Clock;
use crate::config::{HostConfig, LinkBuilder};
use crate::endpoint::{self, EndpointTable};
use crate::gadget::{self, Gadget, GadgetDriver};
use crate::hcd::Hcd;
use crate::hub::{self, RootHub};
use crate::registry::{DeviceInstance, HostInstance};
use crate::{HubSpeed, Result, UsbSpeed};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) type Guard<'a> = MutexGuard<'a, LinkState>;

/// Device controller side of the link.
pub(crate) struct UdcState {
    pub driver: Option<Arc<dyn GadgetDriver>>,
    pub eps: EndpointTable,
    pub speed: UsbSpeed,
    pub max_speed: UsbSpeed,
    pub address: u8,
    pub devstatus: u16,
    pub pullup: bool,
    pub suspended: bool,
    pub fifo_busy: bool,
    pub b_hnp_enable: bool,
    pub a_hnp_support: bool,
    pub a_alt_hnp_support: bool,
}

impl UdcState {
    pub fn new(eps: EndpointTable, max_speed: UsbSpeed) -> Self {
        let mut udc = UdcState {
            driver: None,
            eps,
            speed: UsbSpeed::Unknown,
            max_speed,
            address: 0,
            devstatus: 0,
            pullup: false,
            suspended: false,
            fifo_busy: false,
            b_hnp_enable: false,
            a_hnp_support: false,
            a_alt_hnp_support: false,
        };
        udc.eps[0].max_packet = 64;
        udc
    }
}

pub(crate) struct LinkState {
    pub attached: bool,
    pub udc: UdcState,
    pub hs: RootHub,
    pub ss: Option<RootHub>,
}

impl LinkState {
    pub fn root(&self, hub: HubSpeed) -> Option<&RootHub> {
        match hub {
            HubSpeed::Usb2 => Some(&self.hs),
            HubSpeed::Usb3 => self.ss.as_ref(),
        }
    }

    pub fn root_mut(&mut self, hub: HubSpeed) -> Option<&mut RootHub> {
        match hub {
            HubSpeed::Usb2 => Some(&mut self.hs),
            HubSpeed::Usb3 => self.ss.as_mut(),
        }
    }

    /// Borrows the device side together with one root hub.
    pub fn split(&mut self, hub: HubSpeed) -> Option<(&mut UdcState, &mut RootHub)> {
        let root = match hub {
            HubSpeed::Usb2 => &mut self.hs,
            HubSpeed::Usb3 => self.ss.as_mut()?,
        };
        Some((&mut self.udc, root))
    }

    /// The root hub the device is currently routed to.
    pub fn device_hub(&self) -> HubSpeed {
        if self.udc.speed == UsbSpeed::Super && self.ss.is_some() {
            HubSpeed::Usb3
        } else {
            HubSpeed::Usb2
        }
    }

    pub fn hubs(&self) -> &'static [HubSpeed] {
        if self.ss.is_some() {
            &[HubSpeed::Usb2, HubSpeed::Usb3]
        } else {
            &[HubSpeed::Usb2]
        }
    }
}

pub(crate) struct Shared {
    state: Mutex<LinkState>,
    pub clock: Arc<dyn Clock>,
    pub speed: UsbSpeed,
}

impl Shared {
    pub fn lock(&self) -> Guard<'_> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }
}

/// A host instance wired to a device instance.
///
/// Dropping a `Link` without calling [`detach`](Link::detach) leaves the connection up for as
/// long as [`Gadget`] or [`Hcd`] handles to it exist.
pub struct Link {
    shared: Arc<Shared>,
    device: DeviceInstance,
    host: HostInstance,
}

impl Link {
    /// Wires `device` to `host` using the wall clock.
    pub fn attach(device: DeviceInstance, host: HostInstance) -> Result<Link> {
        LinkBuilder::new(device, host).attach()
    }

    pub(crate) fn build(
        device: DeviceInstance,
        host: HostInstance,
        clock: Arc<dyn Clock>,
    ) -> Result<Link> {
        host.config().validate()?;

        let speed = device.max_speed().min(host_speed(host.config()));
        let eps = endpoint::build_table(device.driver().endpoint_names())?;

        let mut hs = RootHub::new(HubSpeed::Usb2);
        hs.start();
        let ss = if host.config().super_speed {
            let mut ss = RootHub::new(HubSpeed::Usb3);
            ss.start();
            Some(ss)
        } else {
            None
        };

        let state = LinkState {
            attached: true,
            udc: UdcState::new(eps, speed),
            hs,
            ss,
        };

        host.driver().probe(&host)?;
        if let Err(err) = device.driver().probe(&device) {
            host.driver().remove(&host);
            return Err(err);
        }

        usb_debug!(
            "link up: {} {} <-> {} {} at {:?}",
            host.name(),
            host.id(),
            device.name(),
            device.id(),
            speed
        );

        Ok(Link {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                clock,
                speed,
            }),
            device,
            host,
        })
    }

    /// Negotiated link speed: the lower of the two controllers' capabilities.
    pub fn speed(&self) -> UsbSpeed {
        self.shared.speed
    }

    /// The device-side handle.
    pub fn gadget(&self) -> Gadget {
        Gadget::from_shared(&self.shared)
    }

    /// The host-side handle for one root hub, if the host has it.
    pub fn root_hub(&self, hub: HubSpeed) -> Option<Hcd> {
        self.shared
            .lock()
            .root(hub)
            .map(|_| Hcd::from_shared(&self.shared, hub))
    }

    /// Runs whatever frame timers and status polls are due on every root hub. Returns true if
    /// any work ran.
    pub fn poll(&self) -> bool {
        let hubs = self.shared.lock().hubs();
        let mut ran = false;

        for hub in hubs {
            ran |= Hcd::from_shared(&self.shared, *hub).poll();
        }

        ran
    }

    pub fn device(&self) -> &DeviceInstance {
        &self.device
    }

    pub fn host(&self) -> &HostInstance {
        &self.host
    }

    /// Unplugs the device: drops the pull-up so a connected device sees `disconnect()`, fails
    /// every pending transfer and queued request with [`Shutdown`](crate::UsbError::Shutdown),
    /// unbinds the gadget driver and hands both instances back.
    pub fn detach(self) -> (DeviceInstance, HostInstance) {
        let shared = &self.shared;
        let mut st = shared.lock();

        st.udc.pullup = false;
        for hub in st.hubs() {
            st = hub::set_link_state(shared, st, *hub);
        }

        for hub in st.hubs() {
            st = hub::fail_pending(shared, st, *hub);
        }

        st = gadget::stop_activity(shared, st);
        st.udc.driver = None;
        st.attached = false;
        drop(st);

        self.host.driver().remove(&self.host);
        self.device.driver().remove(&self.device);

        usb_debug!("link down: {} {}", self.host.name(), self.host.id());

        (self.device, self.host)
    }
}

fn host_speed(config: &HostConfig) -> UsbSpeed {
    if config.super_speed {
        UsbSpeed::Super
    } else if config.high_speed {
        UsbSpeed::High
    } else {
        UsbSpeed::Full
    }
}
