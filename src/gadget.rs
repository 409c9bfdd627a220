//! Device-side facade: what a gadget (function) driver sees of the device controller.

use crate::control::{device_status, DeviceFeature, SetupPacket};
use crate::descriptor::EndpointDescriptor;
use crate::endpoint::{self, EndpointAddress, EndpointId};
use crate::hub::{self, port_status, RhState, RESUME_SIGNAL_MS};
use crate::link::{Guard, Shared};
use crate::request::{self, Request, RequestHandle};
use crate::{Result, UsbError, UsbSpeed};
use std::sync::Arc;

/// Callbacks into the function driver bound to the device controller.
///
/// All callbacks run without the link lock held and may call back into the [`Gadget`].
pub trait GadgetDriver: Send + Sync {
    /// Highest speed the function supports.
    fn max_speed(&self) -> UsbSpeed {
        UsbSpeed::High
    }

    /// Handles a control request the device controller does not answer itself. A data or status
    /// stage is completed by queueing a request on endpoint 0. Returning an error stalls the
    /// control transfer.
    fn setup(&self, gadget: &Gadget, setup: &SetupPacket) -> Result<()>;

    /// The host side went away. Every queued request has already been failed.
    fn disconnect(&self, gadget: &Gadget) {
        let _ = gadget;
    }

    fn suspend(&self, gadget: &Gadget) {
        let _ = gadget;
    }

    fn resume(&self, gadget: &Gadget) {
        let _ = gadget;
    }
}

/// Handle to the device controller of a [`Link`](crate::link::Link).
#[derive(Clone)]
pub struct Gadget {
    shared: Arc<Shared>,
}

impl Gadget {
    pub(crate) fn from_shared(shared: &Arc<Shared>) -> Gadget {
        Gadget {
            shared: shared.clone(),
        }
    }

    /// Binds a function driver.
    pub fn udc_start(&self, driver: Arc<dyn GadgetDriver>) -> Result<()> {
        if driver.max_speed() == UsbSpeed::Unknown {
            return Err(UsbError::InvalidArgument);
        }

        let mut st = self.shared.lock();

        if !st.attached {
            return Err(UsbError::Shutdown);
        }

        if st.udc.driver.is_some() {
            return Err(UsbError::AlreadyEnabled);
        }

        st.udc.devstatus = 0;
        st.udc.driver = Some(driver);

        Ok(())
    }

    /// Unbinds the function driver, failing every queued request first.
    pub fn udc_stop(&self) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.lock();

        if st.udc.driver.is_none() {
            return Err(UsbError::Shutdown);
        }

        st = stop_activity(shared, st);
        st.udc.driver = None;

        Ok(())
    }

    /// Looks up an endpoint by its controller name, e.g. `ep1in-bulk`.
    pub fn endpoint(&self, name: &str) -> Option<EndpointId> {
        self.shared
            .lock()
            .udc
            .eps
            .iter()
            .position(|ep| ep.name == name)
            .map(EndpointId)
    }

    /// Finds an unused endpoint that can carry `desc`, in table order, and rewrites the number
    /// in `desc.address` to the one the endpoint is wired to. The updated descriptor is what must
    /// be passed to [`Gadget::ep_enable`].
    pub fn autoconfig(&self, desc: &mut EndpointDescriptor) -> Option<EndpointId> {
        let st = self.shared.lock();
        let direction = desc.address.direction();

        let (index, ep) = st.udc.eps.iter().enumerate().skip(1).find(|(_, ep)| {
            ep.desc.is_none()
                && ep.caps.direction.map_or(true, |d| d == direction)
                && ep.caps.ep_type.map_or(true, |t| t == desc.ep_type)
        })?;

        if let Some(number) = ep.caps.number {
            desc.address = EndpointAddress::from_parts(number, direction);
        }

        Some(EndpointId(index))
    }

    /// Name of an endpoint.
    pub fn endpoint_name(&self, ep: EndpointId) -> Option<&'static str> {
        self.shared.lock().udc.eps.get(ep.0).map(|e| e.name)
    }

    /// Configures an endpoint for `desc`.
    pub fn ep_enable(&self, ep: EndpointId, desc: &EndpointDescriptor) -> Result<()> {
        let mut st = self.shared.lock();

        if ep == EndpointId::EP0 {
            return Err(UsbError::InvalidArgument);
        }

        let hub = st.device_hub();
        let port_enabled = st.root(hub).map_or(false, |root| root.is_enabled());
        let speed = st.udc.speed;
        let has_driver = st.udc.driver.is_some();

        let endpoint = st.udc.eps.get_mut(ep.0).ok_or(UsbError::InvalidArgument)?;

        if endpoint.desc.is_some() {
            return Err(UsbError::AlreadyEnabled);
        }

        if !has_driver || !port_enabled {
            return Err(UsbError::Shutdown);
        }

        endpoint::validate_descriptor(endpoint, desc, speed)?;

        endpoint.desc = Some(*desc);
        endpoint.max_packet = desc.max_packet();
        endpoint.stream_en = desc.max_streams > 0;
        endpoint.halted = false;
        endpoint.wedged = false;

        usb_debug!(
            "enabled {} (ep{}{}-{:?}) maxpacket {} stream {}",
            endpoint.name,
            desc.address.number(),
            if desc.address.is_in() { "in" } else { "out" },
            desc.ep_type,
            endpoint.max_packet,
            endpoint.stream_en
        );

        Ok(())
    }

    /// Deconfigures an endpoint and fails its queued requests with [`UsbError::Shutdown`].
    pub fn ep_disable(&self, ep: EndpointId) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.lock();

        if ep == EndpointId::EP0 {
            return Err(UsbError::InvalidArgument);
        }

        let endpoint = st.udc.eps.get_mut(ep.0).ok_or(UsbError::InvalidArgument)?;
        if endpoint.desc.is_none() {
            return Err(UsbError::Shutdown);
        }

        endpoint.desc = None;
        endpoint.stream_en = false;
        usb_debug!("disabled {}", endpoint.name);

        drop(request::nuke(shared, st, ep.0));

        Ok(())
    }

    /// Queues a request on an endpoint. Small IN requests may complete before this returns.
    pub fn queue(&self, ep: EndpointId, req: Request) -> Result<RequestHandle> {
        request::enqueue(&self.shared, ep, req)
    }

    /// Takes a still-queued request back, completing it with [`UsbError::ConnectionReset`].
    pub fn dequeue(&self, ep: EndpointId, handle: RequestHandle) -> Result<()> {
        request::dequeue(&self.shared, ep, handle)
    }

    fn set_halt_and_wedge(&self, ep: EndpointId, value: bool, wedge: bool) -> Result<()> {
        let mut st = self.shared.lock();

        if st.udc.driver.is_none() {
            return Err(UsbError::Shutdown);
        }

        let endpoint = st.udc.eps.get_mut(ep.0).ok_or(UsbError::InvalidArgument)?;

        if !value {
            endpoint.halted = false;
            endpoint.wedged = false;
        } else if endpoint.is_in() && !endpoint.queue.is_empty() {
            return Err(UsbError::Busy);
        } else {
            endpoint.halted = true;
            if wedge {
                endpoint.wedged = true;
            }
        }

        Ok(())
    }

    /// Halts or un-halts an endpoint. Clearing also clears a wedge.
    pub fn set_halt(&self, ep: EndpointId, value: bool) -> Result<()> {
        self.set_halt_and_wedge(ep, value, false)
    }

    /// Halts an endpoint so that only [`set_halt(ep, false)`](Gadget::set_halt) clears it, not a
    /// host CLEAR_FEATURE.
    pub fn set_wedge(&self, ep: EndpointId) -> Result<()> {
        if ep == EndpointId::EP0 {
            return Err(UsbError::InvalidArgument);
        }
        self.set_halt_and_wedge(ep, true, true)
    }

    pub fn is_halted(&self, ep: EndpointId) -> Result<bool> {
        let st = self.shared.lock();
        st.udc
            .eps
            .get(ep.0)
            .map(|e| e.halted)
            .ok_or(UsbError::InvalidArgument)
    }

    /// Current max packet size of an endpoint.
    pub fn max_packet(&self, ep: EndpointId) -> Result<u16> {
        let st = self.shared.lock();
        st.udc
            .eps
            .get(ep.0)
            .map(|e| e.max_packet)
            .ok_or(UsbError::InvalidArgument)
    }

    /// Asserts or drops the pull-up. Asserting it picks the operating speed from the link speed
    /// and the bound driver.
    pub fn pullup(&self, on: bool) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.lock();

        if !st.attached {
            return Err(UsbError::Shutdown);
        }

        if on {
            if let Some(driver) = st.udc.driver.clone() {
                let driver_max = driver.max_speed();
                let link = st.udc.max_speed;

                st.udc.speed = if link <= UsbSpeed::Full {
                    UsbSpeed::Full
                } else {
                    link.min(driver_max)
                };
                st.udc.eps[0].max_packet = if st.udc.speed == UsbSpeed::Super {
                    512
                } else {
                    64
                };

                if st.udc.speed < driver_max {
                    usb_debug!("this device can perform faster at {:?}", driver_max);
                }
            }
        }

        st.udc.pullup = on;
        usb_debug!("pullup {} at {:?}", on, st.udc.speed);

        let hub = st.device_hub();
        st = hub::set_link_state(shared, st, hub);
        drop(hub::poll_status(shared, st, hub));

        Ok(())
    }

    /// Asks the host to resume a suspended bus.
    pub fn wakeup(&self) -> Result<()> {
        let mut st = self.shared.lock();
        let now = self.shared.now();

        let armed = (1 << device_status::REMOTE_WAKEUP) | (1 << DeviceFeature::BHnpEnable as u16);
        if st.udc.devstatus & armed == 0 {
            return Err(UsbError::InvalidState);
        }

        let hub = st.device_hub();
        let root = st.root_mut(hub).ok_or(UsbError::NotConnected)?;

        if root.port_status & port_status::CONNECTION == 0 {
            return Err(UsbError::NotConnected);
        }

        if root.port_status & port_status::SUSPEND == 0 && root.rh_state != RhState::Suspended {
            return Err(UsbError::InvalidState);
        }

        // the hub notices the request and issues downstream resume
        root.resuming = true;
        root.re_timeout = now + RESUME_SIGNAL_MS;
        root.timer.poll_status_at(root.re_timeout);

        Ok(())
    }

    pub fn set_selfpowered(&self, value: bool) {
        let mut st = self.shared.lock();
        if value {
            st.udc.devstatus |= 1 << device_status::SELF_POWERED;
        } else {
            st.udc.devstatus &= !(1 << device_status::SELF_POWERED);
        }
    }

    /// Current 11-bit frame number.
    pub fn get_frame(&self) -> u16 {
        self.shared.clock.frame_number()
    }

    /// Power-manages the device controller: a suspended controller looks disconnected.
    pub fn suspend(&self) {
        self.set_suspended(true);
    }

    pub fn resume(&self) {
        self.set_suspended(false);
    }

    fn set_suspended(&self, value: bool) {
        let shared = &self.shared;
        let mut st = shared.lock();

        st.udc.suspended = value;
        let hub = st.device_hub();
        st = hub::set_link_state(shared, st, hub);
        drop(hub::poll_status(shared, st, hub));
    }

    /// Address assigned by the host with SET_ADDRESS.
    pub fn address(&self) -> u8 {
        self.shared.lock().udc.address
    }

    /// Operating speed, `Unknown` until the pull-up is first asserted with a driver bound.
    pub fn speed(&self) -> UsbSpeed {
        self.shared.lock().udc.speed
    }

    /// The device GET_STATUS word.
    pub fn device_status(&self) -> u16 {
        self.shared.lock().udc.devstatus
    }

    /// Whether the host enabled HNP with SET_FEATURE(B_HNP_ENABLE).
    pub fn b_hnp_enable(&self) -> bool {
        self.shared.lock().udc.b_hnp_enable
    }

    /// Whether the host announced HNP support on this port with SET_FEATURE(A_HNP_SUPPORT).
    pub fn a_hnp_support(&self) -> bool {
        self.shared.lock().udc.a_hnp_support
    }

    /// Whether the host announced HNP support on another port with
    /// SET_FEATURE(A_ALT_HNP_SUPPORT).
    pub fn a_alt_hnp_support(&self) -> bool {
        self.shared.lock().udc.a_alt_hnp_support
    }
}

/// Quiesces the device side: forgets the address and fails every queued request.
pub(crate) fn stop_activity<'a>(shared: &'a Arc<Shared>, mut st: Guard<'a>) -> Guard<'a> {
    st.udc.address = 0;

    for ep in 0..st.udc.eps.len() {
        st = request::nuke(shared, st, ep);
        if let Some(ep) = st.udc.eps.get_mut(ep) {
            ep.reset();
        }
    }

    st
}
