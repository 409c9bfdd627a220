//! Emulated single-port root hubs and the port-status state machine.

use crate::control::{device_status, SetupPacket};
use crate::descriptor::{self, descriptor_type, DescriptorWriter};
use crate::gadget::{self, Gadget};
use crate::hcd::{Hcd, HostDriver};
use crate::link::{Guard, LinkState, Shared, UdcState};
use crate::scheduler::Scheduler;
use crate::endpoint::EndpointType;
use crate::transfer::{Pipe, Transfer};
use crate::{HubSpeed, Result, Status, UsbError, UsbSpeed};
use num_enum::TryFromPrimitive;
use std::collections::VecDeque;
use std::sync::Arc;

/// Reset signaling lasts this long before the port reports enabled.
pub const RESET_SIGNAL_MS: u64 = 50;

/// Resume signaling lasts this long before the port leaves suspend.
pub const RESUME_SIGNAL_MS: u64 = 20;

/// `wPortStatus` bits (low half) and `wPortChange` bits (high half) of the port status word.
pub mod port_status {
    pub const CONNECTION: u32 = 0x0001;
    pub const ENABLE: u32 = 0x0002;
    pub const SUSPEND: u32 = 0x0004;
    pub const OVERCURRENT: u32 = 0x0008;
    pub const RESET: u32 = 0x0010;
    pub const L1: u32 = 0x0020;
    pub const POWER: u32 = 0x0100;
    pub const LOW_SPEED: u32 = 0x0200;
    pub const HIGH_SPEED: u32 = 0x0400;
    pub const TEST: u32 = 0x0800;
    pub const INDICATOR: u32 = 0x1000;

    /// SuperSpeed ports move the power bit.
    pub const SS_POWER: u32 = 0x0200;
    pub const SS_LINK_STATE: u32 = 0x01e0;
    pub const SS_LS_U0: u32 = 0x0000;
    pub const SPEED_5GBPS: u32 = 0x0000;

    pub const C_CONNECTION: u32 = 0x0001 << 16;
    pub const C_ENABLE: u32 = 0x0002 << 16;
    pub const C_SUSPEND: u32 = 0x0004 << 16;
    pub const C_OVERCURRENT: u32 = 0x0008 << 16;
    pub const C_RESET: u32 = 0x0010 << 16;

    /// Any of the change bits.
    pub const C_MASK: u32 = C_CONNECTION | C_ENABLE | C_SUSPEND | C_OVERCURRENT | C_RESET;
}

/// Hub class requests, as `bmRequestType << 8 | bRequest`.
pub mod hub_request {
    pub const CLEAR_HUB_FEATURE: u16 = 0x2001;
    pub const CLEAR_PORT_FEATURE: u16 = 0x2301;
    pub const GET_HUB_DESCRIPTOR: u16 = 0xa006;
    pub const GET_HUB_STATUS: u16 = 0xa000;
    pub const GET_PORT_STATUS: u16 = 0xa300;
    pub const SET_HUB_FEATURE: u16 = 0x2003;
    pub const SET_PORT_FEATURE: u16 = 0x2303;
    pub const GET_PORT_ERROR_COUNT: u16 = 0xa308;
    pub const SET_HUB_DEPTH: u16 = 0x200c;
    pub const DEVICE_GET_DESCRIPTOR: u16 = 0x8006;
}

/// Port feature selectors.
#[repr(u16)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortFeature {
    Connection = 0,
    Enable = 1,
    Suspend = 2,
    OverCurrent = 3,
    Reset = 4,
    LinkState = 5,
    Power = 8,
    LowSpeed = 9,
    CConnection = 16,
    CEnable = 17,
    CSuspend = 18,
    COverCurrent = 19,
    CReset = 20,
    Test = 21,
    Indicator = 22,
    U1Timeout = 23,
    U2Timeout = 24,
    CPortLinkState = 25,
    CPortConfigError = 26,
    RemoteWakeMask = 27,
    BhPortReset = 28,
    CBhPortReset = 29,
    ForceLinkPmAccept = 30,
}

/// Root hub run state.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RhState {
    Reset,
    Suspended,
    Running,
}

/// A submitted transfer while it sits on a root hub's pending list.
pub(crate) struct PendingTransfer {
    pub transfer: Transfer,
    pub unlinked: Option<UsbError>,
    pub new_control: bool,
}

pub(crate) struct RootHub {
    pub speed: HubSpeed,
    pub rh_state: RhState,
    pub port_status: u32,
    pub old_status: u32,
    pub re_timeout: u64,
    pub resuming: bool,
    pub active: bool,
    pub old_active: bool,
    pub hw_accessible: bool,
    pub udev: bool,
    pub in_pass: bool,
    pub pending: VecDeque<PendingTransfer>,
    pub stream_en_ep: u32,
    pub num_stream: [u16; 32],
    pub timer: Scheduler,
    pub driver: Option<Arc<dyn HostDriver>>,
}

impl RootHub {
    pub fn new(speed: HubSpeed) -> Self {
        RootHub {
            speed,
            rh_state: RhState::Reset,
            port_status: 0,
            old_status: 0,
            re_timeout: 0,
            resuming: false,
            active: false,
            old_active: false,
            hw_accessible: false,
            udev: false,
            in_pass: false,
            pending: VecDeque::new(),
            stream_en_ep: 0,
            num_stream: [0; 32],
            timer: Scheduler::new(),
            driver: None,
        }
    }

    /// Brings the controller up with the port unpowered.
    pub fn start(&mut self) {
        self.rh_state = RhState::Running;
        self.hw_accessible = true;
        self.port_status = 0;
        self.old_status = 0;
    }

    pub fn is_usb3(&self) -> bool {
        self.speed == HubSpeed::Usb3
    }

    fn power_bit(&self) -> u32 {
        if self.is_usb3() {
            port_status::SS_POWER
        } else {
            port_status::POWER
        }
    }

    pub fn is_powered(&self) -> bool {
        self.port_status & self.power_bit() != 0
    }

    pub fn is_enabled(&self) -> bool {
        self.port_status & port_status::ENABLE != 0
    }

    /// Connected, enabled and not suspended: transfers can reach the device.
    pub fn is_active(&self) -> bool {
        self.port_status
            & (port_status::CONNECTION | port_status::ENABLE | port_status::SUSPEND)
            == (port_status::CONNECTION | port_status::ENABLE)
    }

    /// Whether streams were allocated for the endpoint behind a bulk pipe.
    pub fn stream_enabled(&self, pipe: &Pipe) -> bool {
        pipe.ep_type == EndpointType::Bulk && self.stream_en_ep & (1 << pipe.endpoint.index()) != 0
    }

    fn has_changes(&self) -> bool {
        self.port_status & port_status::C_MASK != 0
    }

    /// Recomputes the connection bits from the power bit and the device's pull-up.
    fn recompute(&mut self, udc: &UdcState) {
        use port_status::*;

        if self.is_usb3() {
            if self.port_status & SS_POWER == 0 {
                self.port_status = 0;
            } else if !udc.pullup || udc.suspended {
                self.port_status &= !(CONNECTION | ENABLE);
                if self.old_status & CONNECTION != 0 {
                    self.port_status |= C_CONNECTION;
                }
            } else {
                self.port_status |= CONNECTION | SPEED_5GBPS;
                if self.old_status & CONNECTION == 0 {
                    self.port_status |= C_CONNECTION;
                }
                if self.port_status & ENABLE != 0
                    && self.port_status & SS_LINK_STATE == SS_LS_U0
                    && self.rh_state != RhState::Suspended
                {
                    self.active = true;
                }
            }
        } else if self.port_status & POWER == 0 {
            self.port_status = 0;
        } else if !udc.pullup || udc.suspended {
            self.port_status &= !(CONNECTION | ENABLE | LOW_SPEED | HIGH_SPEED | SUSPEND);
            if self.old_status & CONNECTION != 0 {
                self.port_status |= C_CONNECTION;
            }
        } else {
            self.port_status |= CONNECTION;
            if self.old_status & CONNECTION == 0 {
                self.port_status |= C_CONNECTION;
            }
            if self.port_status & ENABLE == 0 {
                self.port_status &= !SUSPEND;
            } else if self.port_status & SUSPEND == 0 && self.rh_state != RhState::Suspended {
                self.active = true;
            }
        }
    }

    /// Completes resume signaling once its window has passed.
    fn resolve_resume(&mut self, now: u64) -> bool {
        if self.resuming && now >= self.re_timeout {
            self.port_status |= port_status::C_SUSPEND;
            self.port_status &= !port_status::SUSPEND;
            true
        } else {
            false
        }
    }

    /// Completes reset signaling once its window has passed. The port is enabled only if the
    /// device has its pull-up asserted at that moment.
    fn resolve_reset(&mut self, udc: &mut UdcState, now: u64) {
        use port_status::*;

        if self.port_status & RESET == 0 || now < self.re_timeout {
            return;
        }

        self.port_status |= C_RESET;
        self.port_status &= !RESET;

        if !udc.pullup {
            return;
        }

        self.port_status |= ENABLE;

        if !self.is_usb3() {
            match udc.speed {
                UsbSpeed::High => self.port_status |= HIGH_SPEED,
                UsbSpeed::Low => {
                    udc.eps[0].max_packet = 8;
                    self.port_status |= LOW_SPEED;
                }
                UsbSpeed::Super => {}
                _ => udc.speed = UsbSpeed::Full,
            }
        }
    }
}

/// Recomputes the port status of `hub` and tells the gadget driver about any resulting
/// disconnect, suspend or resume. Callbacks run with the lock released.
pub(crate) fn set_link_state<'a>(
    shared: &'a Arc<Shared>,
    mut st: Guard<'a>,
    hub: HubSpeed,
) -> Guard<'a> {
    use port_status::*;

    let (udc, root) = match st.split(hub) {
        Some(pair) => pair,
        None => return st,
    };

    root.active = false;

    let mismatch = match hub {
        HubSpeed::Usb3 => udc.speed != UsbSpeed::Super,
        HubSpeed::Usb2 => udc.speed == UsbSpeed::Super,
    };
    if udc.pullup && mismatch {
        return st;
    }

    root.recompute(udc);

    if root.port_status & ENABLE == 0 || root.active {
        root.resuming = false;
    }

    let status = root.port_status;
    let old_status = root.old_status;
    let active = root.active;
    let old_active = root.old_active;
    let driver = udc.driver.clone();

    if status & CONNECTION == 0 || status & RESET != 0 {
        if old_status & CONNECTION != 0 && old_status & RESET == 0 {
            if let Some(driver) = driver {
                usb_debug!("{:?} port: device disconnected", hub);
                st = gadget::stop_activity(shared, st);
                drop(st);
                driver.disconnect(&Gadget::from_shared(shared));
                st = shared.lock();
            }
        }
    } else if active != old_active {
        if let Some(driver) = driver {
            drop(st);
            let gadget = Gadget::from_shared(shared);
            if old_active {
                driver.suspend(&gadget);
            } else {
                driver.resume(&gadget);
            }
            st = shared.lock();
        }
    }

    if let Some(root) = st.root_mut(hub) {
        root.old_status = root.port_status;
        root.old_active = active;
    }

    st
}

/// Fails every transfer still pending on `hub` with [`UsbError::Shutdown`], or with the reason
/// it was already cancelled with.
pub(crate) fn fail_pending<'a>(shared: &'a Arc<Shared>, mut st: Guard<'a>, hub: HubSpeed) -> Guard<'a> {
    loop {
        let pending = match st.root_mut(hub).and_then(|root| root.pending.pop_front()) {
            Some(pending) => pending,
            None => break,
        };

        let mut transfer = pending.transfer;
        transfer.status = Status::Failed(pending.unlinked.unwrap_or(UsbError::Shutdown));
        st = give_back_transfer(shared, st, hub, transfer);
    }

    if let Some(root) = st.root_mut(hub) {
        root.udev = false;
        root.timer.cancel();
    }

    st
}

/// Returns a finished transfer to its submitter with the lock released.
pub(crate) fn give_back_transfer<'a>(
    shared: &'a Arc<Shared>,
    st: Guard<'a>,
    hub: HubSpeed,
    mut transfer: Transfer,
) -> Guard<'a> {
    match transfer.complete.take() {
        Some(complete) => {
            drop(st);
            complete(&Hcd::from_shared(shared, hub), transfer);
            shared.lock()
        }
        None => st,
    }
}

/// Calls into the host driver with the lock released.
fn notify_host<'a, F>(shared: &'a Arc<Shared>, st: Guard<'a>, hub: HubSpeed, f: F) -> Guard<'a>
where
    F: FnOnce(&dyn HostDriver, &Hcd),
{
    let driver = st.root(hub).and_then(|root| root.driver.clone());

    match driver {
        Some(driver) => {
            drop(st);
            f(driver.as_ref(), &Hcd::from_shared(shared, hub));
            shared.lock()
        }
        None => st,
    }
}

/// Tells the host driver that the port change bitmap may have changed.
pub(crate) fn poll_status<'a>(shared: &'a Arc<Shared>, st: Guard<'a>, hub: HubSpeed) -> Guard<'a> {
    notify_host(shared, st, hub, |driver, hcd| driver.hub_status_changed(hcd))
}

/// Port change bitmap: `Some(0x02)` when port 1 has change bits set.
pub(crate) fn hub_status_data(shared: &Arc<Shared>, hub: HubSpeed) -> Result<Option<u8>> {
    let mut st = shared.lock();
    let now = shared.now();

    if !st.attached {
        return Err(UsbError::Shutdown);
    }

    let root = st.root_mut(hub).ok_or(UsbError::NotFound)?;
    if !root.hw_accessible {
        return Ok(None);
    }

    if root.resolve_resume(now) {
        st = set_link_state(shared, st, hub);
    }

    let (changed, suspended) = match st.root(hub) {
        Some(root) => (root.has_changes(), root.rh_state == RhState::Suspended),
        None => return Err(UsbError::NotFound),
    };

    if !changed {
        return Ok(None);
    }

    usb_debug!("{:?} port status change pending", hub);

    if suspended {
        drop(notify_host(shared, st, hub, |driver, hcd| {
            driver.resume_root_hub(hcd)
        }));
    }

    Ok(Some(1 << 1))
}

fn fill(buf: &mut [u8], data: &[u8]) -> usize {
    let n = data.len().min(buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    n
}

/// Handles one hub class request on `hub`, writing any response into `buf`.
pub(crate) fn hub_control(
    shared: &Arc<Shared>,
    hub: HubSpeed,
    setup: &SetupPacket,
    buf: &mut [u8],
) -> Result<usize> {
    let mut st = shared.lock();

    if !st.attached {
        return Err(UsbError::Shutdown);
    }

    let now = shared.now();
    let root = st.root(hub).ok_or(UsbError::NotFound)?;
    if !root.hw_accessible {
        return Err(UsbError::Shutdown);
    }
    let usb3 = root.is_usb3();

    usb_trace!(
        "{:?} hub_control {:04x} value {:04x} index {}",
        hub,
        setup.type_req(),
        setup.value,
        setup.index
    );

    let (result, st) = match setup.type_req() {
        hub_request::CLEAR_HUB_FEATURE => (Ok(0), st),

        hub_request::CLEAR_PORT_FEATURE => clear_port_feature(shared, st, hub, setup.value, now),

        hub_request::GET_HUB_DESCRIPTOR => {
            let mut desc = [0u8; 16];
            let mut writer = DescriptorWriter::new(&mut desc);
            let written = if usb3 {
                if setup.length < 12 || setup.value != (descriptor_type::SS_HUB as u16) << 8 {
                    usb_debug!("wrong hub descriptor type for USB 3.0 root hub");
                    Err(UsbError::Stall)
                } else {
                    descriptor::write_ss_hub_descriptor(&mut writer).map(|_| writer.position())
                }
            } else {
                descriptor::write_hub_descriptor(&mut writer).map(|_| writer.position())
            };
            (written.map(|n| fill(buf, &desc[..n])), st)
        }

        hub_request::DEVICE_GET_DESCRIPTOR => {
            if !usb3 || (setup.value >> 8) as u8 != descriptor_type::BOS {
                (Err(UsbError::Stall), st)
            } else {
                let mut desc = [0u8; 16];
                let mut writer = DescriptorWriter::new(&mut desc);
                let written =
                    descriptor::write_bos_descriptor(&mut writer).map(|_| writer.position());
                (written.map(|n| fill(buf, &desc[..n])), st)
            }
        }

        hub_request::GET_HUB_STATUS => (Ok(fill(buf, &[0, 0, 0, 0])), st),

        hub_request::GET_PORT_STATUS => {
            if setup.index != 1 {
                (Err(UsbError::Stall), st)
            } else {
                get_port_status(shared, st, hub, now, buf)
            }
        }

        hub_request::SET_HUB_FEATURE => (Err(UsbError::Stall), st),

        hub_request::SET_PORT_FEATURE => set_port_feature(shared, st, hub, setup.value, now),

        hub_request::GET_PORT_ERROR_COUNT => {
            if usb3 {
                (Ok(fill(buf, &[0, 0])), st)
            } else {
                usb_debug!("GetPortErrorCount only on USB 3.0 root hub");
                (Err(UsbError::Stall), st)
            }
        }

        hub_request::SET_HUB_DEPTH => {
            if usb3 {
                (Ok(0), st)
            } else {
                usb_debug!("SetHubDepth only on USB 3.0 root hub");
                (Err(UsbError::Stall), st)
            }
        }

        other => {
            usb_debug!(
                "hub control req {:04x} v{:04x} i{:04x} l{}",
                other,
                setup.value,
                setup.index,
                setup.length
            );
            (Err(UsbError::Stall), st)
        }
    };

    if st.root(hub).map_or(false, RootHub::has_changes) {
        drop(poll_status(shared, st, hub));
    }

    result
}

type Step<'a> = (Result<usize>, Guard<'a>);

fn clear_port_feature<'a>(
    shared: &'a Arc<Shared>,
    mut st: Guard<'a>,
    hub: HubSpeed,
    value: u16,
    now: u64,
) -> Step<'a> {
    let root = match st.root_mut(hub) {
        Some(root) => root,
        None => return (Err(UsbError::NotFound), st),
    };

    match PortFeature::try_from(value) {
        Ok(PortFeature::Suspend) => {
            if root.is_usb3() {
                usb_debug!("USB_PORT_FEAT_SUSPEND req not supported for USB 3.0 roothub");
                return (Err(UsbError::Stall), st);
            }
            if root.port_status & port_status::SUSPEND != 0 {
                // 20 msec resume signaling
                root.resuming = true;
                root.re_timeout = now + RESUME_SIGNAL_MS;
            }
            (Ok(0), st)
        }
        Ok(PortFeature::Power) => {
            usb_debug!("{:?} port power off", hub);
            let power = root.power_bit();
            root.port_status &= !power;
            (Ok(0), set_link_state(shared, st, hub))
        }
        _ => {
            if value >= 32 {
                return (Err(UsbError::Stall), st);
            }
            root.port_status &= !(1u32 << value);
            (Ok(0), set_link_state(shared, st, hub))
        }
    }
}

fn get_port_status<'a>(
    shared: &'a Arc<Shared>,
    mut st: Guard<'a>,
    hub: HubSpeed,
    now: u64,
    buf: &mut [u8],
) -> Step<'a> {
    let (udc, root) = match st.split(hub) {
        Some(pair) => pair,
        None => return (Err(UsbError::NotFound), st),
    };

    // Whoever resets or resumes must get_port_status to complete it.
    root.resolve_resume(now);
    root.resolve_reset(udc, now);

    let mut st = set_link_state(shared, st, hub);

    let status = match st.root_mut(hub) {
        Some(root) => root.port_status,
        None => return (Err(UsbError::NotFound), st),
    };

    let mut data = [0u8; 4];
    data[..2].copy_from_slice(&(status as u16).to_le_bytes());
    data[2..].copy_from_slice(&((status >> 16) as u16).to_le_bytes());

    usb_trace!("{:?} port status {:08x}", hub, status);

    (Ok(fill(buf, &data)), st)
}

fn set_port_feature<'a>(
    shared: &'a Arc<Shared>,
    mut st: Guard<'a>,
    hub: HubSpeed,
    value: u16,
    now: u64,
) -> Step<'a> {
    use port_status::*;

    let (udc, root) = match st.split(hub) {
        Some(pair) => pair,
        None => return (Err(UsbError::NotFound), st),
    };
    let usb3 = root.is_usb3();

    match PortFeature::try_from(value) {
        Ok(PortFeature::LinkState) | Ok(PortFeature::U1Timeout) | Ok(PortFeature::U2Timeout) => {
            if usb3 {
                // Link power management is not emulated.
                (Ok(0), st)
            } else {
                usb_debug!("feature {} only on USB 3.0 root hub", value);
                (Err(UsbError::Stall), st)
            }
        }
        Ok(PortFeature::Suspend) => {
            if usb3 {
                usb_debug!("USB_PORT_FEAT_SUSPEND req not supported for USB 3.0 roothub");
                return (Err(UsbError::Stall), st);
            }
            if root.active {
                root.port_status |= SUSPEND;
                if udc.b_hnp_enable {
                    usb_debug!("no HNP yet!");
                }
                (Ok(0), set_link_state(shared, st, hub))
            } else {
                (Ok(0), st)
            }
        }
        Ok(PortFeature::Power) => {
            usb_debug!("{:?} port power on", hub);
            let power = root.power_bit();
            root.port_status |= power;
            (Ok(0), set_link_state(shared, st, hub))
        }
        Ok(PortFeature::BhPortReset) if !usb3 => {
            usb_debug!("USB_PORT_FEAT_BH_PORT_RESET req not supported for USB 2.0 roothub");
            (Err(UsbError::Stall), st)
        }
        Ok(PortFeature::BhPortReset) | Ok(PortFeature::Reset) => {
            if usb3 {
                root.port_status = SS_POWER | CONNECTION | RESET;
            } else {
                root.port_status &= !(ENABLE | LOW_SPEED | HIGH_SPEED);
            }
            // The device's remote wakeup and link power settings do not survive a reset.
            udc.devstatus &= 1 << device_status::SELF_POWERED;
            // 50 msec reset signaling
            root.re_timeout = now + RESET_SIGNAL_MS;
            if root.is_powered() {
                root.port_status |= RESET;
                (Ok(0), set_link_state(shared, st, hub))
            } else {
                (Ok(0), st)
            }
        }
        _ => {
            if value >= 32 {
                return (Err(UsbError::Stall), st);
            }
            if root.is_powered() {
                root.port_status |= 1u32 << value;
                (Ok(0), set_link_state(shared, st, hub))
            } else {
                (Ok(0), st)
            }
        }
    }
}

/// Suspends the root hub: transfers stop being scheduled and the device sees suspend.
pub(crate) fn bus_suspend(shared: &Arc<Shared>, hub: HubSpeed) -> Result<()> {
    let mut st = shared.lock();

    let root = st.root_mut(hub).ok_or(UsbError::NotFound)?;
    root.rh_state = RhState::Suspended;
    usb_debug!("{:?} bus suspend", hub);

    drop(set_link_state(shared, st, hub));
    Ok(())
}

/// Resumes the root hub and restarts the frame timer if work is pending.
pub(crate) fn bus_resume(shared: &Arc<Shared>, hub: HubSpeed) -> Result<()> {
    let mut st = shared.lock();
    let now = shared.now();

    let root = st.root_mut(hub).ok_or(UsbError::NotFound)?;
    if !root.hw_accessible {
        return Err(UsbError::Shutdown);
    }
    root.rh_state = RhState::Running;
    usb_debug!("{:?} bus resume", hub);

    let mut st = set_link_state(shared, st, hub);
    if let Some(root) = st.root_mut(hub) {
        if !root.pending.is_empty() {
            root.timer.arm(now);
        }
    }

    Ok(())
}

/// The speed shown in transfer listings for a root hub.
pub(crate) fn listing_speed(st: &LinkState, hub: HubSpeed) -> UsbSpeed {
    match hub {
        HubSpeed::Usb3 => UsbSpeed::Super,
        HubSpeed::Usb2 => match st.udc.speed {
            UsbSpeed::Unknown | UsbSpeed::Super => UsbSpeed::Full,
            speed => speed,
        },
    }
}
