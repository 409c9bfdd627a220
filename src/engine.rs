//! The transfer engine: once per frame, match pending host transfers against device requests.

use crate::control::SetupPacket;
use crate::descriptor::EndpointDescriptor;
use crate::endpoint::EndpointType;
use crate::gadget::Gadget;
use crate::hub::{self, RhState};
use crate::link::{Guard, LinkState, Shared, UdcState};
use crate::request;
use crate::scheduler::FRAME_INTERVAL_MS;
use crate::standard_control::{self, ControlOutcome};
use crate::transfer::TransferHandle;
use crate::{HubSpeed, Status, UsbError, UsbSpeed};
use std::sync::Arc;

/// Largest data stage of a control transfer moved in one pass.
const CONTROL_LIMIT: usize = 64 * 1024;

/// Bulk bytes per frame, from the packet sizes and packets per frame the bus can carry.
pub(crate) fn frame_budget(speed: UsbSpeed) -> Option<usize> {
    match speed {
        UsbSpeed::Low => Some(8 * 12),
        UsbSpeed::Full => Some(64 * 19),
        UsbSpeed::High => Some(512 * 13 * 8),
        // Roughly what a USB 3.0 link moves in 1 ms after protocol overhead.
        UsbSpeed::Super => Some(490_000),
        UsbSpeed::Unknown => None,
    }
}

/// Bytes a periodic endpoint may move per frame.
pub(crate) fn periodic_bytes(speed: UsbSpeed, desc: &EndpointDescriptor) -> usize {
    let mut limit = desc.max_packet() as usize;

    match speed {
        UsbSpeed::High => {
            // high bandwidth mode
            let mult = desc.mult() as usize * 8;
            limit += limit * mult;
        }
        UsbSpeed::Super => match desc.ep_type {
            // up to 16 bursts of 3 packets per service interval
            EndpointType::Isochronous => limit = 3 * 16 * 1024 * 8,
            EndpointType::Interrupt => limit = 3 * 1024 * 8,
            _ => {}
        },
        _ => {}
    }

    limit
}

/// Endpoint table index for an address, ignoring port state.
pub(crate) fn lookup_endpoint(udc: &UdcState, address: u8) -> Option<usize> {
    if address & 0x7f == 0 {
        return Some(0);
    }

    udc.eps
        .iter()
        .skip(1)
        .position(|ep| ep.desc.map_or(false, |d| u8::from(d.address) == address))
        .map(|i| i + 1)
}

/// Endpoint table index for an address, if the device's port can carry traffic.
pub(crate) fn find_endpoint(st: &LinkState, address: u8) -> Option<usize> {
    if !st.root(st.device_hub()).map_or(false, |root| root.is_active()) {
        return None;
    }

    lookup_endpoint(&st.udc, address)
}

fn locate(st: &LinkState, hub: HubSpeed, handle: TransferHandle) -> Option<usize> {
    st.root(hub)?
        .pending
        .iter()
        .position(|p| p.transfer.handle == handle)
}

/// Removes a transfer from the pending list and gives it back with `status`.
fn finish<'a>(
    shared: &'a Arc<Shared>,
    mut st: Guard<'a>,
    hub: HubSpeed,
    handle: TransferHandle,
    status: Status,
    ep: Option<usize>,
) -> Guard<'a> {
    if let Some(ep) = ep.and_then(|ep| st.udc.eps.get_mut(ep)) {
        ep.already_seen = false;
        ep.setup_stage = false;
    }

    let index = match locate(&st, hub, handle) {
        Some(index) => index,
        None => return st,
    };

    let pending = match st.root_mut(hub).and_then(|root| root.pending.remove(index)) {
        Some(pending) => pending,
        None => return st,
    };

    let mut transfer = pending.transfer;
    transfer.status = status;

    usb_trace!(
        "giveback urb {} actual {} status {:?}",
        handle.id(),
        transfer.actual,
        status
    );

    hub::give_back_transfer(shared, st, hub, transfer)
}

/// Moves data between one transfer and the request queue of one endpoint, within `limit` bytes.
/// Returns the unused part of `limit`. The transfer's status is set once it terminates.
fn transfer<'a>(
    shared: &'a Arc<Shared>,
    mut st: Guard<'a>,
    hub: HubSpeed,
    handle: TransferHandle,
    ep_index: usize,
    mut limit: usize,
) -> (Guard<'a>, usize) {
    'top: loop {
        let mut j = 0;

        loop {
            let index = match locate(&st, hub, handle) {
                Some(index) => index,
                None => break 'top,
            };

            let (udc, root) = match st.split(hub) {
                Some(pair) => pair,
                None => break 'top,
            };

            let stream_en = root.stream_enabled(&root.pending[index].transfer.pipe);
            let t = &mut root.pending[index].transfer;
            let ep = &mut udc.eps[ep_index];
            let maxpacket = (ep.max_packet as usize).max(1);

            if j >= ep.queue.len() {
                break 'top;
            }

            if stream_en && t.stream_id != ep.queue[j].stream_id {
                // Wrong stream ID
                j += 1;
                continue;
            }

            let req = &mut ep.queue[j];
            let host_len = t.length() - t.actual;
            let dev_len = req.length() - req.actual;
            let mut len = host_len.min(dev_len);
            let to_host = t.pipe.is_in();
            let mut rescan = false;
            let is_short;

            if len == 0 {
                is_short = true;
            } else {
                // not enough bandwidth left?
                if limit < maxpacket && limit < len {
                    break 'top;
                }
                len = len.min(limit);
                if len == 0 {
                    break 'top;
                }

                // send multiple of maxpacket first, then remainder
                if len > maxpacket {
                    rescan = true;
                    len -= len % maxpacket;
                }
                is_short = len % maxpacket != 0;

                let dev = &mut req.buf[req.actual..req.actual + len];
                let copied = if to_host {
                    t.buffer.write_at(t.actual, dev)
                } else {
                    t.buffer.read_at(t.actual, dev)
                };

                if copied != len {
                    req.status = Status::Failed(UsbError::Protocol);
                } else {
                    limit -= len;
                    t.actual += len;
                    req.actual += len;
                }
            }

            // short packets terminate, maybe with overflow/underflow. Each side decides
            // independently how far it got.
            if req.status.is_terminal() {
                // copy failure, already resolved
            } else if is_short {
                if host_len == dev_len {
                    req.status = Status::Success;
                    t.status = Status::Success;
                } else if to_host {
                    req.status = Status::Success;
                    t.status = if dev_len > host_len {
                        Status::Failed(UsbError::Overflow)
                    } else if t.short_not_ok {
                        Status::Failed(UsbError::Underflow)
                    } else {
                        Status::Success
                    };
                } else {
                    t.status = Status::Success;
                    req.status = if host_len > dev_len {
                        Status::Failed(UsbError::Overflow)
                    } else if req.short_not_ok {
                        Status::Failed(UsbError::Underflow)
                    } else {
                        Status::Success
                    };
                }
            } else {
                // many requests terminate without a short packet
                if req.length() == req.actual && !req.zero {
                    req.status = Status::Success;
                }
                if t.length() == t.actual && !t.zero_packet {
                    t.status = Status::Success;
                }
            }

            let transfer_done = t.status.is_terminal();

            // device side completion --> continuable
            if req.status.is_terminal() {
                if let Some(req) = ep.queue.remove(j) {
                    usb_trace!(
                        "{}: req done {}/{} {:?}",
                        ep.name,
                        req.actual,
                        req.length(),
                        req.status
                    );
                    st = request::give_back(shared, st, req);
                }
                rescan = true;
            }

            // host side completion --> terminate
            if transfer_done {
                break 'top;
            }

            // maybe more space in the transfer or more requests queued
            if rescan {
                continue 'top;
            }

            j += 1;
        }
    }

    (st, limit)
}

enum Step {
    Next,
    Restart,
}

/// Services the pending transfer at `index`.
fn service<'a>(
    shared: &'a Arc<Shared>,
    mut st: Guard<'a>,
    hub: HubSpeed,
    index: usize,
    total: &mut usize,
) -> (Guard<'a>, Step) {
    let speed = st.udc.speed;

    let (handle, pipe, unlinked, running, new_control, setup) = match st.root(hub) {
        Some(root) => {
            let p = &root.pending[index];
            (
                p.transfer.handle,
                p.transfer.pipe,
                p.unlinked,
                root.rh_state == RhState::Running,
                p.new_control,
                p.transfer.setup,
            )
        }
        None => return (st, Step::Next),
    };

    if let Some(reason) = unlinked {
        let st = finish(shared, st, hub, handle, Status::Failed(reason), None);
        return (st, Step::Restart);
    }

    if !running {
        return (st, Step::Next);
    }

    // bandwidth exhausted for this frame
    if pipe.ep_type == EndpointType::Bulk && *total == 0 {
        return (st, Step::Next);
    }

    let ep_index = match find_endpoint(&st, pipe.endpoint.into()) {
        Some(ep_index) => ep_index,
        None => {
            // set_configuration() disagreement
            usb_debug!("no ep configured for urb {}", handle.id());
            let st = finish(shared, st, hub, handle, UsbError::Protocol.into(), None);
            return (st, Step::Restart);
        }
    };

    {
        let ep = &mut st.udc.eps[ep_index];
        if ep.already_seen {
            return (st, Step::Next);
        }
        ep.already_seen = true;
    }

    if ep_index == 0 && new_control {
        st.udc.eps[0].setup_stage = true;
        if let Some(root) = st.root_mut(hub) {
            root.pending[index].new_control = false;
        }
    }

    let (halted, setup_stage) = {
        let ep = &st.udc.eps[ep_index];
        (ep.halted, ep.setup_stage)
    };

    if halted && !setup_stage {
        if pipe.ep_type == EndpointType::Isochronous {
            usb_warn!("isochronous transfer {} on halted endpoint", handle.id());
        }
        usb_debug!("ep {} halted, urb {}", st.udc.eps[ep_index].name, handle.id());
        let st = finish(shared, st, hub, handle, UsbError::Stall.into(), Some(ep_index));
        return (st, Step::Restart);
    }

    let limit = if ep_index == 0 && setup_stage {
        let setup = match setup {
            Some(setup) => setup,
            None => {
                let st = finish(shared, st, hub, handle, UsbError::Protocol.into(), Some(0));
                return (st, Step::Restart);
            }
        };

        // paranoia, in case of stale queued data
        if let Some(mut req) = st.udc.eps[0].queue.pop_front() {
            usb_debug!("stale req {:?}", req.handle());
            req.status = Status::Failed(UsbError::Overflow);
            st = request::give_back(shared, st, req);
            st.udc.eps[0].already_seen = false;
            return (st, Step::Restart);
        }

        // the gadget driver never sees SET_ADDRESS or the standard feature requests
        let ep0 = &mut st.udc.eps[0];
        ep0.setup_stage = false;
        ep0.halted = false;

        match control_request(&mut st, hub, index, &setup) {
            ControlOutcome::Handled(status) => {
                let st = finish(shared, st, hub, handle, status, Some(0));
                return (st, Step::Restart);
            }
            ControlOutcome::Delegate => {
                let (next, value) = delegate_setup(shared, st, &setup);
                st = next;

                if let Err(err) = value {
                    if err != UsbError::NotSupported {
                        usb_debug!("setup --> {:?}", err);
                    }
                    if let Some(root) = st.root_mut(hub) {
                        if let Some(p) = root.pending.iter_mut().find(|p| p.transfer.handle == handle) {
                            p.transfer.actual = 0;
                        }
                    }
                    let st = finish(shared, st, hub, handle, UsbError::Stall.into(), Some(0));
                    return (st, Step::Restart);
                }

                // no delays (max 64KB data stage)
                CONTROL_LIMIT
            }
        }
    } else {
        if pipe.ep_type.is_periodic() {
            let periodic = st.udc.eps[ep_index]
                .desc
                .map_or(0, |desc| periodic_bytes(speed, &desc));
            (*total).max(periodic)
        } else if pipe.ep_type == EndpointType::Control {
            CONTROL_LIMIT
        } else {
            *total
        }
    };

    let (st, remaining) = transfer(shared, st, hub, handle, ep_index, limit);
    let mut st = st;

    if pipe.ep_type == EndpointType::Bulk {
        *total = remaining;
    }

    let status = match locate(&st, hub, handle) {
        Some(index) => st
            .root(hub)
            .map_or(Status::InProgress, |root| root.pending[index].transfer.status),
        None => return (st, Step::Restart),
    };

    if !status.is_terminal() {
        return (st, Step::Next);
    }

    st = finish(shared, st, hub, handle, status, Some(ep_index));
    (st, Step::Restart)
}

fn control_request(
    st: &mut LinkState,
    hub: HubSpeed,
    index: usize,
    setup: &SetupPacket,
) -> ControlOutcome {
    let usb3 = hub == HubSpeed::Usb3;
    let (udc, root) = match st.split(hub) {
        Some(pair) => pair,
        None => return ControlOutcome::Handled(UsbError::Protocol.into()),
    };

    standard_control::handle_control_request(udc, usb3, &mut root.pending[index].transfer, setup)
}

/// Hands a setup packet to the gadget driver with the lock released.
fn delegate_setup<'a>(
    shared: &'a Arc<Shared>,
    st: Guard<'a>,
    setup: &SetupPacket,
) -> (Guard<'a>, crate::Result<()>) {
    let driver = match st.udc.driver.clone() {
        Some(driver) => driver,
        None => return (st, Err(UsbError::Shutdown)),
    };

    drop(st);
    let value = driver.setup(&Gadget::from_shared(shared), setup);
    (shared.lock(), value)
}

/// Runs one frame on `hub`: every pending transfer gets one chance to move data.
pub(crate) fn run_pass(shared: &Arc<Shared>, hub: HubSpeed) {
    let mut st = shared.lock();
    let now = shared.now();

    let mut total = match frame_budget(st.udc.speed) {
        Some(total) => total,
        None => {
            usb_error!("bogus device speed {:?}", st.udc.speed);
            0
        }
    };

    match st.root_mut(hub) {
        Some(root) if root.in_pass => {
            root.timer.kick(now);
            return;
        }
        Some(root) if !root.udev => {
            usb_debug!("timer fired with no transfers pending?");
            return;
        }
        Some(root) => root.in_pass = true,
        None => return,
    }

    for ep in st.udc.eps.iter_mut() {
        ep.already_seen = false;
    }

    'restart: loop {
        let mut index = 0;

        loop {
            let len = st.root(hub).map_or(0, |root| root.pending.len());
            if index >= len {
                break 'restart;
            }

            let (next, step) = service(shared, st, hub, index, &mut total);
            st = next;

            match step {
                Step::Next => index += 1,
                Step::Restart => continue 'restart,
            }
        }
    }

    if let Some(root) = st.root_mut(hub) {
        root.in_pass = false;

        if root.pending.is_empty() {
            root.udev = false;
        } else if root.rh_state == RhState::Running {
            // want a 1 msec delay here
            root.timer.arm(now + FRAME_INTERVAL_MS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_per_speed() {
        assert_eq!(frame_budget(UsbSpeed::High), Some(53_248));
        assert_eq!(frame_budget(UsbSpeed::Full), Some(1_216));
        assert_eq!(frame_budget(UsbSpeed::Unknown), None);
    }

    #[test]
    fn high_bandwidth_periodic() {
        // 1024 bytes, two additional transactions per microframe
        let desc = EndpointDescriptor::new(0x85, EndpointType::Interrupt, 1024 | (2 << 11));
        assert_eq!(periodic_bytes(UsbSpeed::High, &desc), 1024 + 1024 * 16);
        assert_eq!(periodic_bytes(UsbSpeed::Full, &desc), 1024);
        assert_eq!(periodic_bytes(UsbSpeed::Super, &desc), 3 * 1024 * 8);
    }
}
