use crate::control::{
    device_status, request_type as rt, standard_request as sr, DeviceFeature, SetupPacket,
    FEATURE_ENDPOINT_HALT,
};
use crate::engine::lookup_endpoint;
use crate::link::UdcState;
use crate::transfer::Transfer;
use crate::{Status, UsbError};

/// Result of offering a setup packet to the link before the gadget driver sees it.
pub(crate) enum ControlOutcome {
    /// The request was answered here; the transfer completes with this status.
    Handled(Status),
    /// The gadget driver's `setup()` must handle it.
    Delegate,
}

fn stall(transfer: &mut Transfer) -> ControlOutcome {
    transfer.actual = 0;
    ControlOutcome::Handled(UsbError::Stall.into())
}

/// Selects the devstatus bit a device feature maps to, if the feature is accepted.
fn feature_bit(udc: &mut UdcState, usb3: bool, value: u16, set: bool) -> Option<u16> {
    let feature = DeviceFeature::try_from(value).ok()?;

    match feature {
        DeviceFeature::RemoteWakeup => Some(device_status::REMOTE_WAKEUP),
        DeviceFeature::BHnpEnable if set => {
            udc.b_hnp_enable = true;
            Some(value)
        }
        DeviceFeature::AHnpSupport if set => {
            udc.a_hnp_support = true;
            Some(value)
        }
        DeviceFeature::AAltHnpSupport if set => {
            udc.a_alt_hnp_support = true;
            Some(value)
        }
        DeviceFeature::U1Enable if usb3 => Some(device_status::U1_ENABLED),
        DeviceFeature::U2Enable if usb3 => Some(device_status::U2_ENABLED),
        DeviceFeature::LtmEnable if usb3 => Some(device_status::LTM_ENABLED),
        _ => None,
    }
}

/// Interprets the standard requests the device controller answers on its own: SET_ADDRESS,
/// device and endpoint SET_FEATURE/CLEAR_FEATURE and GET_STATUS. The rest is delegated.
pub(crate) fn handle_control_request(
    udc: &mut UdcState,
    usb3: bool,
    transfer: &mut Transfer,
    setup: &SetupPacket,
) -> ControlOutcome {
    let request_type = setup.request_type_byte();
    let value = setup.value;
    let index = setup.index;

    match (request_type, setup.request) {
        (rt::DEVICE_OUT, sr::SET_ADDRESS) => {
            udc.address = value as u8;
            usb_debug!("set_address = {}", value);
            ControlOutcome::Handled(Status::Success)
        }

        (rt::DEVICE_OUT, sr::SET_FEATURE) => match feature_bit(udc, usb3, value, true) {
            Some(bit) => {
                udc.devstatus |= 1 << bit;
                ControlOutcome::Handled(Status::Success)
            }
            None => stall(transfer),
        },

        (rt::DEVICE_OUT, sr::CLEAR_FEATURE) => match feature_bit(udc, usb3, value, false) {
            Some(bit) => {
                udc.devstatus &= !(1 << bit);
                ControlOutcome::Handled(Status::Success)
            }
            None => stall(transfer),
        },

        (rt::ENDPOINT_OUT, sr::SET_FEATURE) if value == FEATURE_ENDPOINT_HALT => {
            match lookup_endpoint(udc, index as u8) {
                Some(ep) if ep != 0 => {
                    udc.eps[ep].halted = true;
                    ControlOutcome::Handled(Status::Success)
                }
                _ => stall(transfer),
            }
        }

        (rt::ENDPOINT_OUT, sr::CLEAR_FEATURE) if value == FEATURE_ENDPOINT_HALT => {
            match lookup_endpoint(udc, index as u8) {
                Some(ep) => {
                    let ep = &mut udc.eps[ep];
                    if !ep.wedged {
                        ep.halted = false;
                    }
                    ControlOutcome::Handled(Status::Success)
                }
                None => stall(transfer),
            }
        }

        (rt::DEVICE_IN, sr::GET_STATUS)
        | (rt::INTERFACE_IN, sr::GET_STATUS)
        | (rt::ENDPOINT_IN, sr::GET_STATUS) => {
            let first = match request_type {
                rt::ENDPOINT_IN => match lookup_endpoint(udc, index as u8) {
                    Some(ep) => udc.eps[ep].halted as u8,
                    None => return stall(transfer),
                },
                rt::DEVICE_IN => udc.devstatus as u8,
                _ => 0,
            };

            let status = [first, 0];
            let n = transfer.length().min(2);
            transfer.buffer.write_at(0, &status[..n]);
            transfer.actual = n;
            ControlOutcome::Handled(Status::Success)
        }

        _ => ControlOutcome::Delegate,
    }
}
