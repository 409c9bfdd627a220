mod test_helpers;

use crate::test_helpers::*;
use usb_loopback::control::{standard_request as sr, DeviceFeature};
use usb_loopback::prelude::*;

fn bulk_in_ep(f: &Fixture) -> EndpointId {
    f.enable(
        "ep1in-bulk",
        EndpointDescriptor::new(0x81, EndpointType::Bulk, 512),
    )
}

/// Runs a control transfer for one frame and returns its completion.
fn control(f: &Fixture, setup: SetupPacket, data: Vec<u8>) -> (usize, Status, Vec<u8>) {
    let th = f.control(setup, data);
    f.run_frames(1);
    f.transfer(th).expect("control transfer completed")
}

#[test]
fn set_address_is_answered_by_the_link() {
    let f = fixture();
    f.connect();
    f.clear_log();

    f.set_address(42);

    assert_eq!(f.gadget.address(), 42);
    assert!(f.setups().is_empty());
}

#[test]
fn get_descriptor_is_delegated_to_the_driver() {
    let f = enumerated();

    let setup = SetupPacket::new(0x80, sr::GET_DESCRIPTOR, 0x0100, 0, 64);
    let (actual, status, data) = control(&f, setup, vec![0; 64]);

    assert_eq!(f.setups(), vec![setup]);
    assert_eq!((actual, status), (18, Status::Success));
    assert_eq!(data, DEVICE_DESCRIPTOR.to_vec());

    let events = f.events();
    assert!(matches!(
        events[1],
        Event::Request { actual: 18, status: Status::Success, .. }
    ));
}

#[test]
fn short_not_ok_descriptor_read_underflows() {
    let f = enumerated();

    let mut t = Transfer::control(
        SetupPacket::new(0x80, sr::GET_DESCRIPTOR, 0x0100, 0, 64),
        vec![0; 64],
    );
    t.short_not_ok = true;
    let th = f.submit(t);
    f.run_frames(1);

    let (actual, status, _) = f.transfer(th).unwrap();
    assert_eq!((actual, status), (18, Status::Failed(UsbError::Underflow)));
}

#[test]
fn vendor_out_data_stage_reaches_the_driver() {
    let f = enumerated();

    let payload: Vec<u8> = (0..16).collect();
    let setup = SetupPacket::new(0x40, REQ_VENDOR_WRITE, 0, 0, 16);
    let (actual, status, _) = control(&f, setup, payload.clone());

    assert_eq!((actual, status), (16, Status::Success));
    assert_eq!(f.setups()[0].request_type, RequestType::Vendor);

    let received = f.events().into_iter().find_map(|e| match e {
        Event::Request { data, status, .. } => Some((data, status)),
        _ => None,
    });
    assert_eq!(received, Some((payload, Status::Success)));
}

#[test]
fn status_only_requests_complete() {
    let f = enumerated();

    let (actual, status, _) = control(
        &f,
        SetupPacket::new(0x00, sr::SET_CONFIGURATION, 1, 0, 0),
        Vec::new(),
    );
    assert_eq!((actual, status), (0, Status::Success));

    let (_, status, _) = control(
        &f,
        SetupPacket::new(0x40, REQ_VENDOR_NO_DATA, 0, 0, 0),
        Vec::new(),
    );
    assert_eq!(status, Status::Success);
    assert_eq!(f.setups().len(), 2);
}

#[test]
fn unsupported_request_stalls() {
    let f = enumerated();

    let setup = SetupPacket::new(0x80, sr::GET_CONFIGURATION, 0, 0, 1);
    let (actual, status, _) = control(&f, setup, vec![0; 1]);

    assert_eq!((actual, status), (0, Status::Failed(UsbError::Stall)));
    assert_eq!(f.setups(), vec![setup]);

    // the next control transfer starts over
    let (_, status, _) = control(
        &f,
        SetupPacket::new(0x00, sr::SET_CONFIGURATION, 1, 0, 0),
        Vec::new(),
    );
    assert_eq!(status, Status::Success);
}

#[test]
fn stale_ep0_request_is_failed_before_setup() {
    let f = enumerated();

    let stale = f.queue(EndpointId::EP0, Request::with_length(8));
    let th = f.control(
        SetupPacket::new(0x40, REQ_VENDOR_NO_DATA, 0, 0, 0),
        Vec::new(),
    );
    f.run_frames(1);

    let events = f.events();
    assert!(matches!(
        events[0],
        Event::Request { handle, status: Status::Failed(UsbError::Overflow), .. } if handle == stale
    ));
    assert!(matches!(events[1], Event::Setup(_)));
    assert_eq!(f.transfer_status(th), Some(Status::Success));
}

#[test]
fn remote_wakeup_feature_round_trip() {
    let f = enumerated();

    let (_, status, _) = control(
        &f,
        SetupPacket::new(0x00, sr::SET_FEATURE, DeviceFeature::RemoteWakeup as u16, 0, 0),
        Vec::new(),
    );
    assert_eq!(status, Status::Success);

    let (actual, _, data) = control(&f, SetupPacket::new(0x80, sr::GET_STATUS, 0, 0, 2), vec![0; 2]);
    assert_eq!(actual, 2);
    assert_eq!(data, vec![0x02, 0x00]);

    let (_, status, _) = control(
        &f,
        SetupPacket::new(0x00, sr::CLEAR_FEATURE, DeviceFeature::RemoteWakeup as u16, 0, 0),
        Vec::new(),
    );
    assert_eq!(status, Status::Success);
    assert_eq!(f.gadget.device_status(), 0);
    assert!(f.setups().is_empty());
}

#[test]
fn get_status_reports_self_powered() {
    let f = enumerated();
    f.gadget.set_selfpowered(true);

    let (_, _, data) = control(&f, SetupPacket::new(0x80, sr::GET_STATUS, 0, 0, 2), vec![0; 2]);
    assert_eq!(data, vec![0x01, 0x00]);

    let (_, _, data) = control(&f, SetupPacket::new(0x81, sr::GET_STATUS, 0, 0, 2), vec![0; 2]);
    assert_eq!(data, vec![0x00, 0x00]);

    // a one byte buffer gets one byte
    let (actual, status, data) =
        control(&f, SetupPacket::new(0x80, sr::GET_STATUS, 0, 0, 1), vec![0; 1]);
    assert_eq!((actual, status), (1, Status::Success));
    assert_eq!(data, vec![0x01]);
}

#[test]
fn superspeed_features_stall_below_superspeed() {
    let f = enumerated();

    let (actual, status, _) = control(
        &f,
        SetupPacket::new(0x00, sr::SET_FEATURE, DeviceFeature::U1Enable as u16, 0, 0),
        Vec::new(),
    );

    assert_eq!((actual, status), (0, Status::Failed(UsbError::Stall)));
    assert_eq!(f.gadget.device_status(), 0);
}

#[test]
fn superspeed_features_on_usb3_hub() {
    let f = fixture_with(HostConfig::default().super_speed(true), UsbSpeed::Super);
    f.connect();

    for feature in [DeviceFeature::U1Enable, DeviceFeature::U2Enable, DeviceFeature::LtmEnable] {
        let (_, status, _) = control(
            &f,
            SetupPacket::new(0x00, sr::SET_FEATURE, feature as u16, 0, 0),
            Vec::new(),
        );
        assert_eq!(status, Status::Success);
    }
    assert_eq!(f.gadget.device_status(), 0b1_1100);

    let (_, status, _) = control(
        &f,
        SetupPacket::new(0x00, sr::CLEAR_FEATURE, DeviceFeature::U2Enable as u16, 0, 0),
        Vec::new(),
    );
    assert_eq!(status, Status::Success);
    assert_eq!(f.gadget.device_status(), 0b1_0100);
}

#[test]
fn hnp_features_are_set_only() {
    let f = enumerated();

    let (_, status, _) = control(
        &f,
        SetupPacket::new(0x00, sr::SET_FEATURE, DeviceFeature::BHnpEnable as u16, 0, 0),
        Vec::new(),
    );
    assert_eq!(status, Status::Success);
    assert_eq!(f.gadget.device_status(), 1 << 3);
    assert!(f.gadget.b_hnp_enable());
    assert!(!f.gadget.a_hnp_support());

    for feature in [DeviceFeature::AHnpSupport, DeviceFeature::AAltHnpSupport] {
        let (_, status, _) = control(
            &f,
            SetupPacket::new(0x00, sr::SET_FEATURE, feature as u16, 0, 0),
            Vec::new(),
        );
        assert_eq!(status, Status::Success);
    }
    assert!(f.gadget.a_hnp_support());
    assert!(f.gadget.a_alt_hnp_support());

    let (_, status, _) = control(
        &f,
        SetupPacket::new(0x00, sr::CLEAR_FEATURE, DeviceFeature::BHnpEnable as u16, 0, 0),
        Vec::new(),
    );
    assert_eq!(status, Status::Failed(UsbError::Stall));
}

#[test]
fn endpoint_halt_feature() {
    let f = enumerated();
    let ep = bulk_in_ep(&f);

    let (_, status, _) = control(&f, SetupPacket::new(0x02, sr::SET_FEATURE, 0, 0x81, 0), Vec::new());
    assert_eq!(status, Status::Success);
    assert_eq!(f.gadget.is_halted(ep), Ok(true));

    let (_, _, data) = control(&f, SetupPacket::new(0x82, sr::GET_STATUS, 0, 0x81, 2), vec![0; 2]);
    assert_eq!(data, vec![0x01, 0x00]);

    let th = f.submit(Transfer::new(Pipe::bulk_in(1), vec![0; 64]));
    f.run_frames(1);
    assert_eq!(f.transfer_status(th), Some(Status::Failed(UsbError::Stall)));

    let (_, status, _) = control(&f, SetupPacket::new(0x02, sr::CLEAR_FEATURE, 0, 0x81, 0), Vec::new());
    assert_eq!(status, Status::Success);
    assert_eq!(f.gadget.is_halted(ep), Ok(false));
}

#[test]
fn endpoint_halt_refused_for_ep0_and_unknown_endpoints() {
    let f = enumerated();

    let (_, status, _) = control(&f, SetupPacket::new(0x02, sr::SET_FEATURE, 0, 0x00, 0), Vec::new());
    assert_eq!(status, Status::Failed(UsbError::Stall));
    assert_eq!(f.gadget.is_halted(EndpointId::EP0), Ok(false));

    let (_, status, _) = control(&f, SetupPacket::new(0x02, sr::SET_FEATURE, 0, 0x83, 0), Vec::new());
    assert_eq!(status, Status::Failed(UsbError::Stall));

    let (_, status, _) = control(&f, SetupPacket::new(0x82, sr::GET_STATUS, 0, 0x83, 2), vec![0; 2]);
    assert_eq!(status, Status::Failed(UsbError::Stall));
}

#[test]
fn non_halt_endpoint_feature_goes_to_the_driver() {
    let f = enumerated();
    let ep = bulk_in_ep(&f);

    let setup = SetupPacket::new(0x02, sr::SET_FEATURE, 1, 0x81, 0);
    let (_, status, _) = control(&f, setup, Vec::new());

    assert_eq!(f.setups(), vec![setup]);
    assert_eq!(status, Status::Failed(UsbError::Stall));
    assert_eq!(f.gadget.is_halted(ep), Ok(false));
}

#[test]
fn wedged_endpoint_ignores_clear_feature() {
    let f = enumerated();
    let ep = bulk_in_ep(&f);

    f.gadget.set_wedge(ep).unwrap();

    let (_, status, _) = control(&f, SetupPacket::new(0x02, sr::CLEAR_FEATURE, 0, 0x81, 0), Vec::new());
    assert_eq!(status, Status::Success);
    assert_eq!(f.gadget.is_halted(ep), Ok(true));

    f.gadget.set_halt(ep, false).unwrap();
    assert_eq!(f.gadget.is_halted(ep), Ok(false));

    let rh = f.queue(ep, Request::new(vec![9; 128]));
    let th = f.submit(Transfer::new(Pipe::bulk_in(1), vec![0; 128]));
    f.run_frames(1);
    assert_eq!(f.transfer_status(th), Some(Status::Success));
    assert_eq!(f.request(rh).unwrap().1, Status::Success);
}

#[test]
fn control_transfer_without_setup_is_rejected() {
    let f = enumerated();

    let result = f.hcd.submit(Transfer::new(Pipe::control(UsbDirection::In), vec![0; 8]));

    assert_eq!(result.err(), Some(UsbError::InvalidArgument));
}

#[test]
fn unbound_driver_stalls_delegated_requests() {
    let f = enumerated();

    f.gadget.udc_stop().unwrap();
    let (_, status, _) = control(
        &f,
        SetupPacket::new(0x80, sr::GET_DESCRIPTOR, 0x0100, 0, 18),
        vec![0; 18],
    );

    assert_eq!(status, Status::Failed(UsbError::Stall));
    assert!(f.setups().is_empty());
}
