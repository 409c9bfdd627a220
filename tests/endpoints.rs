mod test_helpers;

use crate::test_helpers::*;
use std::sync::{Arc, Mutex};
use usb_loopback::prelude::*;

fn bulk_in(mps: u16) -> EndpointDescriptor {
    EndpointDescriptor::new(0x81, EndpointType::Bulk, mps)
}

#[test]
fn enable_rejects_bad_descriptors() {
    let f = enumerated();
    let ep = f.gadget.endpoint("ep1in-bulk").unwrap();

    assert_eq!(
        f.gadget.ep_enable(EndpointId::EP0, &bulk_in(512)),
        Err(UsbError::InvalidArgument)
    );
    // high speed bulk must use 512 byte packets
    assert_eq!(f.gadget.ep_enable(ep, &bulk_in(64)), Err(UsbError::InvalidArgument));
    // wrong direction for the endpoint's name
    assert_eq!(
        f.gadget
            .ep_enable(ep, &EndpointDescriptor::new(0x01, EndpointType::Bulk, 512)),
        Err(UsbError::InvalidArgument)
    );
    // wrong type for the endpoint's name
    assert_eq!(
        f.gadget
            .ep_enable(ep, &EndpointDescriptor::new(0x81, EndpointType::Interrupt, 64)),
        Err(UsbError::InvalidArgument)
    );

    f.gadget.ep_enable(ep, &bulk_in(512)).unwrap();
    assert_eq!(f.gadget.max_packet(ep), Ok(512));
    assert_eq!(f.gadget.ep_enable(ep, &bulk_in(512)), Err(UsbError::AlreadyEnabled));
}

#[test]
fn enable_requires_enabled_port_and_driver() {
    let f = fixture();
    let ep = f.gadget.endpoint("ep1in-bulk").unwrap();

    assert_eq!(f.gadget.ep_enable(ep, &bulk_in(512)), Err(UsbError::Shutdown));

    f.connect();
    f.gadget.udc_stop().unwrap();
    assert_eq!(f.gadget.ep_enable(ep, &bulk_in(512)), Err(UsbError::Shutdown));
}

#[test]
fn streams_only_on_bulk_endpoints() {
    let f = fixture_with(HostConfig::default().super_speed(true), UsbSpeed::Super);
    f.connect();

    let ep = f.gadget.endpoint("ep5in-int").unwrap();
    let desc = EndpointDescriptor::new(0x85, EndpointType::Interrupt, 64).with_streams(4);
    assert_eq!(f.gadget.ep_enable(ep, &desc), Err(UsbError::InvalidArgument));

    let bulk = EndpointDescriptor::new(0x81, EndpointType::Bulk, 1024).with_streams(4);
    f.enable("ep1in-bulk", bulk);

    assert_eq!(
        f.hcd.alloc_streams(&[desc], 4),
        Err(UsbError::InvalidArgument)
    );
    assert_eq!(f.hcd.alloc_streams(&[bulk], 0), Err(UsbError::InvalidArgument));
    assert_eq!(f.hcd.alloc_streams(&[], 4), Err(UsbError::InvalidArgument));
    assert_eq!(f.hcd.alloc_streams(&[bulk], 2), Ok(2));
}

#[test]
fn stream_requests_need_a_stream_endpoint() {
    let f = fixture_with(HostConfig::default().super_speed(true), UsbSpeed::Super);
    f.connect();

    let plain = f.enable(
        "ep2out-bulk",
        EndpointDescriptor::new(0x02, EndpointType::Bulk, 1024),
    );
    let streams = f.enable(
        "ep7out-bulk",
        EndpointDescriptor::new(0x07, EndpointType::Bulk, 1024).with_streams(4),
    );

    assert_eq!(
        f.gadget.queue(plain, Request::with_length(64).stream(1)).err(),
        Some(UsbError::InvalidArgument)
    );
    assert!(f.gadget.queue(plain, Request::with_length(64)).is_ok());
    assert!(f.gadget.queue(streams, Request::with_length(64).stream(1)).is_ok());

    // disabling forgets stream support
    f.gadget.ep_disable(streams).unwrap();
    f.gadget
        .ep_enable(streams, &EndpointDescriptor::new(0x07, EndpointType::Bulk, 1024))
        .unwrap();
    assert_eq!(
        f.gadget.queue(streams, Request::with_length(64).stream(1)).err(),
        Some(UsbError::InvalidArgument)
    );
}

#[test]
fn stream_grant_is_capped() {
    let f = fixture_with(HostConfig::default().super_speed(true), UsbSpeed::Super);
    f.connect();

    let a = EndpointDescriptor::new(0x81, EndpointType::Bulk, 1024).with_streams(64);
    let b = EndpointDescriptor::new(0x02, EndpointType::Bulk, 1024).with_streams(8);
    f.enable("ep1in-bulk", a);
    f.enable("ep2out-bulk", b);

    assert_eq!(f.hcd.alloc_streams(&[a], 100), Ok(16));
    assert_eq!(f.hcd.alloc_streams(&[b], 100), Ok(8));
}

#[test]
fn disable_fails_queued_requests() {
    let f = enumerated();
    let ep = f.enable(
        "ep2out-bulk",
        EndpointDescriptor::new(0x02, EndpointType::Bulk, 512),
    );

    let a = f.queue(ep, Request::with_length(512));
    let b = f.queue(ep, Request::with_length(512));

    f.gadget.ep_disable(ep).unwrap();

    assert_eq!(f.request(a).unwrap().1, Status::Failed(UsbError::Shutdown));
    assert_eq!(f.request(b).unwrap().1, Status::Failed(UsbError::Shutdown));

    assert_eq!(f.gadget.ep_disable(ep), Err(UsbError::Shutdown));
    assert_eq!(f.gadget.ep_disable(EndpointId::EP0), Err(UsbError::InvalidArgument));
    assert_eq!(
        f.gadget.queue(ep, Request::with_length(8)).err(),
        Some(UsbError::Shutdown)
    );

    // the host now finds nothing behind the pipe
    let th = f.submit(Transfer::new(Pipe::bulk_out(2), vec![0; 8]));
    f.run_frames(1);
    assert_eq!(f.transfer_status(th), Some(Status::Failed(UsbError::Protocol)));
}

#[test]
fn queue_on_endpoint_never_enabled_is_shut_down() {
    let f = enumerated();
    let ep = f.gadget.endpoint("ep1in-bulk").unwrap();

    assert_eq!(
        f.gadget.queue(ep, Request::with_length(8)).err(),
        Some(UsbError::Shutdown)
    );
    assert_eq!(f.gadget.ep_disable(ep), Err(UsbError::Shutdown));

    // ep0 needs no enabling
    assert!(f.gadget.queue(EndpointId::EP0, Request::with_length(8)).is_ok());
}

#[test]
fn halting_in_endpoint_with_queued_data_is_busy() {
    let f = enumerated();
    let ep_in = f.enable("ep1in-bulk", bulk_in(512));
    let ep_out = f.enable(
        "ep2out-bulk",
        EndpointDescriptor::new(0x02, EndpointType::Bulk, 512),
    );

    f.queue(ep_in, Request::new(vec![0; 1024]));
    f.queue(ep_out, Request::with_length(512));

    assert_eq!(f.gadget.set_halt(ep_in, true), Err(UsbError::Busy));
    assert_eq!(f.gadget.set_wedge(ep_in), Err(UsbError::Busy));
    assert_eq!(f.gadget.is_halted(ep_in), Ok(false));

    f.gadget.set_halt(ep_out, true).unwrap();
    assert_eq!(f.gadget.is_halted(ep_out), Ok(true));

    assert_eq!(f.gadget.set_wedge(EndpointId::EP0), Err(UsbError::InvalidArgument));
}

#[test]
fn small_in_request_completes_through_fifo() {
    let f = enumerated();
    let ep = f.enable("ep1in-bulk", bulk_in(512));

    let first = f.queue(ep, Request::new(vec![1; 64]));
    assert_eq!(f.request(first), Some((64, Status::Success, vec![1; 64])));

    // the FIFO is taken until the host reads it
    let second = f.queue(ep, Request::new(vec![2; 32]));
    assert_eq!(f.request(second), None);

    let t1 = f.submit(Transfer::new(Pipe::bulk_in(1), vec![0; 128]));
    f.run_frames(1);
    let (actual, status, data) = f.transfer(t1).unwrap();
    assert_eq!((actual, status), (64, Status::Success));
    assert_eq!(data, vec![1; 64]);
    assert_eq!(f.request(second), None);

    let t2 = f.submit(Transfer::new(Pipe::bulk_in(1), vec![0; 128]));
    f.run_frames(1);
    assert_eq!(f.transfer(t2).unwrap().2, vec![2; 32]);
    assert_eq!(f.request(second).unwrap().1, Status::Success);
}

#[test]
fn dequeue_completes_with_connection_reset() {
    let f = enumerated();
    let ep = f.enable(
        "ep2out-bulk",
        EndpointDescriptor::new(0x02, EndpointType::Bulk, 512),
    );

    let rh = f.queue(ep, Request::with_length(512));
    f.gadget.dequeue(ep, rh).unwrap();

    assert_eq!(
        f.request(rh),
        Some((0, Status::Failed(UsbError::ConnectionReset), Vec::new()))
    );
    assert_eq!(f.gadget.dequeue(ep, rh), Err(UsbError::NotFound));
}

#[test]
fn autoconfig_picks_matching_free_endpoints() {
    let f = enumerated();

    let mut desc = bulk_in(512);
    let ep = f.gadget.autoconfig(&mut desc).unwrap();
    assert_eq!(f.gadget.endpoint_name(ep), Some("ep1in-bulk"));
    assert_eq!(u8::from(desc.address), 0x81);
    f.gadget.ep_enable(ep, &desc).unwrap();

    // the descriptor is renumbered to the endpoint it was placed on
    let mut desc = bulk_in(512);
    let next = f.gadget.autoconfig(&mut desc).unwrap();
    assert_eq!(f.gadget.endpoint_name(next), Some("ep6in-bulk"));
    assert_eq!(u8::from(desc.address), 0x86);
    f.gadget.ep_enable(next, &desc).unwrap();

    // no fixed-function interrupt OUT endpoint: a generic one is used
    let mut int_out = EndpointDescriptor::new(0x0f, EndpointType::Interrupt, 64);
    let ep = f.gadget.autoconfig(&mut int_out).unwrap();
    assert_eq!(f.gadget.endpoint_name(ep), Some("ep3out"));
    assert_eq!(u8::from(int_out.address), 0x03);
    f.gadget.ep_enable(ep, &int_out).unwrap();
}

#[test]
fn lookup_by_name() {
    let f = fixture();

    assert_eq!(f.gadget.endpoint("ep0"), Some(EndpointId::EP0));
    assert_eq!(f.gadget.endpoint("ep2out-bulk").map(|ep| ep.index()), Some(2));
    assert_eq!(f.gadget.endpoint("ep99in"), None);
}

#[test]
fn driver_binding() {
    let f = fixture();
    let log = Arc::new(Mutex::new(Vec::new()));

    assert_eq!(
        f.gadget.udc_start(Arc::new(RecordingDriver {
            log: log.clone(),
            max_speed: UsbSpeed::High,
        })),
        Err(UsbError::AlreadyEnabled)
    );

    f.gadget.udc_stop().unwrap();
    assert_eq!(f.gadget.udc_stop(), Err(UsbError::Shutdown));

    assert_eq!(
        f.gadget.udc_start(Arc::new(RecordingDriver {
            log: log.clone(),
            max_speed: UsbSpeed::Unknown,
        })),
        Err(UsbError::InvalidArgument)
    );
    f.gadget
        .udc_start(Arc::new(RecordingDriver {
            log,
            max_speed: UsbSpeed::Full,
        }))
        .unwrap();
}

#[test]
fn disconnect_resets_halt_and_address() {
    let f = enumerated();
    let ep = f.enable(
        "ep2out-bulk",
        EndpointDescriptor::new(0x02, EndpointType::Bulk, 512),
    );
    f.gadget.set_wedge(ep).unwrap();
    assert_eq!(f.gadget.address(), 5);

    f.gadget.pullup(false).unwrap();

    assert_eq!(f.gadget.is_halted(ep), Ok(false));
    assert_eq!(f.gadget.address(), 0);
}
