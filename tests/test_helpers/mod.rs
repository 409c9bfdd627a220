#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use usb_loopback::control::standard_request as sr;
use usb_loopback::hub::{hub_request, port_status, PortFeature, RESET_SIGNAL_MS};
use usb_loopback::prelude::*;

/// Vendor request the recording driver answers with an empty status stage.
pub const REQ_VENDOR_NO_DATA: u8 = 0x01;
/// Vendor request whose OUT data stage the recording driver receives.
pub const REQ_VENDOR_WRITE: u8 = 0x02;

pub const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 1, 0x00, 0x02, 0xff, 0x00, 0x00, 64, 0x34, 0x12, 0x78, 0x56, 0x10, 0x00, 1, 2, 3, 1,
];

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Setup(SetupPacket),
    Disconnect,
    Suspend,
    Resume,
    Request {
        handle: RequestHandle,
        actual: usize,
        status: Status,
        data: Vec<u8>,
    },
    Transfer {
        handle: TransferHandle,
        actual: usize,
        status: Status,
        data: Vec<u8>,
    },
    HubStatusChanged,
    ResumeRootHub,
}

pub type Log = Arc<Mutex<Vec<Event>>>;

pub fn push(log: &Log, event: Event) {
    log.lock().unwrap().push(event);
}

/// Gadget driver that records every callback and answers a few requests.
pub struct RecordingDriver {
    pub log: Log,
    pub max_speed: UsbSpeed,
}

impl GadgetDriver for RecordingDriver {
    fn max_speed(&self) -> UsbSpeed {
        self.max_speed
    }

    fn setup(&self, gadget: &Gadget, setup: &SetupPacket) -> usb_loopback::Result<()> {
        push(&self.log, Event::Setup(*setup));

        match (setup.request_type, setup.request) {
            (RequestType::Standard, sr::GET_DESCRIPTOR) if setup.value >> 8 == 1 => {
                let len = DEVICE_DESCRIPTOR.len().min(setup.length as usize);
                let req = Request::new(DEVICE_DESCRIPTOR[..len].to_vec())
                    .on_complete(request_done(&self.log));
                gadget.queue(EndpointId::EP0, req).map(|_| ())
            }
            (RequestType::Standard, sr::SET_CONFIGURATION)
            | (RequestType::Vendor, REQ_VENDOR_NO_DATA) => {
                let req = Request::new(Vec::new()).on_complete(request_done(&self.log));
                gadget.queue(EndpointId::EP0, req).map(|_| ())
            }
            (RequestType::Vendor, REQ_VENDOR_WRITE) => {
                let req = Request::with_length(setup.length as usize)
                    .on_complete(request_done(&self.log));
                gadget.queue(EndpointId::EP0, req).map(|_| ())
            }
            _ => Err(UsbError::NotSupported),
        }
    }

    fn disconnect(&self, _gadget: &Gadget) {
        push(&self.log, Event::Disconnect);
    }

    fn suspend(&self, _gadget: &Gadget) {
        push(&self.log, Event::Suspend);
    }

    fn resume(&self, _gadget: &Gadget) {
        push(&self.log, Event::Resume);
    }
}

/// Host driver that records root hub notifications.
pub struct RecordingHost {
    pub log: Log,
}

impl HostDriver for RecordingHost {
    fn hub_status_changed(&self, _hcd: &Hcd) {
        push(&self.log, Event::HubStatusChanged);
    }

    fn resume_root_hub(&self, _hcd: &Hcd) {
        push(&self.log, Event::ResumeRootHub);
    }
}

pub fn request_done(log: &Log) -> impl FnOnce(&Gadget, Request) + Send + 'static {
    let log = log.clone();
    move |_, req| {
        push(
            &log,
            Event::Request {
                handle: req.handle(),
                actual: req.actual,
                status: req.status,
                data: req.data().to_vec(),
            },
        )
    }
}

pub fn transfer_done(log: &Log) -> impl FnOnce(&Hcd, Transfer) + Send + 'static {
    let log = log.clone();
    move |_, t| {
        push(
            &log,
            Event::Transfer {
                handle: t.handle(),
                actual: t.actual,
                status: t.status,
                data: t.data(),
            },
        )
    }
}

pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub link: Link,
    pub gadget: Gadget,
    pub hcd: Hcd,
    pub log: Log,
}

/// A link with a recording driver bound and the port still unpowered.
pub fn fixture_with(config: HostConfig, max_speed: UsbSpeed) -> Fixture {
    let clock = ManualClock::new();
    let host = HostInstance::new(Arc::new(usb_loopback::DummyHcdDriver::new()), 0, config);
    let link = LinkBuilder::new(DeviceInstance::dummy(0), host)
        .clock(clock.clone())
        .attach()
        .unwrap();

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let gadget = link.gadget();
    gadget
        .udc_start(Arc::new(RecordingDriver {
            log: log.clone(),
            max_speed,
        }))
        .unwrap();

    let hub = if max_speed == UsbSpeed::Super && config.super_speed {
        HubSpeed::Usb3
    } else {
        HubSpeed::Usb2
    };
    let hcd = link.root_hub(hub).unwrap();

    Fixture {
        clock,
        link,
        gadget,
        hcd,
        log,
    }
}

pub fn fixture() -> Fixture {
    fixture_with(HostConfig::default(), UsbSpeed::High)
}

/// A high speed device that is powered, connected, reset and addressed.
pub fn enumerated() -> Fixture {
    let f = fixture();
    f.connect();
    f.set_address(5);
    f.clear_log();
    f
}

impl Fixture {
    pub fn hub_request(&self, type_req: u16, value: u16, index: u16, buf: &mut [u8]) -> usb_loopback::Result<usize> {
        let setup = SetupPacket::new(
            (type_req >> 8) as u8,
            type_req as u8,
            value,
            index,
            buf.len() as u16,
        );
        self.hcd.hub_control(&setup, buf)
    }

    pub fn set_port_feature(&self, feature: PortFeature) -> usb_loopback::Result<usize> {
        self.hub_request(hub_request::SET_PORT_FEATURE, feature as u16, 1, &mut [])
    }

    pub fn clear_port_feature(&self, feature: PortFeature) -> usb_loopback::Result<usize> {
        self.hub_request(hub_request::CLEAR_PORT_FEATURE, feature as u16, 1, &mut [])
    }

    /// GetPortStatus, as one word: status low, change high.
    pub fn get_port_status(&self) -> u32 {
        let mut buf = [0u8; 4];
        self.hub_request(hub_request::GET_PORT_STATUS, 0, 1, &mut buf)
            .unwrap();
        u32::from_le_bytes(buf)
    }

    /// Powers the port, asserts the pull-up and runs a port reset to completion.
    pub fn connect(&self) -> u32 {
        self.set_port_feature(PortFeature::Power).unwrap();
        self.gadget.pullup(true).unwrap();
        self.set_port_feature(PortFeature::Reset).unwrap();
        self.clock.advance(RESET_SIGNAL_MS);
        let status = self.get_port_status();
        assert_ne!(status & port_status::ENABLE, 0, "port not enabled after reset");
        status
    }

    /// Advances the clock one frame at a time, polling the link each time.
    pub fn run_frames(&self, frames: usize) {
        for _ in 0..frames {
            self.clock.advance(1);
            self.link.poll();
        }
    }

    pub fn submit(&self, transfer: Transfer) -> TransferHandle {
        self.hcd
            .submit(transfer.on_complete(transfer_done(&self.log)))
            .unwrap()
    }

    pub fn queue(&self, ep: EndpointId, req: Request) -> RequestHandle {
        self.gadget
            .queue(ep, req.on_complete(request_done(&self.log)))
            .unwrap()
    }

    pub fn control(&self, setup: SetupPacket, data: Vec<u8>) -> TransferHandle {
        self.submit(Transfer::control(setup, data))
    }

    pub fn set_address(&self, address: u16) {
        let handle = self.control(SetupPacket::new(0x00, sr::SET_ADDRESS, address, 0, 0), Vec::new());
        self.run_frames(1);
        assert_eq!(self.transfer_status(handle), Some(Status::Success));
    }

    /// Enables an endpoint by name with the given descriptor.
    pub fn enable(&self, name: &str, desc: EndpointDescriptor) -> EndpointId {
        let ep = self.gadget.endpoint(name).unwrap();
        self.gadget.ep_enable(ep, &desc).unwrap();
        ep
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn transfer(&self, handle: TransferHandle) -> Option<(usize, Status, Vec<u8>)> {
        self.events().into_iter().find_map(|e| match e {
            Event::Transfer {
                handle: h,
                actual,
                status,
                data,
            } if h == handle => Some((actual, status, data)),
            _ => None,
        })
    }

    pub fn transfer_status(&self, handle: TransferHandle) -> Option<Status> {
        self.transfer(handle).map(|(_, status, _)| status)
    }

    pub fn request(&self, handle: RequestHandle) -> Option<(usize, Status, Vec<u8>)> {
        self.events().into_iter().find_map(|e| match e {
            Event::Request {
                handle: h,
                actual,
                status,
                data,
            } if h == handle => Some((actual, status, data)),
            _ => None,
        })
    }

    /// How many completions were recorded for a handle.
    pub fn completions(&self, handle: TransferHandle) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Transfer { handle: h, .. } if *h == handle))
            .count()
    }

    pub fn setups(&self) -> Vec<SetupPacket> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Setup(setup) => Some(setup),
                _ => None,
            })
            .collect()
    }
}
