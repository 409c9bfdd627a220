//! Host-side facade: what a host client (USB core) sees of one root hub.

use crate::control::SetupPacket;
use crate::descriptor::{EndpointDescriptor, MAX_STREAMS};
use crate::endpoint::EndpointType;
use crate::engine;
use crate::hub::{self, PendingTransfer, RhState, RootHub};
use crate::link::Shared;
use crate::transfer::{Transfer, TransferHandle};
use crate::{HubSpeed, Result, Status, UsbError};
use std::sync::Arc;

/// Notifications from a root hub to the host-side USB core.
///
/// Both callbacks run without the link lock held.
pub trait HostDriver: Send + Sync {
    /// The port change bitmap may have changed; the core should call
    /// [`Hcd::hub_status_data`].
    fn hub_status_changed(&self, hcd: &Hcd) {
        let _ = hcd;
    }

    /// A port change was seen while the root hub was suspended.
    fn resume_root_hub(&self, hcd: &Hcd) {
        let _ = hcd;
    }
}

/// Handle to one root hub of a [`Link`](crate::link::Link).
#[derive(Clone)]
pub struct Hcd {
    shared: Arc<Shared>,
    hub: HubSpeed,
}

fn validate_stream(root: &RootHub, transfer: &Transfer) -> Result<()> {
    let enabled = root.stream_enabled(&transfer.pipe);

    if transfer.stream_id == 0 {
        return if enabled {
            Err(UsbError::InvalidArgument)
        } else {
            Ok(())
        };
    }

    if !enabled {
        return Err(UsbError::InvalidArgument);
    }

    let max_streams = root.num_stream[transfer.pipe.endpoint.index()];
    if transfer.stream_id > max_streams {
        usb_warn!("stream id {} is out of range", transfer.stream_id);
        return Err(UsbError::InvalidArgument);
    }

    Ok(())
}

impl Hcd {
    pub(crate) fn from_shared(shared: &Arc<Shared>, hub: HubSpeed) -> Hcd {
        Hcd {
            shared: shared.clone(),
            hub,
        }
    }

    /// Which root hub this handle drives.
    pub fn hub_speed(&self) -> HubSpeed {
        self.hub
    }

    /// Installs the driver notified of root hub status changes.
    pub fn set_driver(&self, driver: Arc<dyn HostDriver>) {
        if let Some(root) = self.shared.lock().root_mut(self.hub) {
            root.driver = Some(driver);
        }
    }

    /// Queues a transfer. Its completion callback runs later from [`poll`](Hcd::poll) or
    /// [`run_frame`](Hcd::run_frame).
    pub fn submit(&self, mut transfer: Transfer) -> Result<TransferHandle> {
        let mut st = self.shared.lock();
        let now = self.shared.now();

        if !st.attached {
            return Err(UsbError::Shutdown);
        }

        let speed = hub::listing_speed(&st, self.hub);
        let root = st.root_mut(self.hub).ok_or(UsbError::NotFound)?;

        if !root.hw_accessible {
            return Err(UsbError::Shutdown);
        }

        let new_control = transfer.pipe.ep_type == EndpointType::Control;
        if new_control && transfer.setup.is_none() {
            return Err(UsbError::InvalidArgument);
        }

        validate_stream(root, &transfer)?;

        root.pending
            .try_reserve(1)
            .map_err(|_| UsbError::ResourceExhausted)?;

        transfer.actual = 0;
        transfer.status = Status::InProgress;
        let handle = transfer.handle;

        usb_trace!("submit {}", transfer.describe(speed).as_str());

        root.udev = true;
        root.pending.push_back(PendingTransfer {
            transfer,
            unlinked: None,
            new_control,
        });

        // kick the scheduler, it'll do the rest
        root.timer.kick(now);

        Ok(handle)
    }

    /// Marks a pending transfer for cancellation. It is given back with `reason` on the next
    /// pass, without touching the device side.
    pub fn cancel_transfer(&self, handle: TransferHandle, reason: UsbError) -> Result<()> {
        let mut st = self.shared.lock();
        let now = self.shared.now();

        let root = st.root_mut(self.hub).ok_or(UsbError::NotFound)?;
        let pending = root
            .pending
            .iter_mut()
            .find(|p| p.transfer.handle == handle)
            .ok_or(UsbError::NotFound)?;

        if pending.unlinked.is_some() {
            return Err(UsbError::NotFound);
        }

        usb_debug!("cancel urb {} with {:?}", handle.id(), reason);
        pending.unlinked = Some(reason);

        // a stopped root hub never runs its frame timer on its own
        if root.rh_state != RhState::Running {
            root.timer.arm(now);
        }

        Ok(())
    }

    /// Handles a hub class request on this root hub, writing the data stage into `buf`.
    pub fn hub_control(&self, setup: &SetupPacket, buf: &mut [u8]) -> Result<usize> {
        hub::hub_control(&self.shared, self.hub, setup, buf)
    }

    /// Port change bitmap, `None` when nothing changed.
    pub fn hub_status_data(&self) -> Result<Option<u8>> {
        hub::hub_status_data(&self.shared, self.hub)
    }

    pub fn bus_suspend(&self) -> Result<()> {
        hub::bus_suspend(&self.shared, self.hub)
    }

    pub fn bus_resume(&self) -> Result<()> {
        hub::bus_resume(&self.shared, self.hub)
    }

    /// Power-manages the host controller. The root hub must be suspended first.
    pub fn suspend_controller(&self) -> Result<()> {
        let mut st = self.shared.lock();
        let root = st.root_mut(self.hub).ok_or(UsbError::NotFound)?;

        if root.rh_state == RhState::Running {
            usb_warn!("root hub isn't suspended");
            return Err(UsbError::Busy);
        }

        root.hw_accessible = false;
        Ok(())
    }

    pub fn resume_controller(&self) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.lock();

        st.root_mut(self.hub).ok_or(UsbError::NotFound)?.hw_accessible = true;
        drop(hub::poll_status(shared, st, self.hub));

        Ok(())
    }

    /// Enables bulk streams on `endpoints`. Returns the number of streams granted, which is
    /// capped by the smallest endpoint limit.
    pub fn alloc_streams(&self, endpoints: &[EndpointDescriptor], num_streams: u16) -> Result<u16> {
        if endpoints.is_empty() || num_streams == 0 {
            return Err(UsbError::InvalidArgument);
        }

        let mut st = self.shared.lock();
        let root = st.root_mut(self.hub).ok_or(UsbError::NotFound)?;
        let mut granted = num_streams.min(MAX_STREAMS);

        for desc in endpoints {
            let bit = 1u32 << desc.address.index();
            if root.stream_en_ep & bit != 0 || desc.ep_type != EndpointType::Bulk {
                return Err(UsbError::InvalidArgument);
            }
            if desc.max_streams == 0 {
                return Err(UsbError::InvalidArgument);
            }
            if desc.max_streams < granted {
                usb_debug!(
                    "ep {:02x} only supports {} stream ids",
                    u8::from(desc.address),
                    desc.max_streams
                );
                granted = desc.max_streams;
            }
        }

        for desc in endpoints {
            let index = desc.address.index();
            root.stream_en_ep |= 1 << index;
            root.num_stream[index] = granted;
        }

        Ok(granted)
    }

    /// Disables streams on `endpoints`. Fails without changing anything if any of them has no
    /// streams.
    pub fn free_streams(&self, endpoints: &[EndpointDescriptor]) -> Result<()> {
        let mut st = self.shared.lock();
        let root = st.root_mut(self.hub).ok_or(UsbError::NotFound)?;

        if endpoints
            .iter()
            .any(|desc| root.stream_en_ep & (1 << desc.address.index()) == 0)
        {
            return Err(UsbError::InvalidArgument);
        }

        for desc in endpoints {
            let index = desc.address.index();
            root.stream_en_ep &= !(1 << index);
            root.num_stream[index] = 0;
        }

        Ok(())
    }

    /// Current 11-bit frame number.
    pub fn get_frame_number(&self) -> u16 {
        self.shared.clock.frame_number()
    }

    /// One line per in-flight transfer, in submission order.
    pub fn pending_transfers(&self) -> Vec<String> {
        let st = self.shared.lock();
        let speed = hub::listing_speed(&st, self.hub);

        st.root(self.hub).map_or_else(Vec::new, |root| {
            root.pending
                .iter()
                .map(|p| p.transfer.describe(speed))
                .collect()
        })
    }

    /// Raw port status word: status bits in the low half, change bits in the high half.
    pub fn port_status(&self) -> u32 {
        self.shared
            .lock()
            .root(self.hub)
            .map_or(0, |root| root.port_status)
    }

    pub fn rh_state(&self) -> RhState {
        self.shared
            .lock()
            .root(self.hub)
            .map_or(RhState::Reset, |root| root.rh_state)
    }

    /// Runs a due root hub status poll and a due frame pass. Returns true if either ran.
    pub fn poll(&self) -> bool {
        let now = self.shared.now();

        let (status_due, frame_due) = {
            let mut st = self.shared.lock();
            match st.root_mut(self.hub) {
                Some(root) => (
                    root.timer.take_status_poll(now),
                    root.timer.take_due(now),
                ),
                None => return false,
            }
        };

        if status_due {
            if let Ok(Some(_)) = self.hub_status_data() {
                let st = self.shared.lock();
                drop(hub::poll_status(&self.shared, st, self.hub));
            }
        }

        if frame_due {
            engine::run_pass(&self.shared, self.hub);
        }

        status_due || frame_due
    }

    /// Runs one frame pass now, whether or not the frame timer is due.
    pub fn run_frame(&self) {
        if let Some(root) = self.shared.lock().root_mut(self.hub) {
            root.timer.cancel();
        }
        engine::run_pass(&self.shared, self.hub);
    }
}
