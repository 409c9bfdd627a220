//! Host-side transfers (URBs).

use crate::control::SetupPacket;
use crate::endpoint::{EndpointAddress, EndpointType};
use crate::hcd::Hcd;
use crate::request::next_id;
use crate::{Status, UsbDirection, UsbSpeed};
use core::fmt;

/// Identity of a submitted transfer, used to cancel it.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferHandle(u64);

impl TransferHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A logical channel to one endpoint of the device: number, direction and transfer type.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pipe {
    /// Endpoint number and direction.
    pub endpoint: EndpointAddress,
    /// Transfer type.
    pub ep_type: EndpointType,
}

impl Pipe {
    pub fn new(endpoint: u8, ep_type: EndpointType) -> Self {
        Pipe {
            endpoint: endpoint.into(),
            ep_type,
        }
    }

    /// The default control pipe in the given direction.
    pub fn control(direction: UsbDirection) -> Self {
        Pipe {
            endpoint: EndpointAddress::from_parts(0, direction),
            ep_type: EndpointType::Control,
        }
    }

    pub fn bulk_in(number: u8) -> Self {
        Pipe {
            endpoint: EndpointAddress::from_parts(number, UsbDirection::In),
            ep_type: EndpointType::Bulk,
        }
    }

    pub fn bulk_out(number: u8) -> Self {
        Pipe {
            endpoint: EndpointAddress::from_parts(number, UsbDirection::Out),
            ep_type: EndpointType::Bulk,
        }
    }

    pub fn interrupt_in(number: u8) -> Self {
        Pipe {
            endpoint: EndpointAddress::from_parts(number, UsbDirection::In),
            ep_type: EndpointType::Interrupt,
        }
    }

    pub fn interrupt_out(number: u8) -> Self {
        Pipe {
            endpoint: EndpointAddress::from_parts(number, UsbDirection::Out),
            ep_type: EndpointType::Interrupt,
        }
    }

    pub fn isochronous_in(number: u8) -> Self {
        Pipe {
            endpoint: EndpointAddress::from_parts(number, UsbDirection::In),
            ep_type: EndpointType::Isochronous,
        }
    }

    pub fn isochronous_out(number: u8) -> Self {
        Pipe {
            endpoint: EndpointAddress::from_parts(number, UsbDirection::Out),
            ep_type: EndpointType::Isochronous,
        }
    }

    /// True when data flows device to host.
    pub fn is_in(&self) -> bool {
        self.endpoint.is_in()
    }
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match (self.endpoint.number(), self.is_in()) {
            (0, _) => "",
            (_, true) => "in",
            (_, false) => "out",
        };
        write!(
            f,
            "ep{}{}{}",
            self.endpoint.number(),
            direction,
            self.ep_type.suffix()
        )
    }
}

/// Host memory of a transfer: one contiguous buffer or a scatter-gather list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferBuffer {
    Linear(Vec<u8>),
    ScatterGather(Vec<Vec<u8>>),
}

impl TransferBuffer {
    /// Total capacity in bytes.
    pub fn len(&self) -> usize {
        match self {
            TransferBuffer::Linear(buf) => buf.len(),
            TransferBuffer::ScatterGather(segments) => segments.iter().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes `src` at byte offset `offset`, crossing segment boundaries as needed. Returns the
    /// number of bytes written.
    pub(crate) fn write_at(&mut self, offset: usize, src: &[u8]) -> usize {
        match self {
            TransferBuffer::Linear(buf) => {
                let end = (offset + src.len()).min(buf.len());
                let n = end.saturating_sub(offset);
                if n > 0 {
                    buf[offset..offset + n].copy_from_slice(&src[..n]);
                }
                n
            }
            TransferBuffer::ScatterGather(segments) => {
                let mut skip = offset;
                let mut done = 0;

                for segment in segments.iter_mut() {
                    if done == src.len() {
                        break;
                    }
                    if skip >= segment.len() {
                        skip -= segment.len();
                        continue;
                    }

                    let n = (segment.len() - skip).min(src.len() - done);
                    segment[skip..skip + n].copy_from_slice(&src[done..done + n]);
                    done += n;
                    skip = 0;
                }

                done
            }
        }
    }

    /// Reads into `dst` from byte offset `offset`. Returns the number of bytes read.
    pub(crate) fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        match self {
            TransferBuffer::Linear(buf) => {
                let end = (offset + dst.len()).min(buf.len());
                let n = end.saturating_sub(offset);
                if n > 0 {
                    dst[..n].copy_from_slice(&buf[offset..offset + n]);
                }
                n
            }
            TransferBuffer::ScatterGather(segments) => {
                let mut skip = offset;
                let mut done = 0;

                for segment in segments {
                    if done == dst.len() {
                        break;
                    }
                    if skip >= segment.len() {
                        skip -= segment.len();
                        continue;
                    }

                    let n = (segment.len() - skip).min(dst.len() - done);
                    dst[done..done + n].copy_from_slice(&segment[skip..skip + n]);
                    done += n;
                    skip = 0;
                }

                done
            }
        }
    }

    /// Flattens the buffer into one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            TransferBuffer::Linear(buf) => buf.clone(),
            TransferBuffer::ScatterGather(segments) => segments.concat(),
        }
    }
}

type Completion = Box<dyn FnOnce(&Hcd, Transfer) + Send>;

/// One host-submitted unit of I/O work.
///
/// The requested length is the capacity of `buffer`. For IN pipes the buffer receives data, for
/// OUT pipes it holds the data to send. Control transfers carry their setup packet separately;
/// the buffer is the data stage.
pub struct Transfer {
    /// Target pipe.
    pub pipe: Pipe,
    /// Setup packet of a control transfer.
    pub setup: Option<SetupPacket>,
    /// Data buffer.
    pub buffer: TransferBuffer,
    /// Bytes transferred so far.
    pub actual: usize,
    /// Completion status.
    pub status: Status,
    /// Stream id for bulk endpoints with streams allocated. Zero otherwise.
    pub stream_id: u16,
    /// Send a zero-length packet when an OUT transfer ends on a packet boundary.
    pub zero_packet: bool,
    /// Treat a short IN transfer as an error.
    pub short_not_ok: bool,
    pub(crate) handle: TransferHandle,
    pub(crate) complete: Option<Completion>,
}

impl Transfer {
    /// Creates a transfer on `pipe` with a contiguous buffer.
    pub fn new(pipe: Pipe, buffer: Vec<u8>) -> Self {
        Transfer {
            pipe,
            setup: None,
            buffer: TransferBuffer::Linear(buffer),
            actual: 0,
            status: Status::InProgress,
            stream_id: 0,
            zero_packet: false,
            short_not_ok: false,
            handle: TransferHandle(next_id()),
            complete: None,
        }
    }

    /// Creates a transfer on `pipe` from scatter-gather segments.
    pub fn scatter_gather(pipe: Pipe, segments: Vec<Vec<u8>>) -> Self {
        let mut transfer = Transfer::new(pipe, Vec::new());
        transfer.buffer = TransferBuffer::ScatterGather(segments);
        transfer
    }

    /// Creates a control transfer on the default pipe. `data` is the data stage: the bytes to
    /// send for OUT requests, or space for `setup.length` bytes for IN requests.
    pub fn control(setup: SetupPacket, data: Vec<u8>) -> Self {
        let mut transfer = Transfer::new(Pipe::control(setup.direction), data);
        transfer.setup = Some(setup);
        transfer
    }

    /// Sets the callback invoked when the transfer completes. The callback runs without the link
    /// lock held and may submit or cancel other transfers.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Hcd, Transfer) + Send + 'static,
    {
        self.complete = Some(Box::new(f));
        self
    }

    /// Sets the stream id.
    pub fn stream(mut self, stream_id: u16) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn handle(&self) -> TransferHandle {
        self.handle
    }

    /// Requested length.
    pub fn length(&self) -> usize {
        self.buffer.len()
    }

    /// The bytes transferred so far, flattened.
    pub fn data(&self) -> Vec<u8> {
        let mut data = self.buffer.to_vec();
        data.truncate(self.actual);
        data
    }

    /// Line used by [`Hcd::pending_transfers`].
    pub(crate) fn describe(&self, speed: UsbSpeed) -> String {
        format!(
            "urb/{} {} {} len {}/{}",
            self.handle.0,
            speed.short_name(),
            self.pipe,
            self.actual,
            self.length()
        )
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("handle", &self.handle)
            .field("pipe", &self.pipe)
            .field("setup", &self.setup)
            .field("length", &self.length())
            .field("actual", &self.actual)
            .field("status", &self.status)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scatter_gather_crosses_segments() {
        let mut buf = TransferBuffer::ScatterGather(vec![vec![0; 3], vec![0; 2], vec![0; 4]]);
        assert_eq!(buf.write_at(2, &[1, 2, 3, 4]), 4);
        assert_eq!(buf.to_vec(), vec![0, 0, 1, 2, 3, 4, 0, 0, 0]);

        let mut out = [0u8; 5];
        assert_eq!(buf.read_at(1, &mut out), 5);
        assert_eq!(out, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn linear_copies_stop_at_capacity() {
        let mut buf = TransferBuffer::Linear(vec![0; 4]);
        assert_eq!(buf.write_at(2, &[9, 9, 9]), 2);
        assert_eq!(buf.to_vec(), vec![0, 0, 9, 9]);
    }

    #[test]
    fn listing_format() {
        let transfer = Transfer::new(Pipe::bulk_in(1), vec![0; 1024]);
        let line = transfer.describe(UsbSpeed::High);
        assert!(line.starts_with("urb/"));
        assert!(line.ends_with(" hs ep1in-bulk len 0/1024"));
    }
}
