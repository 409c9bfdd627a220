//! Device-side requests and the per-endpoint request queue.

use crate::endpoint::EndpointId;
use crate::gadget::Gadget;
use crate::link::{Guard, Shared};
use crate::{Result, Status, UsbError};
use core::fmt;
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Size of the single-buffered IN FIFO. Small IN requests that find the FIFO free complete as
/// soon as they are copied into it.
pub const FIFO_SIZE: usize = 64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Opaque identity of a queued request, used to dequeue it.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestHandle(u64);

type Completion = Box<dyn FnOnce(&Gadget, Request) + Send>;

/// One device-side buffer submission.
///
/// For IN endpoints `buf` holds the data to send; for OUT endpoints it is the space to receive
/// into. Either way the requested length is `buf.len()`. Ownership of the request moves into the
/// endpoint queue on [`Gadget::queue`] and comes back through the completion callback.
pub struct Request {
    /// Data buffer.
    pub buf: Vec<u8>,
    /// Bytes transferred so far. Never exceeds `buf.len()`.
    pub actual: usize,
    /// Completion status.
    pub status: Status,
    /// Stream the request belongs to, on endpoints with streams enabled.
    pub stream_id: u16,
    /// Terminate an IN transfer that ends on a packet boundary with a zero-length packet.
    pub zero: bool,
    /// Treat a short OUT packet as an error.
    pub short_not_ok: bool,
    handle: RequestHandle,
    fifo: bool,
    complete: Option<Completion>,
}

impl Request {
    /// Creates a request around `buf`.
    pub fn new(buf: Vec<u8>) -> Self {
        Request {
            buf,
            actual: 0,
            status: Status::InProgress,
            stream_id: 0,
            zero: false,
            short_not_ok: false,
            handle: RequestHandle(next_id()),
            fifo: false,
            complete: None,
        }
    }

    /// Creates a request with a zeroed buffer of `length` bytes.
    pub fn with_length(length: usize) -> Self {
        Request::new(vec![0; length])
    }

    /// Sets the callback invoked when the request completes. The callback runs without the link
    /// lock held and may queue further requests.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Gadget, Request) + Send + 'static,
    {
        self.complete = Some(Box::new(f));
        self
    }

    /// Sets the stream id.
    pub fn stream(mut self, stream_id: u16) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// Requested length.
    pub fn length(&self) -> usize {
        self.buf.len()
    }

    /// The bytes transferred so far.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.actual]
    }

    fn fifo_copy(&self) -> Request {
        let mut fifo = Request::new(self.buf.clone());
        fifo.zero = self.zero;
        fifo.stream_id = self.stream_id;
        fifo.fifo = true;
        fifo
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("handle", &self.handle)
            .field("length", &self.buf.len())
            .field("actual", &self.actual)
            .field("status", &self.status)
            .field("stream_id", &self.stream_id)
            .field("zero", &self.zero)
            .finish()
    }
}

/// Completes a request that has already been taken off its queue. The lock is released around
/// the callback and reacquired before returning.
pub(crate) fn give_back<'a>(shared: &'a Arc<Shared>, mut st: Guard<'a>, mut req: Request) -> Guard<'a> {
    if req.fifo {
        st.udc.fifo_busy = false;
        return st;
    }

    match req.complete.take() {
        Some(complete) => {
            drop(st);
            complete(&Gadget::from_shared(shared), req);
            shared.lock()
        }
        None => st,
    }
}

/// Appends a request to an endpoint queue.
pub(crate) fn enqueue(shared: &Arc<Shared>, ep: EndpointId, mut req: Request) -> Result<RequestHandle> {
    let mut st = shared.lock();

    if !st.attached {
        return Err(UsbError::Shutdown);
    }

    let hub = st.device_hub();
    let port_enabled = st.root(hub).map_or(false, |root| root.is_enabled());
    let udc = &mut st.udc;
    let endpoint = udc.eps.get(ep.0).ok_or(UsbError::InvalidArgument)?;

    if (endpoint.desc.is_none() && ep != EndpointId::EP0)
        || udc.driver.is_none()
        || !port_enabled
    {
        return Err(UsbError::Shutdown);
    }

    if req.stream_id != 0 && !endpoint.stream_en {
        usb_warn!("{}: stream {} on an endpoint without streams", endpoint.name, req.stream_id);
        return Err(UsbError::InvalidArgument);
    }

    req.actual = 0;
    req.status = Status::InProgress;
    let handle = req.handle;

    usb_trace!("{}: queue req len {}", endpoint.name, req.buf.len());

    if endpoint.desc.is_some()
        && endpoint.is_in()
        && !udc.fifo_busy
        && endpoint.queue.is_empty()
        && req.buf.len() <= FIFO_SIZE
    {
        let fifo = req.fifo_copy();
        let endpoint = &mut udc.eps[ep.0];
        endpoint
            .queue
            .try_reserve(1)
            .map_err(|_| UsbError::ResourceExhausted)?;
        endpoint.queue.push_back(fifo);
        udc.fifo_busy = true;

        req.actual = req.buf.len();
        req.status = Status::Success;
        drop(give_back(shared, st, req));
        return Ok(handle);
    }

    let endpoint = &mut udc.eps[ep.0];
    endpoint
        .queue
        .try_reserve(1)
        .map_err(|_| UsbError::ResourceExhausted)?;
    endpoint.queue.push_back(req);

    Ok(handle)
}

/// Removes a still-queued request and completes it with [`UsbError::ConnectionReset`].
pub(crate) fn dequeue(shared: &Arc<Shared>, ep: EndpointId, handle: RequestHandle) -> Result<()> {
    let mut st = shared.lock();

    if !st.attached || st.udc.driver.is_none() {
        return Err(UsbError::Shutdown);
    }

    let endpoint = st.udc.eps.get_mut(ep.0).ok_or(UsbError::InvalidArgument)?;
    let position = endpoint
        .queue
        .iter()
        .position(|r| r.handle == handle)
        .ok_or(UsbError::NotFound)?;

    let mut req = match endpoint.queue.remove(position) {
        Some(req) => req,
        None => return Err(UsbError::NotFound),
    };

    usb_debug!("{}: dequeued req len {}/{}", endpoint.name, req.actual, req.buf.len());

    req.status = Status::Failed(UsbError::ConnectionReset);
    drop(give_back(shared, st, req));

    Ok(())
}

/// Fails every queued request on an endpoint with [`UsbError::Shutdown`].
pub(crate) fn nuke<'a>(shared: &'a Arc<Shared>, mut st: Guard<'a>, ep: usize) -> Guard<'a> {
    loop {
        let mut req = match st.udc.eps.get_mut(ep).and_then(|e| e.queue.pop_front()) {
            Some(req) => req,
            None => break,
        };

        req.status = Status::Failed(UsbError::Shutdown);
        st = give_back(shared, st, req);
    }

    st
}
