//! The transfer-request boundary with the upstream bus
//!
//! [`UsbRequest`] is what upstream submits; [`Transfer`] is the
//! envelope it travels in once inside the driver.  Envelopes are
//! recycled through a bounded [`RequestCache`] so that a busy endpoint
//! does not churn the allocator.
//!
//! The driver's external collaborators are traits here too: the DMA
//! allocator ([`DmaAllocator`]/[`DmaBuffer`]) and the upstream bus
//! ([`BusInterface`]).

use crate::regs::PacketId;
use crate::wire::{SetupPacket, UsbSpeed};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

// This is how many free transfer envelopes we'll hang onto in our free
// request cache.
const FREE_REQ_CACHE_THRESHOLD: usize = 1024;

/// Errors carried by upstream completions and fallible driver calls.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bus-level failure: stall, AHB or transaction error, babble,
    /// toggle mismatch, or a malformed channel halt.
    Io,
    /// The free-request cache was empty and allocation failed, or a
    /// resource (device address, DMA memory) ran out.
    NoMemory,
    /// The request was malformed: over-long transfer, unknown device
    /// or endpoint, control request without a setup packet.
    InvalidArgs,
    /// The operation is not implemented by this driver.
    NotSupported,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Error::Io => "I/O error",
            Error::NoMemory => "out of memory",
            Error::InvalidArgs => "invalid argument",
            Error::NotSupported => "not supported",
        };
        f.write_str(s)
    }
}

/// A DMA-capable buffer obtained from the platform's [`DmaAllocator`].
///
/// The controller's channels read and write it by bus address, so the
/// holder is responsible for the cache maintenance calls around DMA.
pub trait DmaBuffer: Send {
    /// Bus address of the start of the buffer, as seen by the
    /// controller's DMA engine.
    fn phys(&self) -> u32;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out of the buffer.
    fn read(&self, offset: usize, out: &mut [u8]);

    /// Copy into the buffer.
    fn write(&mut self, offset: usize, data: &[u8]);

    /// Write back any dirty cache lines over the given range.
    fn cache_flush(&mut self, offset: usize, len: usize);

    /// Write back and invalidate cache lines over the given range.
    fn cache_flush_invalidate(&mut self, offset: usize, len: usize);
}

/// The platform's DMA allocator (the physmap collaborator).
pub trait DmaAllocator: Send + Sync {
    fn alloc(&self, len: usize) -> Result<Box<dyn DmaBuffer>, Error>;
}

/// Upcalls into the upstream bus.
pub trait BusInterface: Send + Sync {
    fn add_device(&self, device_id: u32, hub_address: u32, speed: UsbSpeed);
}

/// Completion callback: receives the request back together with
/// `Ok(actual_length)` or the failure.
pub type CompletionCallback = Box<dyn FnOnce(UsbRequest, Result<usize, Error>) + Send>;

/// A transfer request as submitted by the upstream bus.
pub struct UsbRequest {
    /// Target device address (or `ROOT_HUB_DEVICE_ID`).
    pub device_id: u32,
    /// Target endpoint address, including the direction bit.
    pub ep_address: u8,
    /// Transfer length in bytes; never more than
    /// [`MAX_TRANSFER_SIZE`](crate::host::MAX_TRANSFER_SIZE).
    pub length: usize,
    /// The SETUP packet, for control transfers.
    pub setup: Option<SetupPacket>,
    /// Terminate an exact-multiple OUT transfer with a zero-length
    /// packet.
    pub send_zlp: bool,
    /// Payload area; DMA runs over this.
    pub buffer: Box<dyn DmaBuffer>,
    callback: Option<CompletionCallback>,
}

impl UsbRequest {
    pub fn new(
        device_id: u32,
        ep_address: u8,
        length: usize,
        buffer: Box<dyn DmaBuffer>,
        callback: CompletionCallback,
    ) -> Self {
        Self {
            device_id,
            ep_address,
            length,
            setup: None,
            send_zlp: false,
            buffer,
            callback: Some(callback),
        }
    }

    /// A control request to endpoint zero; the length comes from the
    /// setup packet's `wLength`.
    pub fn control(
        device_id: u32,
        setup: SetupPacket,
        buffer: Box<dyn DmaBuffer>,
        callback: CompletionCallback,
    ) -> Self {
        Self {
            device_id,
            ep_address: 0,
            length: setup.wLength as usize,
            setup: Some(setup),
            send_zlp: false,
            buffer,
            callback: Some(callback),
        }
    }

    pub(crate) fn complete(mut self, status: Result<usize, Error>) {
        if let Some(callback) = self.callback.take() {
            callback(self, status);
        }
    }
}

/// Control transfer phase; phases advance strictly SETUP → DATA →
/// STATUS (DATA may be skipped).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ControlPhase {
    Setup,
    Data,
    Status,
}

impl ControlPhase {
    pub fn advance(&mut self) {
        *self = match self {
            ControlPhase::Setup => ControlPhase::Data,
            _ => ControlPhase::Status,
        };
    }
}

/// The envelope a [`UsbRequest`] travels in inside the driver.
///
/// At any instant an envelope is owned by exactly one of: an
/// endpoint's pending queue, the scheduler driving a channel, the root
/// hub's queue or interrupt slot.  Only the owning scheduler mutates
/// it.
pub(crate) struct Transfer {
    usb_req: Option<UsbRequest>,
    pub request_id: u32,
    pub ctrl_phase: ControlPhase,
    pub complete_split: bool,
    pub csplit_retries: u8,
    pub short_attempt: bool,
    pub next_data_toggle: PacketId,
    pub bytes_queued: u32,
    pub total_bytes_queued: u32,
    pub packets_queued: u32,
    pub bytes_transferred: u32,
    pub setup_buf: Option<Box<dyn DmaBuffer>>,
}

impl Transfer {
    fn reset(&mut self, usb_req: UsbRequest, request_id: u32) {
        self.usb_req = Some(usb_req);
        self.request_id = request_id;
        self.ctrl_phase = ControlPhase::Setup;
        self.complete_split = false;
        self.csplit_retries = 0;
        self.short_attempt = false;
        self.next_data_toggle = PacketId::Data0;
        self.bytes_queued = 0;
        self.total_bytes_queued = 0;
        self.packets_queued = 0;
        self.bytes_transferred = 0;
        self.setup_buf = None;
    }

    pub fn req(&self) -> &UsbRequest {
        self.usb_req.as_ref().expect("transfer without a request")
    }

    pub fn req_mut(&mut self) -> &mut UsbRequest {
        self.usb_req.as_mut().expect("transfer without a request")
    }
}

/// Bounded free-list of transfer envelopes.
pub(crate) struct RequestCache {
    free: Mutex<Vec<Box<Transfer>>>,
    next_request_id: AtomicU32,
}

impl RequestCache {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            next_request_id: AtomicU32::new(0),
        }
    }

    /// Wrap an incoming request in an envelope, reusing a cached one
    /// when possible.
    pub fn get(&self, usb_req: UsbRequest) -> Box<Transfer> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let recycled = self.free.lock().unwrap().pop();
        let mut transfer = recycled.unwrap_or_else(|| {
            Box::new(Transfer {
                usb_req: None,
                request_id: 0,
                ctrl_phase: ControlPhase::Setup,
                complete_split: false,
                csplit_retries: 0,
                short_attempt: false,
                next_data_toggle: PacketId::Data0,
                bytes_queued: 0,
                total_bytes_queued: 0,
                packets_queued: 0,
                bytes_transferred: 0,
                setup_buf: None,
            })
        });
        transfer.reset(usb_req, request_id);
        transfer
    }

    /// Complete the wrapped request and recycle the envelope.  The
    /// free list is capped; envelopes beyond the cap are dropped.
    pub fn complete(&self, mut transfer: Box<Transfer>, status: Result<usize, Error>) {
        transfer.setup_buf = None;

        log::trace!(
            "complete request id = {}, status = {:?}",
            transfer.request_id,
            status
        );

        if let Some(mut usb_req) = transfer.usb_req.take() {
            // The DMA engine may have moved data underneath the CPU's
            // caches.
            if let Ok(length) = status {
                let length = length.min(usb_req.buffer.len());
                usb_req.buffer.cache_flush_invalidate(0, length);
            }
            usb_req.complete(status);
        }

        let mut free = self.free.lock().unwrap();
        if free.len() < FREE_REQ_CACHE_THRESHOLD {
            free.push(transfer);
        }
    }

    #[cfg(test)]
    pub fn free_len(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
#[path = "tests/request.rs"]
mod tests;
