//! The DWC2 host controller driver
//!
//! [`Dwc2`] owns the register window, the channel pool, the device
//! arena and the synthetic root hub, and exposes the host-controller
//! surface the upstream bus drives: queueing requests, enabling
//! endpoints, and the hub-driver notifications that trigger
//! enumeration.
//!
//! Threading: one worker per enabled endpoint (`scheduler` module), one
//! root-hub worker (`root_hub` module), and the platform's interrupt
//! thread calling [`Dwc2::handle_interrupt`].

use crate::bitset::BitSet;
use crate::channel::ChannelPool;
use crate::event::Event;
use crate::regs::{ChannelInterrupts, CoreInterrupts, Mmio, RegisterBlock};
use crate::request::{
    BusInterface, ControlPhase, DmaAllocator, DmaBuffer, Error, RequestCache, Transfer, UsbRequest,
};
use crate::root_hub::RootHub;
use crate::wire::{
    EndpointDescriptor, SetupPacket, UsbSpeed, DEVICE_DESCRIPTOR, DEVICE_TO_HOST,
    ENDPOINT_DESCRIPTOR, GET_DESCRIPTOR, HOST_TO_DEVICE, SET_ADDRESS,
};
use log::{error, info, trace};
use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

pub const NUM_HOST_CHANNELS: usize = 8;
pub const MAX_DEVICE_COUNT: usize = 128;

/// Device id the synthetic root hub answers to.  Kept at the top of
/// the id space: address 0 must stay routable to the hardware path,
/// because that is where un-enumerated devices live.
pub const ROOT_HUB_DEVICE_ID: u32 = (MAX_DEVICE_COUNT - 1) as u32;

/// Transfers are limited to a single page until scatter/gather support
/// is implemented.
pub const MAX_TRANSFER_SIZE: usize = 4096;

// USB 2.0 section 9.2.6.3: recovery interval after SET_ADDRESS.
const SET_ADDRESS_RECOVERY: Duration = Duration::from_millis(10);

/// One endpoint of one device.  A scheduler thread owns the traffic;
/// everyone else only appends to `pending`.
pub(crate) struct Endpoint {
    pub device_id: u32,
    pub ep_address: u8,
    /// The endpoint descriptor as enabled.  EP0's max packet size is
    /// rewritten during enumeration, hence the lock.
    pub descriptor: Mutex<EndpointDescriptor>,
    pub pending: Mutex<VecDeque<Box<Transfer>>>,
    /// Signalled whenever `pending` goes (or stays) non-empty; reset
    /// by the scheduler under the `pending` lock when it empties the
    /// queue.
    pub pending_event: Event,
}

impl Endpoint {
    pub fn new(device_id: u32, descriptor: EndpointDescriptor) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            ep_address: descriptor.bEndpointAddress,
            descriptor: Mutex::new(descriptor),
            pending: Mutex::new(VecDeque::new()),
            pending_event: Event::new(),
        })
    }

    pub fn transfer_type(&self) -> crate::wire::EndpointType {
        self.descriptor.lock().unwrap().transfer_type()
    }
}

/// Arena slot for one USB address.
pub(crate) struct DeviceState {
    pub speed: UsbSpeed,
    pub hub_address: u32,
    pub port: u32,
    pub endpoints: Vec<Arc<Endpoint>>,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            speed: UsbSpeed::High480,
            hub_address: 0,
            port: 0,
            endpoints: Vec::new(),
        }
    }
}

pub struct Dwc2<M: Mmio> {
    pub(crate) regs: RegisterBlock<M>,
    pub(crate) dma: Arc<dyn DmaAllocator>,
    pub(crate) bus: Mutex<Option<Arc<dyn BusInterface>>>,
    pub(crate) cache: RequestCache,
    pub(crate) channels: ChannelPool,
    /// Interrupt word latched by the dispatcher when channel `i`
    /// halts; consumed by the scheduler waiting on
    /// `channel_complete[i]`.
    pub(crate) channel_interrupts: [AtomicU32; NUM_HOST_CHANNELS],
    pub(crate) channel_complete: [Event; NUM_HOST_CHANNELS],
    /// Signalled (best effort) on each start-of-frame while the SOF
    /// interrupt is gated on; waiters tolerate spurious wakes.
    pub(crate) sof_waiters: [Event; NUM_HOST_CHANNELS],
    /// Waiter count; also serializes the GINTMSK read-modify-write.
    pub(crate) sof_gate: Mutex<usize>,
    pub(crate) devices: Vec<Mutex<DeviceState>>,
    pub(crate) root_hub: RootHub,
    pub(crate) frame_overruns: AtomicU32,
    next_device_address: Mutex<u32>,
    /// Back-reference handed to the worker threads this driver spawns.
    weak_self: Weak<Dwc2<M>>,
}

impl<M: Mmio + 'static> Dwc2<M> {
    /// Build the driver over a running controller and start its
    /// workers.  The controller is assumed reset, in host mode, with
    /// its interrupts routed to whoever will call
    /// [`handle_interrupt`](Self::handle_interrupt).
    pub fn new(mmio: M, dma: Arc<dyn DmaAllocator>) -> Arc<Self> {
        let dwc = Arc::new_cyclic(|weak| Self {
            regs: RegisterBlock::new(mmio),
            dma,
            bus: Mutex::new(None),
            cache: RequestCache::new(),
            channels: ChannelPool::new(NUM_HOST_CHANNELS as u8),
            channel_interrupts: std::array::from_fn(|_| AtomicU32::new(0)),
            channel_complete: std::array::from_fn(|_| Event::new()),
            sof_waiters: std::array::from_fn(|_| Event::new()),
            sof_gate: Mutex::new(0),
            devices: (0..MAX_DEVICE_COUNT)
                .map(|_| Mutex::new(DeviceState::new()))
                .collect(),
            root_hub: RootHub::new(),
            frame_overruns: AtomicU32::new(0),
            next_device_address: Mutex::new(1),
            weak_self: weak.clone(),
        });

        {
            let dwc2 = dwc.clone();
            thread::spawn(move || dwc2.root_hub_worker());
        }

        dwc.create_default_device();

        dwc
    }

    /// Create the device at address 0 (where every device appears
    /// until enumeration assigns it an address) with its control
    /// endpoint.
    fn create_default_device(&self) {
        let ep0 = Endpoint::new(0, control_endpoint_descriptor(8));
        {
            let mut device = self.devices[0].lock().unwrap();
            device.speed = UsbSpeed::High480;
            device.hub_address = 0;
            device.port = 0;
            device.endpoints.push(ep0.clone());
        }
        self.spawn_endpoint_scheduler(ep0);
    }

    pub(crate) fn spawn_endpoint_scheduler(&self, ep: Arc<Endpoint>) {
        let dwc = self.weak_self.upgrade().expect("driver dropped");
        thread::spawn(move || dwc.endpoint_scheduler(&ep));
    }

    // --- The host-controller surface ---------------------------------

    /// Queue a transfer.  Completion is reported through the request's
    /// callback, possibly before this returns.
    pub fn request_queue(&self, usb_req: UsbRequest) {
        if usb_req.length > MAX_TRANSFER_SIZE {
            usb_req.complete(Err(Error::InvalidArgs));
            return;
        }

        let transfer = self.cache.get(usb_req);
        if transfer.req().device_id == ROOT_HUB_DEVICE_ID {
            self.root_hub.queue(transfer);
        } else {
            self.queue_hardware_request(transfer);
        }
    }

    fn queue_hardware_request(&self, mut transfer: Box<Transfer>) {
        let device_id = transfer.req().device_id;
        let ep_address = transfer.req().ep_address;

        trace!(
            "queue usb req hw. dev_id = {}, ep = {:#04x}, req_id = {}, length = {:#x}",
            device_id,
            ep_address,
            transfer.request_id,
            transfer.req().length
        );

        let Some(ep) = self.find_endpoint(device_id, ep_address) else {
            self.cache.complete(transfer, Err(Error::InvalidArgs));
            return;
        };

        if ep_address == 0 {
            transfer.ctrl_phase = ControlPhase::Setup;
        }

        // Write back anything dirty over the payload; the DMA engine
        // must not race a cache eviction.
        let length = transfer.req().length;
        transfer.req_mut().buffer.cache_flush_invalidate(0, length);

        {
            let mut pending = ep.pending.lock().unwrap();
            pending.push_back(transfer);
        }
        ep.pending_event.signal();
    }

    fn find_endpoint(&self, device_id: u32, ep_address: u8) -> Option<Arc<Endpoint>> {
        if device_id as usize >= MAX_DEVICE_COUNT {
            return None;
        }
        let device = self.devices[device_id as usize].lock().unwrap();
        device
            .endpoints
            .iter()
            .find(|ep| ep.ep_address == ep_address)
            .cloned()
    }

    /// Install (or clear) the upstream bus.  Installing announces the
    /// root hub so the generic hub logic starts driving the port.
    pub fn set_bus_interface(&self, bus: Option<Arc<dyn BusInterface>>) {
        let announce = bus.clone();
        *self.bus.lock().unwrap() = bus;
        if let Some(bus) = announce {
            bus.add_device(ROOT_HUB_DEVICE_ID, 0, UsbSpeed::High480);
        }
    }

    pub fn get_max_device_count(&self) -> usize {
        MAX_DEVICE_COUNT
    }

    pub fn get_max_transfer_size(&self, _device_id: u32, _ep_address: u8) -> usize {
        MAX_TRANSFER_SIZE
    }

    /// The DMA binding collaborator, for upstream code that allocates
    /// request buffers.
    pub fn dma_allocator(&self) -> Arc<dyn DmaAllocator> {
        self.dma.clone()
    }

    /// Enable an endpoint: creates the endpoint and starts its
    /// scheduler thread.  Disabling is not supported.
    pub fn enable_endpoint(
        &self,
        device_id: u32,
        descriptor: &EndpointDescriptor,
        enable: bool,
    ) -> Result<(), Error> {
        trace!(
            "enable_endpoint. dev_id = {}, ep = {:#04x}",
            device_id,
            descriptor.bEndpointAddress
        );

        if device_id == ROOT_HUB_DEVICE_ID {
            // Nothing to be done for the root hub.
            return Ok(());
        }
        if !enable {
            return Err(Error::NotSupported);
        }
        if device_id as usize >= MAX_DEVICE_COUNT {
            return Err(Error::InvalidArgs);
        }

        let ep = Endpoint::new(device_id, *descriptor);
        self.devices[device_id as usize]
            .lock()
            .unwrap()
            .endpoints
            .push(ep.clone());
        self.spawn_endpoint_scheduler(ep);
        Ok(())
    }

    pub fn get_current_frame(&self) -> Result<u64, Error> {
        error!("get_current_frame not implemented");
        Err(Error::NotSupported)
    }

    pub fn configure_hub(
        &self,
        _device_id: u32,
        _speed: UsbSpeed,
        _descriptor: &crate::wire::HubDescriptor,
    ) -> Result<(), Error> {
        // The controller needs no per-hub setup.
        Ok(())
    }

    pub fn hub_device_removed(&self, _hub_address: u32, _port: u32) -> Result<(), Error> {
        error!("hub_device_removed not implemented");
        Ok(())
    }

    pub fn reset_endpoint(&self, _device_id: u32, _ep_address: u8) -> Result<(), Error> {
        Err(Error::NotSupported)
    }

    pub fn cancel_all(&self, _device_id: u32, _ep_address: u8) -> Result<(), Error> {
        Err(Error::NotSupported)
    }

    // --- Enumeration bootstrap ----------------------------------------

    /// A hub driver reports a new device on one of its ports.  The
    /// device is listening on address 0; read enough of its device
    /// descriptor to size EP0, assign it the next free address, then
    /// hand it to the upstream bus.
    pub fn hub_device_added(
        &self,
        hub_address: u32,
        port: u32,
        speed: UsbSpeed,
    ) -> Result<(), Error> {
        info!(
            "hub device added, hub = {}, port = {}, speed = {:?}",
            hub_address, port, speed
        );

        let ep0 = {
            let mut device = self.devices[0].lock().unwrap();
            device.hub_address = hub_address;
            device.port = port;
            device.speed = speed;
            device
                .endpoints
                .iter()
                .find(|ep| ep.ep_address == 0)
                .cloned()
        }
        .expect("default device has no endpoint 0");

        let address = *self.next_device_address.lock().unwrap();
        if address >= ROOT_HUB_DEVICE_ID {
            return Err(Error::NoMemory);
        }

        // Until the descriptor prefix tells us better, 8 bytes is the
        // only EP0 size every device is guaranteed to support.
        ep0.descriptor.lock().unwrap().wMaxPacketSize = 8u16.to_le_bytes();

        let buffer = self.dma.alloc(64)?;
        let (buffer, actual) = self.sync_control(
            0,
            SetupPacket {
                bmRequestType: DEVICE_TO_HOST,
                bRequest: GET_DESCRIPTOR,
                wValue: (DEVICE_DESCRIPTOR as u16) << 8,
                wIndex: 0,
                wLength: 8,
            },
            buffer,
        )?;
        if actual < 8 {
            return Err(Error::Io);
        }
        let mut prefix = [0u8; 8];
        buffer.read(0, &mut prefix);
        let max_packet_size0 = prefix[7];

        ep0.descriptor.lock().unwrap().wMaxPacketSize = (max_packet_size0 as u16).to_le_bytes();

        let (_buffer, _) = self.sync_control(
            0,
            SetupPacket {
                bmRequestType: HOST_TO_DEVICE,
                bRequest: SET_ADDRESS,
                wValue: address as u16,
                wIndex: 0,
                wLength: 0,
            },
            buffer,
        )?;

        thread::sleep(SET_ADDRESS_RECOVERY);

        let ctrl_ep = Endpoint::new(
            address,
            control_endpoint_descriptor(max_packet_size0 as u16),
        );
        {
            let mut device = self.devices[address as usize].lock().unwrap();
            device.speed = speed;
            device.hub_address = hub_address;
            device.port = port;
            device.endpoints.push(ctrl_ep.clone());
        }
        self.spawn_endpoint_scheduler(ctrl_ep);

        if let Some(bus) = self.bus.lock().unwrap().clone() {
            bus.add_device(address, hub_address, speed);
        }

        *self.next_device_address.lock().unwrap() += 1;
        Ok(())
    }

    /// Submit a control request through the public queue and block for
    /// its completion, handing the buffer back.
    fn sync_control(
        &self,
        device_id: u32,
        setup: SetupPacket,
        buffer: Box<dyn DmaBuffer>,
    ) -> Result<(Box<dyn DmaBuffer>, usize), Error> {
        type Slot = Mutex<Option<(UsbRequest, Result<usize, Error>)>>;
        let slot: Arc<(Slot, Condvar)> = Arc::new((Mutex::new(None), Condvar::new()));

        let completion = slot.clone();
        let usb_req = UsbRequest::control(
            device_id,
            setup,
            buffer,
            Box::new(move |usb_req, status| {
                *completion.0.lock().unwrap() = Some((usb_req, status));
                completion.1.notify_all();
            }),
        );

        self.request_queue(usb_req);

        let mut done = slot.0.lock().unwrap();
        while done.is_none() {
            done = slot.1.wait(done).unwrap();
        }
        let (usb_req, status) = done.take().expect("completion slot empty");
        let actual = status?;
        Ok((usb_req.buffer, actual))
    }

    // --- IRQ dispatcher (top half) ------------------------------------

    /// Called from the platform's interrupt thread whenever the
    /// controller raises its interrupt line.
    pub fn handle_interrupt(&self) {
        let interrupts = self.regs.gintsts();

        if interrupts.contains(CoreInterrupts::PORT) {
            self.handle_port_irq();
        }
        if interrupts.contains(CoreInterrupts::SOF) {
            self.regs.clear_gintsts(CoreInterrupts::SOF);
            self.handle_sof_irq();
        }
        if interrupts.contains(CoreInterrupts::HOST_CHANNELS) {
            self.handle_channel_irq();
        }
    }

    /// Wake periodic-transfer starts, but not in the last interesting
    /// microframe of a frame: a start queued that late would overrun.
    fn handle_sof_irq(&self) {
        if self.regs.frame_number() & 0x7 != 6 {
            for waiter in &self.sof_waiters {
                waiter.signal();
            }
        }
    }

    /// Latch each halted channel's interrupt word, quiesce the channel,
    /// and hand the event to whichever scheduler is waiting on it.
    fn handle_channel_irq(&self) {
        for channel in BitSet(self.regs.haint()).iter() {
            if channel as usize >= NUM_HOST_CHANNELS {
                break;
            }
            let chan = self.regs.channel(channel);
            self.channel_interrupts[channel as usize]
                .store(chan.interrupts().bits(), std::sync::atomic::Ordering::Release);

            chan.set_interrupt_mask(ChannelInterrupts::empty());
            chan.clear_interrupts(!0);

            self.channel_complete[channel as usize].signal();
        }
    }
}

pub(crate) fn control_endpoint_descriptor(max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        bLength: core::mem::size_of::<EndpointDescriptor>() as u8,
        bDescriptorType: ENDPOINT_DESCRIPTOR,
        bEndpointAddress: 0,
        bmAttributes: 0, // control
        wMaxPacketSize: max_packet_size.to_le_bytes(),
        bInterval: 0, // ignored for control endpoints
    }
}

#[cfg(test)]
#[path = "tests/host.rs"]
mod tests;
