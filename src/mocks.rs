//! Shared test doubles
//!
//! [`FakeDwc2`] is a scripted software model of the DWC2 host block:
//! it backs every register the driver touches, "executes" one queued
//! [`Outcome`] each time a channel is enabled (latching HCINT/HCTSIZ
//! the way the hardware does), and raises an interrupt line that a
//! test-owned interrupt thread forwards to `Dwc2::handle_interrupt`.
//! All the end-to-end scenarios run against it.

use crate::host::Dwc2;
use crate::regs::{
    self, ChannelInterrupts, Characteristics, CoreInterrupts, HostPort, Mmio, PacketId,
    PortSpeed, SplitControl, TransferSize,
};
use crate::request::{BusInterface, DmaAllocator, DmaBuffer, Error};
use crate::wire::{Direction, UsbSpeed};
use mockall::mock;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

mock! {
    pub BusInterface {}

    impl BusInterface for BusInterface {
        fn add_device(&self, device_id: u32, hub_address: u32, speed: UsbSpeed);
    }
}

/// The bus-address space the fake DMA engine reads and writes.
#[derive(Default)]
pub(crate) struct DmaSpace {
    regions: Mutex<Vec<Region>>,
}

struct Region {
    base: u32,
    data: Arc<Mutex<Vec<u8>>>,
}

impl DmaSpace {
    fn insert(&self, base: u32, data: Arc<Mutex<Vec<u8>>>) {
        self.regions.lock().unwrap().push(Region { base, data });
    }

    fn region(&self, phys: u32) -> Option<(Arc<Mutex<Vec<u8>>>, usize)> {
        let regions = self.regions.lock().unwrap();
        for region in regions.iter() {
            let len = region.data.lock().unwrap().len() as u32;
            if phys >= region.base && phys < region.base + len {
                return Some((region.data.clone(), (phys - region.base) as usize));
            }
        }
        None
    }

    pub fn read(&self, phys: u32, len: usize) -> Vec<u8> {
        let (data, offset) = self.region(phys).expect("DMA read outside any buffer");
        let data = data.lock().unwrap();
        data[offset..offset + len].to_vec()
    }

    pub fn write(&self, phys: u32, bytes: &[u8]) {
        let (data, offset) = self.region(phys).expect("DMA write outside any buffer");
        let mut data = data.lock().unwrap();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

pub(crate) struct FakeDmaBuffer {
    base: u32,
    data: Arc<Mutex<Vec<u8>>>,
}

impl DmaBuffer for FakeDmaBuffer {
    fn phys(&self) -> u32 {
        self.base
    }

    fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn read(&self, offset: usize, out: &mut [u8]) {
        let data = self.data.lock().unwrap();
        out.copy_from_slice(&data[offset..offset + out.len()]);
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock().unwrap();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn cache_flush(&mut self, _offset: usize, _len: usize) {}

    fn cache_flush_invalidate(&mut self, _offset: usize, _len: usize) {}
}

pub(crate) struct FakeDmaAllocator {
    space: Arc<DmaSpace>,
    next_phys: Mutex<u32>,
}

impl FakeDmaAllocator {
    pub fn new(space: Arc<DmaSpace>) -> Self {
        Self {
            space,
            next_phys: Mutex::new(0x1000),
        }
    }
}

impl DmaAllocator for FakeDmaAllocator {
    fn alloc(&self, len: usize) -> Result<Box<dyn DmaBuffer>, Error> {
        let base = {
            let mut next = self.next_phys.lock().unwrap();
            let base = *next;
            *next += ((len as u32).max(4) + 63) & !63;
            base
        };
        let data = Arc::new(Mutex::new(vec![0u8; len]));
        self.space.insert(base, data.clone());
        Ok(Box::new(FakeDmaBuffer { base, data }))
    }
}

/// What the "device" does with the next transaction.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    /// Move `bytes` in `packets` packets and halt with
    /// transfer-complete; for IN transactions `data` is deposited at
    /// the channel's DMA address first.
    Ack {
        bytes: u32,
        packets: u32,
        data: Option<Vec<u8>>,
    },
    /// A start-split was accepted: ACK, nothing moved.
    StartSplitAck,
    Nak,
    Nyet,
    Stall,
    FrameOverrun,
    TransactionError,
}

impl Outcome {
    pub fn ack(bytes: u32, packets: u32) -> Self {
        Outcome::Ack {
            bytes,
            packets,
            data: None,
        }
    }

    pub fn ack_with(data: &[u8]) -> Self {
        Outcome::Ack {
            bytes: data.len() as u32,
            packets: 1,
            data: Some(data.to_vec()),
        }
    }
}

/// One channel programming as observed at enable time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Programming {
    pub channel: usize,
    pub characteristics: Characteristics,
    pub split: SplitControl,
    pub transfer: TransferSize,
    pub dma: u32,
    /// Captured SETUP packet bytes, for SETUP-pid OUT transactions.
    pub setup: Option<[u8; 8]>,
}

#[derive(Default, Clone, Copy)]
struct FakeChannel {
    hcchar: u32,
    hcsplt: u32,
    hcint: u32,
    hcintmsk: u32,
    hctsiz: u32,
    hcdma: u32,
}

#[derive(Default)]
struct FakeState {
    gintsts: u32,
    gintmsk: u32,
    hfnum: u32,
    haint: u32,
    haintmsk: u32,
    hprt: u32,
    channels: [FakeChannel; 8],
    script: VecDeque<Outcome>,
    programmings: Vec<Programming>,
    hprt_writes: Vec<u32>,
    irq_pending: bool,
}

pub(crate) struct FakeDwc2 {
    state: Mutex<FakeState>,
    irq: Condvar,
    space: Arc<DmaSpace>,
}

// HPRT write-1-to-clear bits: connect/enable/overcurrent changed, and
// the enable bit itself.
const HPRT_W1C: u32 = (1 << 1) | (1 << 2) | (1 << 3) | (1 << 5);
// HPRT plain read-write bits: suspend, reset, power.
const HPRT_RW: u32 = (1 << 7) | (1 << 8) | (1 << 12);
const HPRT_CHANGE: u32 = (1 << 1) | (1 << 3) | (1 << 5);

impl FakeDwc2 {
    pub fn new(space: Arc<DmaSpace>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            irq: Condvar::new(),
            space,
        })
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state.lock().unwrap().script.extend(outcomes);
    }

    pub fn programmings(&self) -> Vec<Programming> {
        self.state.lock().unwrap().programmings.clone()
    }

    pub fn hprt_writes(&self) -> Vec<u32> {
        self.state.lock().unwrap().hprt_writes.clone()
    }

    /// A device appears on the port.
    pub fn connect_device(&self, speed: PortSpeed) {
        let mut state = self.state.lock().unwrap();
        state.hprt |= 1 | (1 << 1); // connected + connected changed
        state.hprt = (state.hprt & !(3 << 17)) | ((speed as u32) << 17);
        state.irq_pending = true;
        self.irq.notify_all();
    }

    /// A start-of-frame interrupt at the given frame number.
    pub fn raise_sof(&self, frame: u32) {
        let mut state = self.state.lock().unwrap();
        state.hfnum = frame;
        state.gintsts |= CoreInterrupts::SOF.bits();
        state.irq_pending = true;
        self.irq.notify_all();
    }

    /// Block until the interrupt line is raised, then consume it.
    pub fn wait_irq(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.irq_pending {
            state = self.irq.wait(state).unwrap();
        }
        state.irq_pending = false;
    }

    fn read_reg(&self, offset: usize) -> u32 {
        let state = self.state.lock().unwrap();
        match offset {
            regs::GINTSTS => {
                let mut value = state.gintsts;
                if state.haint != 0 {
                    value |= CoreInterrupts::HOST_CHANNELS.bits();
                }
                if state.hprt & HPRT_CHANGE != 0 {
                    value |= CoreInterrupts::PORT.bits();
                }
                value
            }
            regs::GINTMSK => state.gintmsk,
            regs::HFNUM => state.hfnum,
            regs::HAINT => state.haint,
            regs::HAINTMSK => state.haintmsk,
            regs::HPRT => state.hprt,
            _ => {
                let (channel, reg) = channel_offset(offset);
                let chan = &state.channels[channel];
                match reg {
                    regs::HCCHAR => chan.hcchar,
                    regs::HCSPLT => chan.hcsplt,
                    regs::HCINT => chan.hcint,
                    regs::HCINTMSK => chan.hcintmsk,
                    regs::HCTSIZ => chan.hctsiz,
                    regs::HCDMA => chan.hcdma,
                    _ => 0,
                }
            }
        }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        let mut state = self.state.lock().unwrap();
        match offset {
            regs::GINTSTS => state.gintsts &= !value, // W1C
            regs::GINTMSK => state.gintmsk = value,
            regs::HAINTMSK => state.haintmsk = value,
            regs::HPRT => self.write_hprt(&mut state, value),
            _ => {
                let (channel, reg) = channel_offset(offset);
                match reg {
                    regs::HCCHAR => {
                        state.channels[channel].hcchar = value;
                        if Characteristics(value).channel_enable() {
                            self.execute(&mut state, channel);
                        }
                    }
                    regs::HCSPLT => state.channels[channel].hcsplt = value,
                    regs::HCINT => {
                        state.channels[channel].hcint &= !value; // W1C
                        if state.channels[channel].hcint == 0 {
                            state.haint &= !(1 << channel);
                        }
                    }
                    regs::HCINTMSK => state.channels[channel].hcintmsk = value,
                    regs::HCTSIZ => state.channels[channel].hctsiz = value,
                    regs::HCDMA => state.channels[channel].hcdma = value,
                    _ => {}
                }
            }
        }
    }

    fn write_hprt(&self, state: &mut FakeState, value: u32) {
        state.hprt_writes.push(value);

        let old = HostPort(state.hprt);
        let new = HostPort(value);

        state.hprt &= !(value & HPRT_W1C);
        state.hprt = (state.hprt & !HPRT_RW) | (value & HPRT_RW);

        // Completing a reset enables the port and reports the change.
        if old.reset() && !new.reset() && HostPort(state.hprt).connected() {
            state.hprt |= (1 << 2) | (1 << 3); // enabled + enabled changed
            state.irq_pending = true;
            self.irq.notify_all();
        }
    }

    /// Run one transaction on a just-enabled channel.
    fn execute(&self, state: &mut FakeState, channel: usize) {
        let chan = state.channels[channel];
        let characteristics = Characteristics(chan.hcchar);
        let mut transfer = TransferSize(chan.hctsiz);

        let setup = if transfer.packet_id() == PacketId::Setup
            && characteristics.endpoint_direction() == Direction::Out
        {
            let bytes = self.space.read(chan.hcdma, 8);
            let mut setup = [0u8; 8];
            setup.copy_from_slice(&bytes);
            Some(setup)
        } else {
            None
        };

        state.programmings.push(Programming {
            channel,
            characteristics,
            split: SplitControl(chan.hcsplt),
            transfer,
            dma: chan.hcdma,
            setup,
        });

        let outcome = state
            .script
            .pop_front()
            .expect("transaction script exhausted");

        let mut hcint = ChannelInterrupts::CHANNEL_HALTED;
        match outcome {
            Outcome::Ack {
                bytes,
                packets,
                data,
            } => {
                if let Some(data) = data {
                    self.space.write(chan.hcdma, &data);
                }
                let pid = advance_pid(transfer.packet_id(), packets);
                transfer.set_size(transfer.size() - bytes);
                transfer.set_packet_count(transfer.packet_count() - packets);
                transfer.set_packet_id(pid);
                hcint |= ChannelInterrupts::TRANSFER_COMPLETED | ChannelInterrupts::ACK;
            }
            Outcome::StartSplitAck => hcint |= ChannelInterrupts::ACK,
            Outcome::Nak => hcint |= ChannelInterrupts::NAK,
            Outcome::Nyet => hcint |= ChannelInterrupts::NYET,
            Outcome::Stall => hcint |= ChannelInterrupts::STALL,
            Outcome::FrameOverrun => hcint |= ChannelInterrupts::FRAME_OVERRUN,
            Outcome::TransactionError => hcint |= ChannelInterrupts::TRANSACTION_ERROR,
        }

        let mut disabled = characteristics;
        disabled.set_channel_enable(false);

        let chan = &mut state.channels[channel];
        chan.hcchar = disabled.0;
        chan.hctsiz = transfer.0;
        chan.hcint = hcint.bits();
        state.haint |= 1 << channel;
        state.irq_pending = true;
        self.irq.notify_all();
    }
}

fn channel_offset(offset: usize) -> (usize, usize) {
    assert!(
        (regs::HOST_CHANNEL_BASE..regs::channel_base(8)).contains(&offset),
        "unmodelled register {:#x}",
        offset
    );
    (
        (offset - regs::HOST_CHANNEL_BASE) / regs::HOST_CHANNEL_STRIDE,
        (offset - regs::HOST_CHANNEL_BASE) % regs::HOST_CHANNEL_STRIDE,
    )
}

/// The toggle the controller would report after `packets` packets.
fn advance_pid(pid: PacketId, packets: u32) -> PacketId {
    match pid {
        PacketId::Setup => PacketId::Data1,
        PacketId::Data2 => PacketId::Data2,
        PacketId::Data0 | PacketId::Data1 => {
            if packets % 2 == 1 {
                if pid == PacketId::Data0 {
                    PacketId::Data1
                } else {
                    PacketId::Data0
                }
            } else {
                pid
            }
        }
    }
}

impl Mmio for Arc<FakeDwc2> {
    fn read32(&self, offset: usize) -> u32 {
        self.read_reg(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write_reg(offset, value)
    }
}

/// A driver wired to a fake controller, fake DMA, and a live interrupt
/// thread.
pub(crate) struct Fixture {
    pub fake: Arc<FakeDwc2>,
    pub dwc: Arc<Dwc2<Arc<FakeDwc2>>>,
    pub dma: Arc<FakeDmaAllocator>,
}

pub(crate) fn fixture() -> Fixture {
    let space = Arc::new(DmaSpace::default());
    let dma = Arc::new(FakeDmaAllocator::new(space.clone()));
    let fake = FakeDwc2::new(space);
    let dwc = Dwc2::new(fake.clone(), dma.clone() as Arc<dyn DmaAllocator>);

    {
        let fake = fake.clone();
        let dwc = dwc.clone();
        std::thread::spawn(move || loop {
            fake.wait_irq();
            dwc.handle_interrupt();
        });
    }

    Fixture { fake, dwc, dma }
}
