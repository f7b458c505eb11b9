//! Typed MMIO view of the DWC2 host block
//!
//! Only the registers the host core actually touches are modelled: the
//! core interrupt status/mask pair, the frame counter, the host port
//! control/status register, the all-channels interrupt pair, and the
//! per-channel register block.
//!
//! Access goes through [`Mmio`], a 32-bit read/write seam.  The real
//! implementation ([`MmioPtr`]) wraps the mapped register base; tests
//! substitute a software model of the controller.

use crate::wire::Direction;
use bit_field::BitField;
use bitflags::bitflags;

/// 32-bit volatile access to the controller's register window.
///
/// Offsets are byte offsets from the start of the DWC2 register block.
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// [`Mmio`] over a mapped register base pointer.
pub struct MmioPtr {
    base: *mut u32,
}

impl MmioPtr {
    /// # Safety
    ///
    /// `base` must point at a mapped DWC2 register block that stays
    /// mapped for the lifetime of the value.
    pub unsafe fn new(base: *mut u32) -> Self {
        Self { base }
    }
}

// SAFETY: MMIO registers are safe to access from any thread; the
// driver serializes the accesses that need serializing.
unsafe impl Send for MmioPtr {}
// SAFETY: as above
unsafe impl Sync for MmioPtr {}

impl Mmio for MmioPtr {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: in-bounds by the contract of `new`
        unsafe { self.base.add(offset / 4).read_volatile() }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: in-bounds by the contract of `new`
        unsafe { self.base.add(offset / 4).write_volatile(value) }
    }
}

// Register offsets
pub const GINTSTS: usize = 0x014;
pub const GINTMSK: usize = 0x018;
pub const HFNUM: usize = 0x408;
pub const HAINT: usize = 0x414;
pub const HAINTMSK: usize = 0x418;
pub const HPRT: usize = 0x440;

// Per-channel block: HOST_CHANNEL_BASE + n * HOST_CHANNEL_STRIDE
pub const HOST_CHANNEL_BASE: usize = 0x500;
pub const HOST_CHANNEL_STRIDE: usize = 0x20;
pub const HCCHAR: usize = 0x00;
pub const HCSPLT: usize = 0x04;
pub const HCINT: usize = 0x08;
pub const HCINTMSK: usize = 0x0C;
pub const HCTSIZ: usize = 0x10;
pub const HCDMA: usize = 0x14;

pub const fn channel_base(channel: u8) -> usize {
    HOST_CHANNEL_BASE + channel as usize * HOST_CHANNEL_STRIDE
}

bitflags! {
    /// Core interrupt status/mask word (GINTSTS / GINTMSK)
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct CoreInterrupts: u32 {
        const SOF = 1 << 3;
        const PORT = 1 << 24;
        const HOST_CHANNELS = 1 << 25;

        const _ = !0;
    }
}

bitflags! {
    /// Per-channel interrupt word (HCINT / HCINTMSK)
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct ChannelInterrupts: u32 {
        const TRANSFER_COMPLETED = 1 << 0;
        const CHANNEL_HALTED = 1 << 1;
        const AHB_ERROR = 1 << 2;
        const STALL = 1 << 3;
        const NAK = 1 << 4;
        const ACK = 1 << 5;
        const NYET = 1 << 6;
        const TRANSACTION_ERROR = 1 << 7;
        const BABBLE_ERROR = 1 << 8;
        const FRAME_OVERRUN = 1 << 9;
        const DATA_TOGGLE_ERROR = 1 << 10;
        const BUFFER_NOT_AVAILABLE = 1 << 11;
        const EXCESS_TRANSACTION_ERROR = 1 << 12;
        const FRAME_LIST_ROLLOVER = 1 << 13;
    }
}

/// Hardware data-toggle values as programmed into HCTSIZ.pid.
///
/// `Setup` doubles as MDATA for periodic transfers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketId {
    Data0 = 0,
    Data2 = 1,
    Data1 = 2,
    Setup = 3,
}

impl PacketId {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::Data0,
            1 => Self::Data2,
            2 => Self::Data1,
            _ => Self::Setup,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }
}

/// Host channel characteristics (HCCHAR)
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Characteristics(pub u32);

impl Characteristics {
    pub fn max_packet_size(&self) -> u16 {
        self.0.get_bits(0..11) as u16
    }

    pub fn set_max_packet_size(&mut self, size: u16) {
        self.0.set_bits(0..11, size as u32);
    }

    pub fn endpoint_number(&self) -> u8 {
        self.0.get_bits(11..15) as u8
    }

    pub fn set_endpoint_number(&mut self, number: u8) {
        self.0.set_bits(11..15, number as u32);
    }

    pub fn endpoint_direction(&self) -> Direction {
        if self.0.get_bit(15) {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn set_endpoint_direction(&mut self, direction: Direction) {
        self.0.set_bit(15, direction == Direction::In);
    }

    pub fn low_speed(&self) -> bool {
        self.0.get_bit(17)
    }

    pub fn set_low_speed(&mut self, low_speed: bool) {
        self.0.set_bit(17, low_speed);
    }

    pub fn endpoint_type(&self) -> u8 {
        self.0.get_bits(18..20) as u8
    }

    pub fn set_endpoint_type(&mut self, endpoint_type: u8) {
        self.0.set_bits(18..20, endpoint_type as u32);
    }

    pub fn packets_per_frame(&self) -> u8 {
        self.0.get_bits(20..22) as u8
    }

    pub fn set_packets_per_frame(&mut self, count: u8) {
        self.0.set_bits(20..22, count as u32);
    }

    pub fn device_address(&self) -> u8 {
        self.0.get_bits(22..29) as u8
    }

    pub fn set_device_address(&mut self, address: u8) {
        self.0.set_bits(22..29, address as u32);
    }

    pub fn odd_frame(&self) -> bool {
        self.0.get_bit(29)
    }

    pub fn set_odd_frame(&mut self, odd: bool) {
        self.0.set_bit(29, odd);
    }

    pub fn channel_enable(&self) -> bool {
        self.0.get_bit(31)
    }

    pub fn set_channel_enable(&mut self, enable: bool) {
        self.0.set_bit(31, enable);
    }
}

/// Host channel split control (HCSPLT)
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SplitControl(pub u32);

impl SplitControl {
    pub fn port_address(&self) -> u8 {
        self.0.get_bits(0..7) as u8
    }

    pub fn set_port_address(&mut self, port: u8) {
        self.0.set_bits(0..7, port as u32);
    }

    pub fn hub_address(&self) -> u8 {
        self.0.get_bits(7..14) as u8
    }

    pub fn set_hub_address(&mut self, address: u8) {
        self.0.set_bits(7..14, address as u32);
    }

    pub fn complete_split(&self) -> bool {
        self.0.get_bit(16)
    }

    pub fn set_complete_split(&mut self, complete: bool) {
        self.0.set_bit(16, complete);
    }

    pub fn split_enable(&self) -> bool {
        self.0.get_bit(31)
    }

    pub fn set_split_enable(&mut self, enable: bool) {
        self.0.set_bit(31, enable);
    }
}

/// Host channel transfer size (HCTSIZ)
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TransferSize(pub u32);

impl TransferSize {
    pub fn size(&self) -> u32 {
        self.0.get_bits(0..19)
    }

    pub fn set_size(&mut self, size: u32) {
        self.0.set_bits(0..19, size);
    }

    pub fn packet_count(&self) -> u32 {
        self.0.get_bits(19..29)
    }

    pub fn set_packet_count(&mut self, count: u32) {
        self.0.set_bits(19..29, count);
    }

    pub fn packet_id(&self) -> PacketId {
        PacketId::from_bits(self.0.get_bits(29..31))
    }

    pub fn set_packet_id(&mut self, pid: PacketId) {
        self.0.set_bits(29..31, pid.bits());
    }
}

/// Port speed as reported by HPRT.speed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortSpeed {
    High = 0,
    Full = 1,
    Low = 2,
}

/// Host port control/status (HPRT)
///
/// The `*_changed` bits and the `enabled` bit are write-1-to-clear;
/// anything writing this register back must mask them out first unless
/// it means to clear them.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HostPort(pub u32);

impl HostPort {
    pub fn connected(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn connected_changed(&self) -> bool {
        self.0.get_bit(1)
    }

    pub fn enabled(&self) -> bool {
        self.0.get_bit(2)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.0.set_bit(2, enabled);
    }

    pub fn enabled_changed(&self) -> bool {
        self.0.get_bit(3)
    }

    pub fn set_enabled_changed(&mut self, changed: bool) {
        self.0.set_bit(3, changed);
    }

    pub fn overcurrent(&self) -> bool {
        self.0.get_bit(4)
    }

    pub fn overcurrent_changed(&self) -> bool {
        self.0.get_bit(5)
    }

    pub fn set_overcurrent_changed(&mut self, changed: bool) {
        self.0.set_bit(5, changed);
    }

    pub fn set_connected_changed(&mut self, changed: bool) {
        self.0.set_bit(1, changed);
    }

    pub fn suspended(&self) -> bool {
        self.0.get_bit(7)
    }

    pub fn reset(&self) -> bool {
        self.0.get_bit(8)
    }

    pub fn set_reset(&mut self, reset: bool) {
        self.0.set_bit(8, reset);
    }

    pub fn powered(&self) -> bool {
        self.0.get_bit(12)
    }

    pub fn set_powered(&mut self, powered: bool) {
        self.0.set_bit(12, powered);
    }

    pub fn speed(&self) -> PortSpeed {
        match self.0.get_bits(17..19) {
            0 => PortSpeed::High,
            1 => PortSpeed::Full,
            _ => PortSpeed::Low,
        }
    }
}

/// Typed accessors over the register window.
pub struct RegisterBlock<M: Mmio> {
    mmio: M,
}

impl<M: Mmio> RegisterBlock<M> {
    pub fn new(mmio: M) -> Self {
        Self { mmio }
    }

    pub fn gintsts(&self) -> CoreInterrupts {
        CoreInterrupts::from_bits_retain(self.mmio.read32(GINTSTS))
    }

    /// Write-1-to-clear the given core interrupt bits.
    pub fn clear_gintsts(&self, bits: CoreInterrupts) {
        self.mmio.write32(GINTSTS, bits.bits());
    }

    pub fn gintmsk(&self) -> CoreInterrupts {
        CoreInterrupts::from_bits_retain(self.mmio.read32(GINTMSK))
    }

    pub fn set_gintmsk(&self, mask: CoreInterrupts) {
        self.mmio.write32(GINTMSK, mask.bits());
    }

    pub fn frame_number(&self) -> u16 {
        (self.mmio.read32(HFNUM) & 0xFFFF) as u16
    }

    pub fn hprt(&self) -> HostPort {
        HostPort(self.mmio.read32(HPRT))
    }

    pub fn set_hprt(&self, value: HostPort) {
        self.mmio.write32(HPRT, value.0);
    }

    pub fn haint(&self) -> u32 {
        self.mmio.read32(HAINT)
    }

    pub fn haintmsk(&self) -> u32 {
        self.mmio.read32(HAINTMSK)
    }

    pub fn set_haintmsk(&self, mask: u32) {
        self.mmio.write32(HAINTMSK, mask);
    }

    pub fn channel(&self, channel: u8) -> ChannelRegs<'_, M> {
        ChannelRegs {
            mmio: &self.mmio,
            base: channel_base(channel),
        }
    }
}

/// One channel's slice of the register window.
pub struct ChannelRegs<'a, M: Mmio> {
    mmio: &'a M,
    base: usize,
}

impl<M: Mmio> ChannelRegs<'_, M> {
    pub fn characteristics(&self) -> Characteristics {
        Characteristics(self.mmio.read32(self.base + HCCHAR))
    }

    pub fn set_characteristics(&self, value: Characteristics) {
        self.mmio.write32(self.base + HCCHAR, value.0);
    }

    pub fn split_control(&self) -> SplitControl {
        SplitControl(self.mmio.read32(self.base + HCSPLT))
    }

    pub fn set_split_control(&self, value: SplitControl) {
        self.mmio.write32(self.base + HCSPLT, value.0);
    }

    pub fn interrupts(&self) -> ChannelInterrupts {
        ChannelInterrupts::from_bits_retain(self.mmio.read32(self.base + HCINT))
    }

    /// Write-1-to-clear the given channel interrupt bits.
    pub fn clear_interrupts(&self, bits: u32) {
        self.mmio.write32(self.base + HCINT, bits);
    }

    pub fn interrupt_mask(&self) -> ChannelInterrupts {
        ChannelInterrupts::from_bits_retain(self.mmio.read32(self.base + HCINTMSK))
    }

    pub fn set_interrupt_mask(&self, mask: ChannelInterrupts) {
        self.mmio.write32(self.base + HCINTMSK, mask.bits());
    }

    pub fn transfer(&self) -> TransferSize {
        TransferSize(self.mmio.read32(self.base + HCTSIZ))
    }

    pub fn set_transfer(&self, value: TransferSize) {
        self.mmio.write32(self.base + HCTSIZ, value.0);
    }

    pub fn dma_address(&self) -> u32 {
        self.mmio.read32(self.base + HCDMA)
    }

    pub fn set_dma_address(&self, address: u32) {
        self.mmio.write32(self.base + HCDMA, address);
    }
}

#[cfg(test)]
#[path = "tests/regs.rs"]
mod tests;
