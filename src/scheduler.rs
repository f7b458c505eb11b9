//! Per-endpoint transaction scheduling
//!
//! Each enabled endpoint gets one long-running worker thread.  The
//! worker pulls requests off the endpoint's pending queue, borrows a
//! host channel, programs the transaction, and then interprets
//! channel-halt interrupts until the transfer completes, retries, or
//! fails.
//!
//! Retryable conditions (NAK, NYET, frame overrun, split-transaction
//! continuation, control-phase advance) never surface upstream: the
//! request is either restarted on the same channel or put back at the
//! *head* of the pending queue, so upstream observes strict FIFO
//! completion per endpoint.

use crate::channel::ChannelGuard;
use crate::host::{Dwc2, Endpoint};
use crate::regs::{ChannelInterrupts, CoreInterrupts, Mmio, PacketId};
use crate::request::{ControlPhase, DmaAllocator, DmaBuffer, Error, Transfer};
use crate::wire::{
    Direction, EndpointType, UsbSpeed, DEVICE_TO_HOST, ENDPOINT_DIR_MASK, ENDPOINT_NUM_MASK,
};
use log::{error, info, trace};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

// Log every 512th frame overrun.
const FRAME_OVERRUN_THRESHOLD: u32 = 512;

// Wait half a microframe before retrying a NYETed complete-split.
const NYET_RETRY_DELAY: Duration = Duration::from_nanos(62_500);

impl<M: Mmio + 'static> Dwc2<M> {
    /// Body of an endpoint's worker thread.
    pub(crate) fn endpoint_scheduler(&self, ep: &Endpoint) {
        // Hardware data toggle is tracked per endpoint across
        // transfers; each halt updates it from the channel's view.
        let mut next_data_toggle = PacketId::Data0;
        let mut held: Option<ChannelGuard> = None;

        loop {
            // Woken by request_queue / requeue_head.
            ep.pending_event.wait();

            let Some(mut transfer) = ({
                let mut pending = ep.pending.lock().unwrap();
                let transfer = pending.pop_front();
                if pending.is_empty() {
                    ep.pending_event.reset();
                }
                transfer
            }) else {
                continue;
            };

            match ep.transfer_type() {
                EndpointType::Control => match transfer.ctrl_phase {
                    ControlPhase::Setup => {
                        // One channel carries all three phases of the
                        // transfer; hold it until the transfer is done.
                        if held.is_none() {
                            held = Some(self.channels.acquire());
                        }
                        let channel = held.as_ref().expect("no channel reserved").n();

                        let Some(setup) = transfer.req().setup else {
                            held = None;
                            self.cache.complete(transfer, Err(Error::InvalidArgs));
                            continue;
                        };
                        let mut setup_buf =
                            match self.dma.alloc(core::mem::size_of_val(&setup)) {
                                Ok(buf) => buf,
                                Err(e) => {
                                    held = None;
                                    self.cache.complete(transfer, Err(e));
                                    continue;
                                }
                            };
                        setup_buf.write(0, bytemuck::bytes_of(&setup));
                        setup_buf.cache_flush(0, core::mem::size_of_val(&setup));
                        transfer.setup_buf = Some(setup_buf);

                        self.start_transfer(channel, &mut transfer, ep);
                    }
                    // The later phases reuse the channel held since
                    // SETUP.
                    ControlPhase::Data | ControlPhase::Status => {
                        let channel = held
                            .as_ref()
                            .expect("control phase without a held channel")
                            .n();
                        self.start_transfer(channel, &mut transfer, ep);
                    }
                },
                EndpointType::Isochronous => {
                    error!("isochronous endpoints not implemented");
                    return;
                }
                EndpointType::Bulk => {
                    transfer.next_data_toggle = next_data_toggle;
                    // Still held when this is a split continuation.
                    if held.is_none() {
                        held = Some(self.channels.acquire());
                    }
                    let channel = held.as_ref().expect("no channel reserved").n();
                    self.start_transfer(channel, &mut transfer, ep);
                }
                EndpointType::Interrupt => {
                    transfer.next_data_toggle = next_data_toggle;
                    if held.is_none() {
                        held = Some(self.channels.acquire());
                    }
                    let channel = held.as_ref().expect("no channel reserved").n();
                    self.await_sof_if_necessary(channel, &transfer, ep);
                    self.start_transfer(channel, &mut transfer, ep);
                }
            }

            loop {
                let channel = held
                    .as_ref()
                    .expect("transfer in flight without a channel")
                    .n();
                let interrupts = self.await_channel_halt(channel);

                next_data_toggle = self.regs.channel(channel).transfer().packet_id();

                match self.handle_channel_halted(channel, &mut held, transfer, ep, interrupts) {
                    Some(restarted) => transfer = restarted,
                    None => break,
                }
            }
        }
    }

    /// Block until the IRQ dispatcher reports this channel halted, and
    /// take the latched interrupt word.
    fn await_channel_halt(&self, channel: u8) -> ChannelInterrupts {
        self.channel_complete[channel as usize].wait();
        self.channel_complete[channel as usize].reset();
        ChannelInterrupts::from_bits_retain(
            self.channel_interrupts[channel as usize].load(Ordering::Acquire),
        )
    }

    /// Low/full-speed periodic starts line up with frame boundaries:
    /// gate on the next SOF unless we're in the complete-split phase.
    fn await_sof_if_necessary(&self, channel: u8, transfer: &Transfer, ep: &Endpoint) {
        let speed = self.devices[ep.device_id as usize].lock().unwrap().speed;
        if ep.transfer_type() != EndpointType::Interrupt
            || transfer.complete_split
            || speed == UsbSpeed::High480
        {
            return;
        }

        {
            let mut waiters = self.sof_gate.lock().unwrap();
            if *waiters == 0 {
                // First waiter turns the SOF interrupt on.
                self.regs
                    .set_gintmsk(self.regs.gintmsk() | CoreInterrupts::SOF);
            }
            *waiters += 1;
        }

        // Woken by the dispatcher on the next start-of-frame.
        self.sof_waiters[channel as usize].reset();
        self.sof_waiters[channel as usize].wait();

        let mut waiters = self.sof_gate.lock().unwrap();
        *waiters -= 1;
        if *waiters == 0 {
            // Last waiter turns it back off.
            self.regs
                .set_gintmsk(self.regs.gintmsk() - CoreInterrupts::SOF);
        }
    }

    /// Program a channel for (the next chunk of) a transfer and arm it.
    fn start_transfer(&self, channel: u8, transfer: &mut Transfer, ep: &Endpoint) {
        let (speed, hub_address, port) = {
            let device = self.devices[ep.device_id as usize].lock().unwrap();
            (device.speed, device.hub_address, device.port)
        };
        let descriptor = *ep.descriptor.lock().unwrap();
        let ep_type = descriptor.transfer_type();

        // Bits 12:11 of wMaxPacketSize are the high-bandwidth
        // additional-transactions count, not part of the packet size.
        let max_packet_size = descriptor.max_packet_size() & 0x7FF;

        let mut characteristics = crate::regs::Characteristics::default();
        let mut split_control = crate::regs::SplitControl::default();
        let mut size = crate::regs::TransferSize::default();
        transfer.short_attempt = false;

        characteristics.set_max_packet_size(max_packet_size);
        characteristics.set_endpoint_number(ep.ep_address & ENDPOINT_NUM_MASK);
        characteristics.set_endpoint_type(ep_type as u8);
        characteristics.set_device_address(ep.device_id as u8);
        let mut packets_per_frame = 1;
        if speed == UsbSpeed::High480 {
            packets_per_frame += ((descriptor.max_packet_size() >> 11) & 0x3) as u8;
        }
        characteristics.set_packets_per_frame(packets_per_frame);

        let mut dma_address = None;

        if ep_type == EndpointType::Control {
            match transfer.ctrl_phase {
                ControlPhase::Setup => {
                    let setup_buf = transfer
                        .setup_buf
                        .as_ref()
                        .expect("SETUP phase without a setup buffer");
                    characteristics.set_endpoint_direction(Direction::Out);
                    dma_address = Some(setup_buf.phys());
                    size.set_size(core::mem::size_of::<crate::wire::SetupPacket>() as u32);
                    size.set_packet_id(PacketId::Setup);
                }
                ControlPhase::Data => {
                    let setup = transfer.req().setup.expect("DATA phase without setup");
                    characteristics.set_endpoint_direction(
                        if setup.bmRequestType & DEVICE_TO_HOST != 0 {
                            Direction::In
                        } else {
                            Direction::Out
                        },
                    );
                    dma_address =
                        Some(transfer.req().buffer.phys() + transfer.bytes_transferred);
                    let remaining =
                        transfer.req().length as u32 - transfer.bytes_transferred;
                    size.set_size(remaining);

                    transfer
                        .req_mut()
                        .buffer
                        .cache_flush_invalidate(0, remaining as usize);

                    size.set_packet_id(if transfer.bytes_transferred == 0 {
                        // First DATA packet of a control transfer is
                        // always DATA1.
                        PacketId::Data1
                    } else {
                        transfer.next_data_toggle
                    });
                }
                ControlPhase::Status => {
                    // With no DATA phase the status transaction is IN;
                    // otherwise it runs opposite to the DATA direction.
                    let setup = transfer.req().setup.expect("STATUS phase without setup");
                    let direction = if setup.wLength == 0 {
                        Direction::In
                    } else if setup.bmRequestType & DEVICE_TO_HOST == 0 {
                        Direction::In
                    } else {
                        Direction::Out
                    };
                    characteristics.set_endpoint_direction(direction);
                    size.set_size(0);
                    size.set_packet_id(PacketId::Data1);
                }
            }
        } else {
            characteristics.set_endpoint_direction(
                if ep.ep_address & ENDPOINT_DIR_MASK != 0 {
                    Direction::In
                } else {
                    Direction::Out
                },
            );
            dma_address = Some(transfer.req().buffer.phys() + transfer.bytes_transferred);
            size.set_size(transfer.req().length as u32 - transfer.bytes_transferred);
            size.set_packet_id(transfer.next_data_toggle);
        }

        if speed != UsbSpeed::High480 {
            split_control.set_port_address(port as u8 & 0x7F);
            split_control.set_hub_address(hub_address as u8 & 0x7F);
            split_control.set_split_enable(true);

            // A split carries at most one packet per attempt; the halt
            // handler requeues the rest.
            if size.size() > max_packet_size as u32 {
                size.set_size(max_packet_size as u32);
                transfer.short_attempt = true;
            }

            if speed == UsbSpeed::Low1_5 {
                characteristics.set_low_speed(true);
            }
        }

        let dma_address = dma_address.unwrap_or(0xFFFF_FF00);
        assert_eq!(dma_address % 4, 0, "DMA address must be word-aligned");

        let chan = self.regs.channel(channel);
        chan.set_dma_address(dma_address);

        let mut packet_count = size.size().div_ceil(max_packet_size as u32);
        if packet_count == 0 {
            packet_count = 1;
        } else if transfer.req().send_zlp && size.size() % max_packet_size as u32 == 0 {
            packet_count += 1;
        }
        size.set_packet_count(packet_count);

        transfer.bytes_queued = size.size();
        transfer.total_bytes_queued = size.size();
        transfer.packets_queued = packet_count;

        trace!(
            "programming request, req_id = {}, channel = {}",
            transfer.request_id,
            channel
        );

        chan.set_characteristics(characteristics);
        chan.set_split_control(split_control);
        chan.set_transfer(size);

        self.start_transaction(channel, transfer);
    }

    /// (Re-)arm an already-programmed channel for one transaction.
    fn start_transaction(&self, channel: u8, transfer: &mut Transfer) {
        let chan = self.regs.channel(channel);

        chan.set_interrupt_mask(ChannelInterrupts::empty());
        chan.clear_interrupts(!0);

        let mut split_control = chan.split_control();
        split_control.set_complete_split(transfer.complete_split);
        chan.set_split_control(split_control);

        let next_frame = self.regs.frame_number().wrapping_add(1);

        if !split_control.complete_split() {
            transfer.csplit_retries = 0;
        }

        let mut characteristics = chan.characteristics();
        characteristics.set_odd_frame(next_frame & 1 != 0);
        characteristics.set_channel_enable(true);
        chan.set_characteristics(characteristics);

        chan.set_interrupt_mask(ChannelInterrupts::CHANNEL_HALTED);
        self.regs.set_haintmsk(self.regs.haintmsk() | 1 << channel);
    }

    fn requeue_head(&self, ep: &Endpoint, transfer: Box<Transfer>) {
        {
            let mut pending = ep.pending.lock().unwrap();
            pending.push_front(transfer);
        }
        ep.pending_event.signal();
    }

    /// The channel-halt state machine.  Returns the transfer when it
    /// has been restarted on the same channel (keep waiting), `None`
    /// when it was completed or requeued.
    fn handle_channel_halted<'a>(
        &'a self,
        channel: u8,
        held: &mut Option<ChannelGuard<'a>>,
        mut transfer: Box<Transfer>,
        ep: &Endpoint,
        interrupts: ChannelInterrupts,
    ) -> Option<Box<Transfer>> {
        let chan = self.regs.channel(channel);

        let hard_error = interrupts.intersects(
            ChannelInterrupts::STALL
                | ChannelInterrupts::AHB_ERROR
                | ChannelInterrupts::TRANSACTION_ERROR
                | ChannelInterrupts::BABBLE_ERROR
                | ChannelInterrupts::EXCESS_TRANSACTION_ERROR
                | ChannelInterrupts::FRAME_LIST_ROLLOVER,
        ) || (interrupts.contains(ChannelInterrupts::NYET) && !transfer.complete_split)
            || (interrupts.contains(ChannelInterrupts::DATA_TOGGLE_ERROR)
                && chan.characteristics().endpoint_direction() == Direction::Out);

        if hard_error {
            if !interrupts.contains(ChannelInterrupts::STALL) {
                // A stall is a legitimate endpoint response; the class
                // driver deals with it.
                error!("transfer failed, interrupts = {:#010x}", interrupts.bits());
            }
            held.take();
            self.cache.complete(transfer, Err(Error::Io));
            return None;
        }

        if interrupts.contains(ChannelInterrupts::FRAME_OVERRUN) {
            let n = self.frame_overruns.fetch_add(1, Ordering::Relaxed) + 1;
            if n % FRAME_OVERRUN_THRESHOLD == 0 {
                // Coarse by design: one line per threshold's worth.
                info!(
                    "requeued {} frame overruns, last one on ep = {:#04x}, devid = {}",
                    FRAME_OVERRUN_THRESHOLD, ep.ep_address, ep.device_id
                );
            }
            held.take();
            self.requeue_head(ep, transfer);
            return None;
        }

        if interrupts.contains(ChannelInterrupts::NAK) {
            transfer.next_data_toggle = chan.transfer().packet_id();

            let is_control = ep.transfer_type() == EndpointType::Control;
            // Control DATA/STATUS retries assume the channel is still
            // held.
            if !is_control || transfer.ctrl_phase == ControlPhase::Setup {
                held.take();
            }

            let interval = ep.descriptor.lock().unwrap().bInterval;
            let speed = self.devices[ep.device_id as usize].lock().unwrap().speed;
            let delay = if speed == UsbSpeed::High480 {
                // 2^(bInterval - 1) microframes of 125us each.
                Duration::from_micros(125u64 << interval.saturating_sub(1).min(15))
            } else {
                Duration::from_millis(interval as u64)
            };
            thread::sleep(delay.max(Duration::from_millis(1)));

            self.await_sof_if_necessary(channel, &transfer, ep);

            transfer.complete_split = false;
            self.requeue_head(ep, transfer);
            return None;
        }

        if interrupts.contains(ChannelInterrupts::NYET) {
            transfer.csplit_retries += 1;
            if transfer.csplit_retries >= 8 {
                transfer.complete_split = false;
            }

            // Retry mid-frame, except periodic transfers which line up
            // with the next SOF instead.
            if ep.transfer_type() != EndpointType::Interrupt {
                thread::sleep(NYET_RETRY_DELAY);
            }
            self.await_sof_if_necessary(channel, &transfer, ep);
            trace!(
                "requeue nyet on ep = {:#04x}, devid = {}",
                ep.ep_address,
                ep.device_id
            );

            self.start_transaction(channel, &mut transfer);
            return Some(transfer);
        }

        self.handle_normal_halt(channel, held, transfer, ep, interrupts)
    }

    fn handle_normal_halt<'a>(
        &'a self,
        channel: u8,
        held: &mut Option<ChannelGuard<'a>>,
        mut transfer: Box<Transfer>,
        ep: &Endpoint,
        interrupts: ChannelInterrupts,
    ) -> Option<Box<Transfer>> {
        let chan = self.regs.channel(channel);

        let packets_remaining = chan.transfer().packet_count();
        let packets_transferred = transfer.packets_queued - packets_remaining;

        if packets_transferred == 0 {
            if interrupts.contains(ChannelInterrupts::ACK)
                && chan.split_control().split_enable()
                && !transfer.complete_split
            {
                // The start-split was accepted; go back for the
                // complete-split.
                transfer.complete_split = true;
                self.start_transaction(channel, &mut transfer);
                return Some(transfer);
            }
            held.take();
            self.cache.complete(transfer, Err(Error::Io));
            return None;
        }

        let characteristics = chan.characteristics();
        let max_packet_size = characteristics.max_packet_size() as u32;
        let is_dir_in = characteristics.endpoint_direction() == Direction::In;

        let mut bytes_transferred = 0;
        if is_dir_in {
            // The controller counts the size register down as data
            // arrives.
            bytes_transferred = transfer.bytes_queued - chan.transfer().size();
        } else {
            if packets_transferred > 1 {
                bytes_transferred += max_packet_size * (packets_transferred - 1);
            }
            if packets_remaining == 0
                && (transfer.total_bytes_queued % max_packet_size != 0
                    || transfer.total_bytes_queued == 0)
            {
                bytes_transferred += transfer.total_bytes_queued;
            } else {
                bytes_transferred += max_packet_size;
            }
        }

        transfer.packets_queued -= packets_transferred;
        transfer.bytes_queued -= bytes_transferred;
        transfer.bytes_transferred += bytes_transferred;

        let short_read =
            is_dir_in && bytes_transferred < packets_transferred * max_packet_size;
        if transfer.packets_queued == 0 || short_read {
            if !interrupts.contains(ChannelInterrupts::TRANSFER_COMPLETED) {
                error!("transfer failed, interrupts = {:#010x}", interrupts.bits());
                held.take();
                self.cache.complete(transfer, Err(Error::Io));
                return None;
            }

            if transfer.short_attempt
                && transfer.bytes_queued == 0
                && ep.transfer_type() != EndpointType::Interrupt
            {
                // This attempt was clamped to one packet for the
                // split; requeue for the next chunk, keeping the
                // channel.
                transfer.complete_split = false;
                transfer.next_data_toggle = chan.transfer().packet_id();
                self.requeue_head(ep, transfer);
                return None;
            }

            if ep.transfer_type() == EndpointType::Control
                && transfer.ctrl_phase < ControlPhase::Status
            {
                transfer.complete_split = false;

                if transfer.ctrl_phase == ControlPhase::Setup {
                    transfer.bytes_transferred = 0;
                    transfer.next_data_toggle = PacketId::Data1;
                }

                transfer.ctrl_phase.advance();

                // With nothing to transfer, skip straight to STATUS.
                if transfer.ctrl_phase == ControlPhase::Data && transfer.req().length == 0 {
                    transfer.ctrl_phase.advance();
                }

                self.requeue_head(ep, transfer);
                return None;
            }

            held.take();
            let actual = transfer.bytes_transferred as usize;
            self.cache.complete(transfer, Ok(actual));
            return None;
        }

        if chan.split_control().split_enable() {
            transfer.complete_split = !transfer.complete_split;
        }

        self.start_transaction(channel, &mut transfer);
        Some(transfer)
    }
}

#[cfg(test)]
#[path = "tests/scheduler.rs"]
mod tests;
