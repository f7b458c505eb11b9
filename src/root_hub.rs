//! The synthetic root hub
//!
//! The controller's single physical port is presented to the upstream
//! stack as a one-port USB 2.0 hub, so the generic hub-enumeration
//! logic can drive it like any other hub.  Control requests addressed
//! to [`ROOT_HUB_DEVICE_ID`](crate::host::ROOT_HUB_DEVICE_ID) are
//! answered from the tables below; hub-class port features translate
//! into host-port register writes; port interrupts latch into the
//! `{wPortStatus, wPortChange}` pair and complete the pending
//! status-change interrupt request.

use crate::event::Event;
use crate::host::Dwc2;
use crate::regs::{Mmio, PortSpeed};
use crate::request::{DmaBuffer, Error, Transfer};
use crate::wire::{
    ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor, HubDescriptor,
    InterfaceDescriptor, SetupPacket, CLASS_REQUEST, CLEAR_FEATURE, CONFIGURATION_DESCRIPTOR,
    C_PORT_CONNECTION, C_PORT_ENABLE, C_PORT_OVER_CURRENT, C_PORT_RESET, C_PORT_SUSPEND,
    DEVICE_DESCRIPTOR, ENDPOINT_DESCRIPTOR, ENDPOINT_IN, GET_DESCRIPTOR, GET_STATUS,
    HUB_CLASSCODE, HUB_DESCRIPTOR, INTERFACE_DESCRIPTOR, PORT_CHANGE_CONNECTION,
    PORT_CHANGE_ENABLE, PORT_CHANGE_OVER_CURRENT, PORT_CHANGE_RESET, PORT_CHANGE_SUSPEND,
    PORT_POWER, PORT_RESET, PORT_STATUS_CONNECTION, PORT_STATUS_ENABLE, PORT_STATUS_HIGH_SPEED,
    PORT_STATUS_LOW_SPEED, PORT_STATUS_OVER_CURRENT, PORT_STATUS_RESET, PORT_STATUS_SUSPEND,
    REQUEST_TYPE_MASK, SET_ADDRESS, SET_CONFIGURATION, SET_FEATURE, STANDARD_REQUEST,
    STRING_DESCRIPTOR,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

// USB 2.0 s7.1.7.5: root ports must hold reset this long.
const RESET_HOLD: Duration = Duration::from_millis(60);

const MANUFACTURER_STRING: u8 = 1;
const PRODUCT_STRING: u8 = 2;

/// Device descriptor for the USB 2.0 root hub.
const ROOT_HUB_DEVICE_DESCRIPTOR: DeviceDescriptor = DeviceDescriptor {
    bLength: core::mem::size_of::<DeviceDescriptor>() as u8,
    bDescriptorType: DEVICE_DESCRIPTOR,
    bcdUSB: 0x0200u16.to_le_bytes(),
    bDeviceClass: HUB_CLASSCODE,
    bDeviceSubClass: 0,
    bDeviceProtocol: 1, // single TT
    bMaxPacketSize0: 64,
    idVendor: 0x18D1u16.to_le_bytes(),
    idProduct: 0xA002u16.to_le_bytes(),
    bcdDevice: 0x0100u16.to_le_bytes(),
    iManufacturer: MANUFACTURER_STRING,
    iProduct: PRODUCT_STRING,
    iSerialNumber: 0,
    bNumConfigurations: 1,
};

/// The fused configuration + interface + endpoint descriptor block the
/// root hub returns for `GET_DESCRIPTOR(CONFIGURATION)`.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct RootHubConfigDescriptor {
    pub config: ConfigurationDescriptor,
    pub interface: InterfaceDescriptor,
    pub endpoint: EndpointDescriptor,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for RootHubConfigDescriptor {}
// SAFETY: members are Pod with align 1, so no padding
unsafe impl bytemuck::Pod for RootHubConfigDescriptor {}

const ROOT_HUB_CONFIG_DESCRIPTOR: RootHubConfigDescriptor = RootHubConfigDescriptor {
    config: ConfigurationDescriptor {
        bLength: core::mem::size_of::<ConfigurationDescriptor>() as u8,
        bDescriptorType: CONFIGURATION_DESCRIPTOR,
        wTotalLength: (core::mem::size_of::<RootHubConfigDescriptor>() as u16).to_le_bytes(),
        bNumInterfaces: 1,
        bConfigurationValue: 1,
        iConfiguration: 0,
        bmAttributes: 0xE0, // self powered
        bMaxPower: 0,
    },
    interface: InterfaceDescriptor {
        bLength: core::mem::size_of::<InterfaceDescriptor>() as u8,
        bDescriptorType: INTERFACE_DESCRIPTOR,
        bInterfaceNumber: 0,
        bAlternateSetting: 0,
        bNumEndpoints: 1,
        bInterfaceClass: HUB_CLASSCODE,
        bInterfaceSubClass: 0,
        bInterfaceProtocol: 0,
        iInterface: 0,
    },
    endpoint: EndpointDescriptor {
        bLength: core::mem::size_of::<EndpointDescriptor>() as u8,
        bDescriptorType: ENDPOINT_DESCRIPTOR,
        bEndpointAddress: ENDPOINT_IN | 1,
        bmAttributes: 3, // interrupt
        wMaxPacketSize: 4u16.to_le_bytes(),
        bInterval: 12,
    },
};

const LANGUAGE_LIST: [u8; 4] = [4, STRING_DESCRIPTOR, 0x09, 0x04]; // en-US

// "Zircon"
const MANUFACTURER: [u8; 16] = [
    16, STRING_DESCRIPTOR, b'Z', 0, b'i', 0, b'r', 0, b'c', 0, b'o', 0, b'n', 0, 0, 0,
];

// "USB 2.0 Root Hub"
const PRODUCT: [u8; 36] = [
    36, STRING_DESCRIPTOR, b'U', 0, b'S', 0, b'B', 0, b' ', 0, b'2', 0, b'.', 0, b'0', 0, b' ', 0,
    b'R', 0, b'o', 0, b'o', 0, b't', 0, b' ', 0, b'H', 0, b'u', 0, b'b', 0, 0, 0,
];

fn string_descriptor(index: u8) -> Option<&'static [u8]> {
    match index {
        0 => Some(&LANGUAGE_LIST),
        MANUFACTURER_STRING => Some(&MANUFACTURER),
        PRODUCT_STRING => Some(&PRODUCT),
        _ => None,
    }
}

/// Root port status in hub-class encoding, plus the interrupt-in slot
/// it feeds.  One mutex guards both: a port change and its
/// notification are a unit.
pub(crate) struct PortState {
    pub port_status: u16,
    pub port_change: u16,
    pub intr_req: Option<Box<Transfer>>,
}

pub(crate) struct RootHub {
    pub(crate) status: Mutex<PortState>,
    requests: Mutex<VecDeque<Box<Transfer>>>,
    /// Signalled when `requests` gains an entry; reset by the worker
    /// under the `requests` lock when it drains.
    requests_event: Event,
}

impl RootHub {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(PortState {
                port_status: 0,
                port_change: 0,
                intr_req: None,
            }),
            requests: Mutex::new(VecDeque::new()),
            requests_event: Event::new(),
        }
    }

    pub fn queue(&self, transfer: Box<Transfer>) {
        {
            let mut requests = self.requests.lock().unwrap();
            requests.push_back(transfer);
        }
        self.requests_event.signal();
    }
}

impl<M: Mmio + 'static> Dwc2<M> {
    /// Body of the root-hub worker thread.
    pub(crate) fn root_hub_worker(&self) {
        loop {
            // Woken by RootHub::queue.
            self.root_hub.requests_event.wait();

            let Some(transfer) = ({
                let mut requests = self.root_hub.requests.lock().unwrap();
                let transfer = requests.pop_front();
                if requests.is_empty() {
                    self.root_hub.requests_event.reset();
                }
                transfer
            }) else {
                continue;
            };

            self.process_root_hub_request(transfer);
        }
    }

    fn process_root_hub_request(&self, transfer: Box<Transfer>) {
        if transfer.req().ep_address == 0 {
            self.root_hub_control(transfer);
        } else {
            // The port-status interrupt-in request.  There is only one
            // slot: a single-port hub never has more than one change
            // stream, so a newer request displaces the old one.
            let displaced = {
                let mut state = self.root_hub.status.lock().unwrap();
                state.intr_req.replace(transfer)
            };
            if let Some(displaced) = displaced {
                self.cache.complete(displaced, Ok(0));
            }
            self.complete_port_status_request();
        }
    }

    fn root_hub_control(&self, transfer: Box<Transfer>) {
        let Some(setup) = transfer.req().setup else {
            self.cache.complete(transfer, Err(Error::InvalidArgs));
            return;
        };

        match setup.bmRequestType & REQUEST_TYPE_MASK {
            STANDARD_REQUEST => self.root_hub_standard_request(transfer, &setup),
            CLASS_REQUEST => self.root_hub_class_request(transfer, &setup),
            _ => self.cache.complete(transfer, Err(Error::NotSupported)),
        }
    }

    fn root_hub_standard_request(&self, transfer: Box<Transfer>, setup: &SetupPacket) {
        match setup.bRequest {
            SET_ADDRESS | SET_CONFIGURATION => self.cache.complete(transfer, Ok(0)),
            GET_DESCRIPTOR => self.root_hub_get_descriptor(transfer, setup),
            _ => self.cache.complete(transfer, Err(Error::NotSupported)),
        }
    }

    fn root_hub_get_descriptor(&self, mut transfer: Box<Transfer>, setup: &SetupPacket) {
        let descriptor_type = (setup.wValue >> 8) as u8;
        let index = setup.wValue as u8;
        let length = setup.wLength as usize;

        let bytes: &[u8] = if descriptor_type == DEVICE_DESCRIPTOR && setup.wIndex == 0 {
            bytemuck::bytes_of(&ROOT_HUB_DEVICE_DESCRIPTOR)
        } else if descriptor_type == CONFIGURATION_DESCRIPTOR && setup.wIndex == 0 {
            bytemuck::bytes_of(&ROOT_HUB_CONFIG_DESCRIPTOR)
        } else if descriptor_type == STRING_DESCRIPTOR {
            match string_descriptor(index) {
                Some(string) => string,
                None => {
                    self.cache.complete(transfer, Err(Error::NotSupported));
                    return;
                }
            }
        } else {
            self.cache.complete(transfer, Err(Error::NotSupported));
            return;
        };

        let length = length.min(bytes.len());
        transfer.req_mut().buffer.write(0, &bytes[..length]);
        self.cache.complete(transfer, Ok(length));
    }

    fn root_hub_class_request(&self, mut transfer: Box<Transfer>, setup: &SetupPacket) {
        match setup.bRequest {
            GET_DESCRIPTOR
                if setup.wValue == (HUB_DESCRIPTOR as u16) << 8 && setup.wIndex == 0 =>
            {
                let descriptor = HubDescriptor {
                    bDescLength: core::mem::size_of::<HubDescriptor>() as u8,
                    bDescriptorType: HUB_DESCRIPTOR,
                    bNbrPorts: 1,
                    wHubCharacteristics: [0, 0],
                    bPwrOn2PwrGood: 0,
                    bHubContrCurrent: 0,
                    DeviceRemovable: 0,
                    PortPwrCtrlMask: 0,
                };
                let bytes = bytemuck::bytes_of(&descriptor);
                let length = (setup.wLength as usize).min(bytes.len());
                transfer.req_mut().buffer.write(0, &bytes[..length]);
                self.cache.complete(transfer, Ok(length));
            }
            SET_FEATURE => {
                let result = self.host_port_set_feature(setup.wValue);
                self.cache.complete(transfer, result.map(|_| 0));
            }
            CLEAR_FEATURE => {
                {
                    let mut state = self.root_hub.status.lock().unwrap();
                    match setup.wValue {
                        C_PORT_CONNECTION => state.port_change &= !PORT_CHANGE_CONNECTION,
                        C_PORT_ENABLE => state.port_change &= !PORT_CHANGE_ENABLE,
                        C_PORT_SUSPEND => state.port_change &= !PORT_CHANGE_SUSPEND,
                        C_PORT_OVER_CURRENT => state.port_change &= !PORT_CHANGE_OVER_CURRENT,
                        C_PORT_RESET => state.port_change &= !PORT_CHANGE_RESET,
                        _ => {}
                    }
                }
                self.cache.complete(transfer, Ok(0));
            }
            GET_STATUS => {
                let length = transfer.req().length.min(4);
                let (port_status, port_change) = {
                    let state = self.root_hub.status.lock().unwrap();
                    (state.port_status, state.port_change)
                };
                let mut bytes = [0u8; 4];
                bytes[0..2].copy_from_slice(&port_status.to_le_bytes());
                bytes[2..4].copy_from_slice(&port_change.to_le_bytes());
                transfer.req_mut().buffer.write(0, &bytes[..length]);
                self.cache.complete(transfer, Ok(length));
            }
            _ => self.cache.complete(transfer, Err(Error::NotSupported)),
        }
    }

    fn host_port_set_feature(&self, feature: u16) -> Result<(), Error> {
        match feature {
            PORT_POWER => {
                self.host_port_power_on();
                Ok(())
            }
            PORT_RESET => {
                self.reset_host_port();
                Ok(())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn host_port_power_on(&self) {
        let mut hprt = self.regs.hprt();
        hprt.set_enabled(false);
        hprt.set_connected_changed(false);
        hprt.set_enabled_changed(false);
        hprt.set_overcurrent_changed(false);

        hprt.set_powered(true);
        self.regs.set_hprt(hprt);
    }

    fn reset_host_port(&self) {
        let mut hprt = self.regs.hprt();
        hprt.set_enabled(false);
        hprt.set_connected_changed(false);
        hprt.set_enabled_changed(false);
        hprt.set_overcurrent_changed(false);

        hprt.set_reset(true);
        self.regs.set_hprt(hprt);

        thread::sleep(RESET_HOLD);

        hprt.set_reset(false);
        self.regs.set_hprt(hprt);
    }

    /// The dispatcher's port edge: snapshot the host port register
    /// into hub-class status words, clear the change bits at source,
    /// and complete the pending status-change request if any.
    pub(crate) fn handle_port_irq(&self) {
        let hw = self.regs.hprt();

        {
            let mut state = self.root_hub.status.lock().unwrap();

            state.port_status = 0;
            state.port_change = 0;

            // This controller only has one port.
            if hw.connected() {
                state.port_status |= PORT_STATUS_CONNECTION;
            }
            if hw.enabled() {
                state.port_status |= PORT_STATUS_ENABLE;
            }
            if hw.suspended() {
                state.port_status |= PORT_STATUS_SUSPEND;
            }
            if hw.overcurrent() {
                state.port_status |= PORT_STATUS_OVER_CURRENT;
            }
            if hw.reset() {
                state.port_status |= PORT_STATUS_RESET;
            }

            match hw.speed() {
                PortSpeed::Low => state.port_status |= PORT_STATUS_LOW_SPEED,
                PortSpeed::High => state.port_status |= PORT_STATUS_HIGH_SPEED,
                PortSpeed::Full => {}
            }

            if hw.connected_changed() {
                state.port_change |= PORT_CHANGE_CONNECTION;
            }
            if hw.enabled_changed() {
                state.port_change |= PORT_CHANGE_ENABLE;
            }
            if hw.overcurrent_changed() {
                state.port_change |= PORT_CHANGE_OVER_CURRENT;
            }
        }

        // Write the snapshot back: the change bits observed clear
        // themselves.  The enable bit is also write-1-to-clear and
        // must not go back as-is.
        let mut clear = hw;
        clear.set_enabled(false);
        self.regs.set_hprt(clear);

        self.complete_port_status_request();
    }

    pub(crate) fn complete_port_status_request(&self) {
        let pending = {
            let mut state = self.root_hub.status.lock().unwrap();
            if state.port_change != 0 {
                state.intr_req.take()
            } else {
                None
            }
        };

        if let Some(mut transfer) = pending {
            // Port-change bitmap: bit 1 is port 1.
            transfer.req_mut().buffer.write(0, &[0x02]);
            self.cache.complete(transfer, Ok(1));
        }
    }
}

#[cfg(test)]
#[path = "tests/root_hub.rs"]
mod tests;
