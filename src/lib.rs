#![doc = include_str!("../README.md")]

mod bitset;
mod channel;
mod event;
pub mod host;
#[cfg(test)]
pub(crate) mod mocks;
pub mod regs;
pub mod request;
mod root_hub;
mod scheduler;
pub mod wire;

pub use host::{Dwc2, MAX_DEVICE_COUNT, MAX_TRANSFER_SIZE, NUM_HOST_CHANNELS, ROOT_HUB_DEVICE_ID};
pub use request::{BusInterface, DmaAllocator, DmaBuffer, Error, UsbRequest};
