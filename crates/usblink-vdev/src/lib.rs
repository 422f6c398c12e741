#![forbid(unsafe_code)]

//! Receiver-side virtual USB devices.
//!
//! An imported device becomes a [`VirtualUsbDevice`]: it synthesises its own
//! descriptors, answers control requests, and emulates the mass-storage
//! bulk-only transport, producing one response URB per inbound URB.
//! [`ports`] holds the virtual-host-controller port pool and the sysfs
//! attach/detach capability.

pub mod device;
pub mod ports;
pub mod scsi_emu;

pub use device::{DeviceState, VdevError, VirtualUsbDevice};
pub use ports::{NoopPortBinder, PortAllocator, PortBinder, PortError, ShellPortBinder};
pub use scsi_emu::MassStorageEmulator;
