#![forbid(unsafe_code)]

//! Sender-side host USB access.
//!
//! [`io`] defines the device-I/O capability the rest of the sender is written
//! against; [`rusb_backend`] implements it on libusb via `rusb`.
//! [`mass_storage`] drives a bulk-only mass-storage device through CBW/CSW
//! cycles and fabricates URBs from the traffic; [`capture`] multiplexes those
//! URBs through an unbounded queue with statistics.

pub mod capture;
pub mod io;
pub mod mass_storage;
pub mod rusb_backend;

pub use capture::{CaptureStats, UrbCapture, UrbSink};
pub use io::{DeviceEnumerator, DeviceIo, DeviceSummary, HotplugEvent, HotplugSink, UsbIoError};
pub use mass_storage::{MassStorageDevice, MscError};
