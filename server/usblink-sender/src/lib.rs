#![forbid(unsafe_code)]

//! usblink sender daemon.
//!
//! Serves the peer protocol at `0.0.0.0:3240`: answers device-list and
//! import requests for the local mass-storage devices, echoes heartbeats,
//! and publishes captured URBs as URB_SUBMIT messages. The optional reverse
//! mode dials out to a remote receiver instead of waiting to be dialed.

pub mod config;
pub mod reverse;
pub mod session;

pub use config::Config;
pub use reverse::{FrameHandler, ReverseClient, ReverseSender};
pub use session::SenderSession;
