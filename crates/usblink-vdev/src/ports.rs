//! Virtual-host-controller port pool and the attach/detach capability.

use std::io;
use std::process::Command;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_PORT_COUNT: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no free virtual port")]
    Exhausted,
}

/// Fixed pool of virtual-host-controller ports. Acquire hands out the lowest
/// free index; release returns it. Safe to share between threads.
#[derive(Debug)]
pub struct PortAllocator {
    slots: Mutex<Vec<bool>>,
}

impl PortAllocator {
    pub fn new(count: usize) -> Self {
        Self {
            slots: Mutex::new(vec![false; count]),
        }
    }

    pub fn acquire(&self) -> Result<usize, PortError> {
        let mut slots = self.slots.lock().expect("port bitmap lock never poisoned");
        for (index, used) in slots.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(index);
            }
        }
        Err(PortError::Exhausted)
    }

    /// Out-of-range indices are ignored.
    pub fn release(&self, index: usize) {
        let mut slots = self.slots.lock().expect("port bitmap lock never poisoned");
        if let Some(slot) = slots.get_mut(index) {
            *slot = false;
        }
    }

    pub fn active_ports(&self) -> Vec<usize> {
        self.slots
            .lock()
            .expect("port bitmap lock never poisoned")
            .iter()
            .enumerate()
            .filter_map(|(index, &used)| used.then_some(index))
            .collect()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_COUNT)
    }
}

/// Binds an imported device to a virtual-host-controller port.
///
/// The kernel side (vhci_hcd sysfs) is outside this crate; implementations
/// issue the two string commands `attach PORT BUSID` and `detach PORT`.
pub trait PortBinder: Send + Sync {
    fn attach(&self, port: usize, busid: &str) -> io::Result<()>;
    fn detach(&self, port: usize) -> io::Result<()>;
}

/// Shells the commands out against the vhci sysfs endpoint.
pub struct ShellPortBinder {
    sysfs_path: String,
}

impl ShellPortBinder {
    pub fn new() -> Self {
        Self::with_sysfs_path("/sys/devices/platform/vhci_hcd.0")
    }

    pub fn with_sysfs_path(path: impl Into<String>) -> Self {
        Self {
            sysfs_path: path.into(),
        }
    }

    fn run(&self, command: &str) -> io::Result<()> {
        debug!(command, "port binder");
        let status = Command::new("sh").arg("-c").arg(command).status()?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "command exited with {status}: {command}"
            )));
        }
        Ok(())
    }
}

impl Default for ShellPortBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl PortBinder for ShellPortBinder {
    fn attach(&self, port: usize, busid: &str) -> io::Result<()> {
        self.run(&format!(
            "echo 'attach {port} {busid}' > {}/attach",
            self.sysfs_path
        ))
    }

    fn detach(&self, port: usize) -> io::Result<()> {
        self.run(&format!("echo 'detach {port}' > {}/detach", self.sysfs_path))
    }
}

/// No-op binder for tests and for hosts without the vhci module.
pub struct NoopPortBinder;

impl PortBinder for NoopPortBinder {
    fn attach(&self, port: usize, busid: &str) -> io::Result<()> {
        warn!(port, busid, "port binder stubbed, attach skipped");
        Ok(())
    }

    fn detach(&self, port: usize) -> io::Result<()> {
        warn!(port, "port binder stubbed, detach skipped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn acquire_hands_out_lowest_free_index() {
        let ports = PortAllocator::new(4);
        assert_eq!(ports.acquire(), Ok(0));
        assert_eq!(ports.acquire(), Ok(1));
        ports.release(0);
        assert_eq!(ports.acquire(), Ok(0));
        assert_eq!(ports.acquire(), Ok(2));
    }

    #[test]
    fn exhaustion_is_an_error() {
        let ports = PortAllocator::new(2);
        ports.acquire().unwrap();
        ports.acquire().unwrap();
        assert_eq!(ports.acquire(), Err(PortError::Exhausted));
    }

    #[test]
    fn acquired_set_tracks_interleaved_acquire_release() {
        let ports = PortAllocator::new(8);
        let a = ports.acquire().unwrap();
        let b = ports.acquire().unwrap();
        let c = ports.acquire().unwrap();
        assert_eq!(ports.active_ports(), vec![a, b, c]);

        ports.release(b);
        assert_eq!(ports.active_ports(), vec![a, c]);

        let d = ports.acquire().unwrap();
        assert_eq!(d, b, "released index is reused");
        assert_eq!(ports.active_ports(), vec![a, b, c]);

        // No index is issued twice while held.
        let e = ports.acquire().unwrap();
        assert!(![a, b, c].contains(&e));
    }

    #[test]
    fn out_of_range_release_is_ignored() {
        let ports = PortAllocator::new(2);
        ports.release(17);
        assert_eq!(ports.active_ports(), Vec::<usize>::new());
    }
}
