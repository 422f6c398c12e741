#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use usblink_receiver::client::DEFAULT_HEARTBEAT_INTERVAL;
use usblink_receiver::{ReceiverApp, ReceiverClient, VirtualDeviceManager};
use usblink_vdev::{NoopPortBinder, PortBinder, ShellPortBinder};

const VHCI_SYSFS_PATH: &str = "/sys/devices/platform/vhci_hcd.0";
const ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(about = "Imports remote USB mass-storage devices over TCP")]
#[command(disable_help_flag = true)]
struct Args {
    /// USB sender host.
    #[arg(short, long, default_value = "127.0.0.1")]
    host: String,

    /// Print help.
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// USB sender port.
    #[arg(short, long, default_value_t = 3240)]
    port: u16,

    /// List available devices and exit.
    #[arg(short, long)]
    list: bool,

    /// Import a specific device by bus id, then keep serving it.
    #[arg(short, long, value_name = "BUSID")]
    import: Option<String>,

    /// Seconds between reconnect attempts after a lost connection.
    #[arg(long, default_value_t = 5)]
    reconnect_secs: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        error!(%err, "receiver failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))
        .context("failed to install SIGINT handler")?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))
        .context("failed to install SIGTERM handler")?;

    let binder: Arc<dyn PortBinder> = if Path::new(VHCI_SYSFS_PATH).exists() {
        Arc::new(ShellPortBinder::new())
    } else {
        warn!(path = VHCI_SYSFS_PATH, "vhci_hcd not present, port binding stubbed");
        Arc::new(NoopPortBinder)
    };

    let client = ReceiverClient::new();
    let app = ReceiverApp::new(client.clone(), VirtualDeviceManager::new(binder));

    // One-shot modes drive the dialog explicitly instead of auto-importing.
    if args.list || args.import.is_some() {
        app.set_auto_import(false);
    }

    client
        .connect(&args.host, args.port)
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    client
        .request_device_list()
        .context("failed to request device list")?;

    if args.list {
        let devices = app
            .wait_for_device_list(ONE_SHOT_TIMEOUT)
            .context("no device list received")?;
        info!(count = devices.len(), "device list complete");
        client.disconnect();
        return Ok(());
    }

    if let Some(bus_id) = &args.import {
        // Wait for the list so the import can build matching descriptors.
        let devices = app
            .wait_for_device_list(ONE_SHOT_TIMEOUT)
            .context("no device list received")?;
        let info = devices
            .iter()
            .find(|device| &device.busid == bus_id)
            .with_context(|| format!("device {bus_id} not offered by the sender"))?
            .clone();
        anyhow::ensure!(app.import(info), "import of {bus_id} failed locally");
        let (success, error) = app
            .wait_for_import_result(ONE_SHOT_TIMEOUT)
            .context("no import response received")?;
        anyhow::ensure!(
            success,
            "sender rejected import: {}",
            error.unwrap_or_default()
        );
        info!(%bus_id, "device imported");
    }

    client.start_heartbeat(DEFAULT_HEARTBEAT_INTERVAL);
    info!("usblink receiver running");

    let reconnect_interval = Duration::from_secs(args.reconnect_secs.max(1));
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));

        if !client.is_connected() {
            warn!("connection lost, reconnecting");
            // Wait out the interval in short steps so a shutdown signal is
            // honored promptly.
            let deadline = Instant::now() + reconnect_interval;
            while Instant::now() < deadline {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(STOP_POLL_INTERVAL);
            }
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            client.disconnect();
            match client.connect(&args.host, args.port) {
                Ok(()) => {
                    info!("reconnected");
                    // The session dialog restarts from the device list.
                    let _ = client.request_device_list();
                    client.start_heartbeat(DEFAULT_HEARTBEAT_INTERVAL);
                }
                Err(err) => warn!(%err, "reconnect failed"),
            }
        }
    }

    info!("shutting down");
    client.disconnect();
    app.manager().shutdown();
    Ok(())
}
