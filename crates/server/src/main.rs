//! usbipd
//!
//! Exports USB devices bound to `usbip-host` over the USB/IP protocol.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::setup_logging;
use server::config::ServerConfig;
use server::network::UsbIpDaemon;
use server::service;
use server::usb::{NetlinkUeventSource, UdevMonitor};
use server::{SysfsBinder, UsbBinder};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbipd")]
#[command(author, version, about = "USB/IP export daemon")]
#[command(long_about = "
Tracks USB devices through sysfs and kernel uevents and serves the devices
bound to usbip-host to importing peers over USB/IP.

EXAMPLES:
    # Run the daemon with the default config
    usbipd

    # Show which devices are bound to usbip-host
    usbipd list

    # Export a device
    usbipd bind 3-2.1

    # Stop exporting it
    usbipd unbind 3-2.1

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-passthrough/server.toml
    3. /etc/usbip-passthrough/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the USB/IP daemon (default)
    Run,
    /// List USB devices and their export state
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Bind a device to usbip-host
    Bind { bus_id: String },
    /// Unbind a device from usbip-host
    Unbind { bus_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ServerConfig::default();
        let path = ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        let path = PathBuf::from(shellexpand::tilde(path).as_ref());
        ServerConfig::load(Some(path)).context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config).await,
        Command::List { json } => list_devices(&config, json),
        Command::Bind { bus_id } => {
            SysfsBinder::new(config.sysfs_layout())
                .bind(&bus_id)
                .with_context(|| format!("Failed to bind {bus_id}"))?;
            println!("Bound {bus_id} to usbip-host");
            Ok(())
        }
        Command::Unbind { bus_id } => {
            SysfsBinder::new(config.sysfs_layout())
                .unbind(&bus_id)
                .with_context(|| format!("Failed to unbind {bus_id}"))?;
            println!("Unbound {bus_id} from usbip-host");
            Ok(())
        }
    }
}

fn list_devices(config: &ServerConfig, json: bool) -> Result<()> {
    let info = SysfsBinder::new(config.sysfs_layout())
        .get_bind_info()
        .context("Failed to enumerate USB devices")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    if info.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }
    println!("{:<12} {:<24} {:>4} {:>4}  EXPORTED", "BUSID", "DEVICE", "BUS", "DEV");
    for entry in info {
        println!(
            "{:<12} {:<24} {:>4} {:>4}  {}",
            entry.bus_id,
            entry.device_path.display(),
            entry.busnum,
            entry.devnum,
            if entry.bound { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn run_daemon(config: ServerConfig) -> Result<()> {
    info!("usbipd v{}", env!("CARGO_PKG_VERSION"));

    let layout = config.sysfs_layout();
    let shutdown = CancellationToken::new();

    let monitor = UdevMonitor::new(layout.clone(), config.monitor_options())
        .context("Failed to scan USB devices")?;
    let source = NetlinkUeventSource::open().context("Failed to open uevent socket")?;
    let monitor_handle = monitor.spawn(source, shutdown.clone());

    let binder: Option<Arc<dyn UsbBinder>> = config
        .usbipd
        .export_enabled
        .then(|| Arc::new(SysfsBinder::new(layout.clone())) as Arc<dyn UsbBinder>);

    let daemon = UsbIpDaemon::bind(
        config.server.bind_addr.as_str(),
        Arc::new(monitor),
        binder,
        layout,
        config.daemon_options(),
    )
    .await
    .with_context(|| format!("Failed to listen on {}", config.server.bind_addr))?;
    info!("Listening on: {}", daemon.local_addr()?);

    let daemon_handle = tokio::spawn(daemon.run(shutdown.clone()));
    let watchdog = service::spawn_watchdog(shutdown.clone());

    if config.server.service_mode || service::is_systemd() {
        service::notify_ready().context("Failed to notify systemd ready")?;
        service::notify_status("Serving USB/IP requests")?;
    }

    wait_for_signal().await?;
    info!("Shutting down gracefully...");
    if let Err(e) = service::notify_stopping() {
        warn!("Failed to notify systemd stopping: {:#}", e);
    }
    shutdown.cancel();

    if let Err(e) = daemon_handle.await {
        error!("Daemon task failed: {}", e);
    }
    if let Err(e) = monitor_handle.await {
        error!("Monitor task failed: {}", e);
    }
    if let Some(watchdog) = watchdog {
        let _ = watchdog.await;
    }

    info!("usbipd stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| anyhow!("Failed to install SIGTERM handler: {e}"))?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to wait for Ctrl+C")?,
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}
