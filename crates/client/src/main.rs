//! usbip-client
//!
//! Attaches devices exported by a remote usbipd to the local VHCI driver.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client::config::ClientConfig;
use client::{SysfsAttacher, TcpExporter, UsbAttacher, UsbExporter, list_remote_devices};
use common::setup_logging;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "usbip-client")]
#[command(author, version, about = "USB/IP import client")]
#[command(long_about = "
Imports USB devices exported by a remote usbipd into the local vhci_hcd
driver. Requires the vhci-hcd kernel module and write access to sysfs.

EXAMPLES:
    # Show what a host offers
    usbip-client list-remote 192.168.1.20

    # Attach one of its devices
    usbip-client attach 192.168.1.20 3-2.1

    # Show attached devices
    usbip-client port

    # Detach VHCI port 0
    usbip-client detach 0

    # Ask a peer daemon to export one of its devices first
    usbip-client export 192.168.1.20 3-2.1

CONFIGURATION:
    The client looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-passthrough/client.toml
    3. /etc/usbip-passthrough/client.toml
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
    /// Import a remote device
    Attach {
        host: String,
        bus_id: String,
        /// Remote usbipd port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Detach a VHCI port
    Detach { port: u32 },
    /// Show attached devices
    Port {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List the devices a remote usbipd offers
    ListRemote {
        host: String,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        json: bool,
    },
    /// Ask a remote usbipd to export one of its devices
    Export {
        host: String,
        bus_id: String,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Ask a remote usbipd to stop exporting a device
    Unexport {
        host: String,
        bus_id: String,
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ClientConfig::default();
        let path = ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        let path = PathBuf::from(shellexpand::tilde(path).as_ref());
        ClientConfig::load(Some(path)).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.client.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    let Some(command) = args.command else {
        println!("No command given, see --help");
        return Ok(());
    };
    let default_port = config.client.default_port;

    match command {
        Command::Attach { host, bus_id, port } => {
            let rhport = attacher(&config)
                .attach(&host, &bus_id, port.unwrap_or(default_port))
                .with_context(|| format!("Failed to attach {bus_id} from {host}"))?;
            println!("Attached {host}/{bus_id} to port {rhport}");
            Ok(())
        }
        Command::Detach { port } => {
            attacher(&config)
                .detach(port)
                .with_context(|| format!("Failed to detach port {port}"))?;
            println!("Detached port {port}");
            Ok(())
        }
        Command::Port { json } => show_ports(&config, json),
        Command::ListRemote { host, port, json } => {
            list_remote(&config, &host, port.unwrap_or(default_port), json)
        }
        Command::Export { host, bus_id, port } => {
            TcpExporter::new(config.connect_timeout())
                .export(&host, port.unwrap_or(default_port), &bus_id)
                .with_context(|| format!("Failed to export {bus_id} on {host}"))?;
            println!("{host} now exports {bus_id}");
            Ok(())
        }
        Command::Unexport { host, bus_id, port } => {
            TcpExporter::new(config.connect_timeout())
                .unexport(&host, port.unwrap_or(default_port), &bus_id)
                .with_context(|| format!("Failed to unexport {bus_id} on {host}"))?;
            println!("{host} no longer exports {bus_id}");
            Ok(())
        }
    }
}

fn attacher(config: &ClientConfig) -> SysfsAttacher {
    SysfsAttacher::new(
        config.sysfs_layout(),
        config.state_dir(),
        config.connect_timeout(),
    )
}

fn show_ports(config: &ClientConfig, json: bool) -> Result<()> {
    let info = attacher(config)
        .get_attach_info()
        .context("Failed to read VHCI status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    if info.is_empty() {
        println!("No attached devices.");
        return Ok(());
    }
    println!("{:<5} {:<6} {:<10} {:<30}", "PORT", "HUB", "LOCAL", "REMOTE");
    for entry in info {
        let remote = entry
            .remote
            .map(|r| format!("{}:{}/{}", r.host, r.port, r.bus_id))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<5} {:<6} {:<10} {:<30}",
            entry.port,
            format!("{:?}", entry.hub),
            entry.local_bus_id,
            remote
        );
    }
    Ok(())
}

fn list_remote(config: &ClientConfig, host: &str, port: u16, json: bool) -> Result<()> {
    let devices = list_remote_devices(host, port, config.connect_timeout())
        .with_context(|| format!("Failed to list devices on {host}"))?;

    if json {
        let descriptors: Vec<_> = devices.iter().map(|d| &d.descriptor).collect();
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("{host} exports no devices.");
        return Ok(());
    }
    println!("{:<12} {:<9} {:<10} {}", "BUSID", "ID", "SPEED", "INTERFACES");
    for device in devices {
        let d = &device.descriptor;
        let interfaces: Vec<String> = device
            .interfaces
            .iter()
            .map(|i| format!("{:02x}/{:02x}/{:02x}", i.class, i.sub_class, i.protocol))
            .collect();
        println!(
            "{:<12} {:04x}:{:04x} {:<10} {}",
            d.bus_id,
            d.id_vendor,
            d.id_product,
            format!("{:?}", d.speed),
            interfaces.join(" ")
        );
    }
    Ok(())
}
