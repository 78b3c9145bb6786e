//! SmartBall OTA -- firmware upgrade over BLE or serial.
//!
//! Usage:
//!   smartball-ota run firmware.bin 3              # BLE first, serial fallback
//!   smartball-ota run firmware.bin --transport serial --port COM16
//!   smartball-ota status                          # Show device OTA state
//!   smartball-ota image firmware.bin 3 -o out.ota # Frame an image offline

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use smartball_ota::ble::{BleFactory, BleTarget};
use smartball_ota::config::OtaConfig;
use smartball_ota::report::{format_status, timestamped, ProgressPrinter};
use smartball_ota::serial::{detect_port, SerialFactory};
use smartball_ota::{describe_image, expand_tilde, load_image, write_image_file, SetupError};
use smartball_protocol::checksum::CHECK_VALUE;
use smartball_protocol::{
    verify_crc32_vector, OtaImage, ResultCode, CMD_OTA_ABORT, CMD_OTA_CONFIRM, CMD_OTA_REBOOT,
};
use smartball_session::{
    query_status, send_command, PortFactory, Progress, ProgressEvent, TransferProfile,
    TransportKind, TransportPort, UpgradeError, UpgradeSummary, Upgrader,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long `auto` looks for the device over BLE before using serial.
const AUTO_SCAN: Duration = Duration::from_secs(8);
/// Time for a fire-and-forget ABORT to leave before the link closes.
const ABORT_SETTLE: Duration = Duration::from_millis(300);

#[derive(Parser)]
#[command(name = "smartball-ota", about = "SmartBall firmware upgrade over BLE or serial")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.smartball/ota.toml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upgrade the device with a raw firmware binary
    Run {
        /// Firmware binary (no OTA header)
        firmware: PathBuf,
        /// Image version written into the header
        #[arg(default_value_t = 1)]
        version: u16,
        #[command(flatten)]
        link: LinkArgs,
    },
    /// Show the device's OTA state
    Status {
        #[command(flatten)]
        link: LinkArgs,
    },
    /// Abort a transfer in progress on the device
    Abort {
        #[command(flatten)]
        link: LinkArgs,
    },
    /// Keep the running image (ends the test-boot rollback window)
    Confirm {
        #[command(flatten)]
        link: LinkArgs,
    },
    /// Reboot the device
    Reboot {
        #[command(flatten)]
        link: LinkArgs,
    },
    /// Write the framed OTA image to a file (no device needed)
    Image {
        firmware: PathBuf,
        #[arg(default_value_t = 1)]
        version: u16,
        /// Output path
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args, Clone)]
struct LinkArgs {
    /// Link to the device
    #[arg(short, long, value_enum, default_value_t = Link::Auto)]
    transport: Link,
    /// BLE name substring (default from config, "SmartBall")
    #[arg(long)]
    name: Option<String>,
    /// BLE address, wins over --name
    #[arg(long)]
    address: Option<String>,
    /// Serial port, e.g. COM16 or /dev/ttyACM0 (auto-detected if omitted)
    #[arg(long)]
    port: Option<String>,
    /// Board does not reset when the serial port opens; skip the boot wait
    #[arg(long)]
    no_reset: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Link {
    /// BLE if the device advertises, serial otherwise
    Auto,
    Ble,
    Serial,
}

#[derive(Clone, Copy)]
enum DeviceCommand {
    Status,
    Abort,
    Confirm,
    Reboot,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs on stderr; stdout carries the progress lines
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "smartball_ota=info,smartball_session=info".into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config_path = expand_tilde(&cli.config);
    let cfg = OtaConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let ok = match cli.command {
        Commands::Run {
            firmware,
            version,
            link,
        } => run_upgrade(&cfg, &firmware, version, &link).await?,
        Commands::Status { link } => device_command(&cfg, &link, DeviceCommand::Status).await?,
        Commands::Abort { link } => device_command(&cfg, &link, DeviceCommand::Abort).await?,
        Commands::Confirm { link } => device_command(&cfg, &link, DeviceCommand::Confirm).await?,
        Commands::Reboot { link } => device_command(&cfg, &link, DeviceCommand::Reboot).await?,
        Commands::Image {
            firmware,
            version,
            output,
        } => {
            let image = write_image_file(&firmware, version, &output)?;
            println!("Wrote {}: {}", output.display(), describe_image(&image));
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_upgrade(
    cfg: &OtaConfig,
    firmware: &Path,
    version: u16,
    link: &LinkArgs,
) -> anyhow::Result<bool> {
    if verify_crc32_vector() {
        println!("CRC check: OK (test vector 0x{CHECK_VALUE:08X})");
    } else {
        println!("CRC check: WARN, self-test failed; continuing anyway");
    }
    let image = load_image(firmware, version)?;
    println!("Image: {}", describe_image(&image));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, aborting upgrade");
                cancel.cancel();
            }
        });
    }

    let (progress, rx) = Progress::channel();
    let printer = tokio::spawn(print_progress(rx));
    let result = upgrade_over(cfg, link, &image, progress, cancel).await;
    // All senders are gone once the upgrade returns; the printer drains and exits
    let _ = printer.await;

    match result {
        Ok(summary) => {
            println!(
                "{}",
                timestamped(&format!(
                    "OTA SUCCESS: {} bytes in {:.1}s, {} attempt(s){}",
                    summary.total_size,
                    summary.elapsed.as_secs_f64(),
                    summary.attempts,
                    if summary.resumed_from > 0 {
                        format!(", resumed from {}", summary.resumed_from)
                    } else {
                        String::new()
                    }
                ))
            );
            Ok(true)
        }
        Err(e) => {
            println!("{}", timestamped(&format!("OTA FAILED: {e:#}")));
            Ok(false)
        }
    }
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) {
    let mut printer = ProgressPrinter::new();
    while let Some(event) = rx.recv().await {
        if let Some(line) = printer.render(&event) {
            println!("{}", timestamped(&line));
        }
    }
}

async fn upgrade<F: PortFactory>(
    factory: F,
    handle: <F::Port as TransportPort>::Handle,
    profile: TransferProfile,
    image: &OtaImage,
    progress: Progress,
    cancel: CancellationToken,
) -> Result<UpgradeSummary, UpgradeError> {
    Upgrader::new(factory, handle, profile, progress, cancel)
        .run(image)
        .await
}

async fn upgrade_over(
    cfg: &OtaConfig,
    link: &LinkArgs,
    image: &OtaImage,
    progress: Progress,
    cancel: CancellationToken,
) -> anyhow::Result<UpgradeSummary> {
    let target = ble_target(cfg, link);

    match link.transport {
        Link::Ble => {
            let factory = BleFactory::new(cfg.ble_settings()).await?;
            let profile = cfg.profile_for(TransportKind::Ble);
            Ok(upgrade(factory, target, profile, image, progress, cancel).await?)
        }
        Link::Serial => {
            let factory = SerialFactory::new(cfg.serial_settings(link.no_reset));
            let port = serial_port(cfg, link)?;
            let profile = cfg.profile_for(TransportKind::Serial);
            Ok(upgrade(factory, port, profile, image, progress, cancel).await?)
        }
        Link::Auto => {
            if let Some(factory) = find_over_ble(cfg, &target).await {
                say(&format!("{target} found via BLE, starting BLE OTA"));
                let profile = cfg.profile_for(TransportKind::Ble);
                let result = upgrade(
                    factory,
                    target,
                    profile,
                    image,
                    progress.clone(),
                    cancel.clone(),
                )
                .await;
                match result {
                    Ok(summary) => return Ok(summary),
                    Err(e @ UpgradeError::Cancelled { .. }) => return Err(e.into()),
                    Err(e) => {
                        tracing::warn!(error = %e, "BLE upgrade failed");
                        say("BLE OTA failed, falling back to serial OTA");
                    }
                }
            } else {
                say("Using serial OTA (connect the device over USB)");
            }

            let factory = SerialFactory::new(cfg.serial_settings(link.no_reset));
            let port = serial_port(cfg, link)?;
            let profile = cfg.profile_for(TransportKind::Serial);
            Ok(upgrade(factory, port, profile, image, progress, cancel).await?)
        }
    }
}

/// A BLE factory, if an adapter exists and `target` is advertising.
async fn find_over_ble(cfg: &OtaConfig, target: &BleTarget) -> Option<BleFactory> {
    let factory = match BleFactory::new(cfg.ble_settings()).await {
        Ok(factory) => factory,
        Err(e) => {
            say(&format!("BLE unavailable ({e})"));
            return None;
        }
    };
    if factory.discover(target, AUTO_SCAN).await {
        Some(factory)
    } else {
        say(&format!("{target} not found via BLE"));
        None
    }
}

async fn device_command(
    cfg: &OtaConfig,
    link: &LinkArgs,
    cmd: DeviceCommand,
) -> anyhow::Result<bool> {
    let target = ble_target(cfg, link);
    let use_ble = match link.transport {
        Link::Ble => Some(BleFactory::new(cfg.ble_settings()).await?),
        Link::Serial => None,
        Link::Auto => find_over_ble(cfg, &target).await,
    };

    match use_ble {
        Some(factory) => {
            command_over(&factory, &target, &cfg.profile_for(TransportKind::Ble), cmd).await
        }
        None => {
            let factory = SerialFactory::new(cfg.serial_settings(link.no_reset));
            let port = serial_port(cfg, link)?;
            command_over(&factory, &port, &cfg.profile_for(TransportKind::Serial), cmd).await
        }
    }
}

async fn command_over<F: PortFactory>(
    factory: &F,
    handle: &<F::Port as TransportPort>::Handle,
    profile: &TransferProfile,
    cmd: DeviceCommand,
) -> anyhow::Result<bool> {
    let mut port = factory.open();
    port.connect(handle, profile.connect_timeout())
        .await
        .with_context(|| format!("connecting to {handle}"))?;
    let result = issue(&mut port, profile, cmd).await;
    port.disconnect().await;
    result
}

async fn issue<P: TransportPort>(
    port: &mut P,
    profile: &TransferProfile,
    cmd: DeviceCommand,
) -> anyhow::Result<bool> {
    let (opcode, name) = match cmd {
        DeviceCommand::Status => {
            let status = query_status(port, profile.response_timeout()).await?;
            println!("{}", format_status(&status));
            return Ok(true);
        }
        DeviceCommand::Abort => (CMD_OTA_ABORT, "OTA_ABORT"),
        DeviceCommand::Confirm => (CMD_OTA_CONFIRM, "OTA_CONFIRM"),
        DeviceCommand::Reboot => (CMD_OTA_REBOOT, "OTA_REBOOT"),
    };

    match send_command(port, opcode, profile.response_timeout()).await? {
        None => {
            tokio::time::sleep(ABORT_SETTLE).await;
            println!("{name} sent");
            Ok(true)
        }
        Some(ResultCode::OkStart) => {
            println!("{name}: ok");
            Ok(true)
        }
        Some(code) => {
            println!("{name}: device answered {code}");
            Ok(false)
        }
    }
}

fn ble_target(cfg: &OtaConfig, link: &LinkArgs) -> BleTarget {
    cfg.ble_target(link.name.as_deref(), link.address.as_deref())
}

/// `--port`, then the config file, then enumeration.
fn serial_port(cfg: &OtaConfig, link: &LinkArgs) -> Result<String, SetupError> {
    if let Some(port) = link.port.clone().or_else(|| cfg.serial.port.clone()) {
        return Ok(port);
    }
    let port = detect_port().ok_or(SetupError::NoSerialPort)?;
    say(&format!("Using serial port: {port}"));
    Ok(port)
}

fn say(line: &str) {
    println!("{}", timestamped(line));
}
