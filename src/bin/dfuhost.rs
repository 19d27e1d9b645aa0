//! CLI front end for `dfuhost`.
//!
//! Argument parsing, logging configuration, and device enumeration live
//! here, deliberately kept out of the library core. It wires a [`clap`]-parsed
//! invocation into one [`dfuhost::session::Session`] action over a
//! [`dfuhost::channel::Channel`] it opens itself, then maps the result onto a
//! process exit code.

use std::sync::Arc;

use clap::{ArgGroup, Parser};
use dfuhost::channel::{Channel, ChannelSettings, Parity, StopBits, UartChannel};
use dfuhost::command::ChecksumKind;
use dfuhost::error::{DfuError, DfuResult};
use dfuhost::image::mtbdfu::{self, GenerateAction};
use dfuhost::session::Session;

/// Parse a decimal or `0x`-prefixed hexadecimal integer, the same tolerant
/// numeric-literal convention `.mtbdfu` documents use (§3) and the flasher
/// CLIs in the reference pack (`rblhost`, `stm32-an3155`) accept on the
/// command line.
fn parse_number<T>(s: &str) -> Result<T, String>
where
    T: TryFrom<u64>,
{
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    let value = u64::from_str_radix(digits, radix).map_err(|e| format!("invalid number {s:?}: {e}"))?;
    T::try_from(value).map_err(|_| format!("{s:?} out of range"))
}

#[derive(Parser, Debug)]
#[command(name = "dfuhost", version, about = "Host-side DFU driver for I2C/SPI/UART bootloader targets")]
#[command(group(
    ArgGroup::new("action")
        .args(["program_device", "verify_device", "erase_device", "custom_command", "display_hw", "generate_mtbdfu"])
        .required(true)
        .multiple(false)
))]
struct Args {
    /// Program a `.cyacd2` image onto the device.
    #[arg(long, value_name = "FILE")]
    program_device: Option<String>,
    /// Verify the device's flash against a `.cyacd2` image.
    #[arg(long, value_name = "FILE")]
    verify_device: Option<String>,
    /// Erase the rows a `.cyacd2` image covers.
    #[arg(long, value_name = "FILE")]
    erase_device: Option<String>,
    /// Execute a declarative `.mtbdfu` session script.
    #[arg(long, value_name = "FILE")]
    custom_command: Option<String>,
    /// Enter the bootloader, print the device's silicon id/revision/version, exit.
    #[arg(long)]
    display_hw: bool,
    /// Author a `.mtbdfu` session script bound to `--mtbdfu-data-file` instead of
    /// talking to a device.
    #[arg(long, value_name = "OUT")]
    generate_mtbdfu: Option<String>,

    #[command(flatten)]
    channel: ChannelArgs,

    /// Bridge-enumeration filter string. Accepted for interface compatibility
    /// with the original CLI surface; device/bridge enumeration is out of
    /// scope for this crate, so it is never consulted.
    #[arg(long)]
    hwid: Option<String>,
    /// Raise the log filter to debug.
    #[arg(long)]
    debug: bool,

    /// `--generate-mtbdfu`: `.mtbdfu` `APPInfo`/"File Version" field.
    #[arg(long, value_parser = parse_number::<u32>, default_value_t = 1)]
    file_version: u32,
    /// `--generate-mtbdfu`: `.mtbdfu` `APPInfo`/"Product Id" field.
    #[arg(long, value_parser = parse_number::<u32>, default_value_t = 0)]
    product_id: u32,
    /// `--generate-mtbdfu`: application id for the generated SetMetadata command.
    #[arg(long, value_parser = parse_number::<u8>)]
    application_id: Option<u8>,
    /// `--generate-mtbdfu`: application start address for SetMetadata.
    #[arg(long, value_parser = parse_number::<u32>, default_value_t = 0)]
    application_start: u32,
    /// `--generate-mtbdfu`: application size for SetMetadata.
    #[arg(long, value_parser = parse_number::<u32>, default_value_t = 0)]
    application_length: u32,
    /// `--generate-mtbdfu`: `.mtbdfu` `APPInfo`/"Packet Checksum Type" field
    /// (`0` = SUM16, `1` = CRC16).
    #[arg(long, value_parser = parse_number::<u8>, default_value_t = 0)]
    checksum_type: u8,
    /// `--generate-mtbdfu`: Intel-HEX file the generated session streams from.
    #[arg(long, value_name = "FILE")]
    mtbdfu_data_file: Option<String>,
}

#[derive(clap::Args, Debug, Default)]
struct ChannelArgs {
    /// Serial port device path, used by the UART channel.
    #[arg(long, value_name = "PATH")]
    port: Option<String>,

    /// I²C slave address in `[8, 120]`.
    #[arg(long, value_parser = parse_number::<u8>)]
    i2c_address: Option<u8>,
    /// I²C bus clock in kHz.
    #[arg(long, value_parser = parse_number::<u32>)]
    i2c_speed: Option<u32>,

    /// SPI clock in MHz.
    #[arg(long, value_parser = parse_number::<u32>)]
    spi_clockspeed: Option<u32>,
    /// SPI mode, `0`-`3`.
    #[arg(long)]
    spi_mode: Option<u8>,
    /// Clock out the least-significant bit first instead of MSB-first.
    #[arg(long)]
    spi_lsb_first: bool,

    /// UART baud rate.
    #[arg(long, value_parser = parse_number::<u32>)]
    uart_baudrate: Option<u32>,
    /// UART data bits, `7` or `8`.
    #[arg(long, default_value_t = 8)]
    uart_databits: u8,
    /// UART parity: `None`, `Odd`, or `Even`.
    #[arg(long, default_value = "None")]
    uart_paritytype: String,
    /// UART stop bits: `1`, `1.5`, or `2`.
    #[arg(long, default_value = "1")]
    uart_stopbits: String,
}

impl ChannelArgs {
    fn selected_count(&self) -> u32 {
        self.i2c_address.is_some() as u32 + self.spi_clockspeed.is_some() as u32 + self.uart_baudrate.is_some() as u32
    }

    fn settings(&self) -> DfuResult<ChannelSettings> {
        if self.i2c_address.is_some() {
            return Ok(ChannelSettings::I2c {
                freq_hz: self.i2c_speed.unwrap_or(100_000) * 1_000,
                addr: self.i2c_address.unwrap(),
            });
        }
        if let Some(clockspeed) = self.spi_clockspeed {
            let mode = match self.spi_mode.unwrap_or(0) {
                0 => dfuhost::channel::SpiMode::Mode0,
                1 => dfuhost::channel::SpiMode::Mode1,
                2 => dfuhost::channel::SpiMode::Mode2,
                3 => dfuhost::channel::SpiMode::Mode3,
                other => {
                    return Err(DfuError::ConfigError { detail: format!("--spi-mode must be 0-3, got {other}") })
                }
            };
            let bit_order = if self.spi_lsb_first { dfuhost::channel::SpiBitOrder::Lsb } else { dfuhost::channel::SpiBitOrder::Msb };
            return Ok(ChannelSettings::Spi { freq_hz: clockspeed * 1_000_000, mode, bit_order });
        }
        if let Some(baud) = self.uart_baudrate {
            let parity = match self.uart_paritytype.as_str() {
                "None" => Parity::None,
                "Odd" => Parity::Odd,
                "Even" => Parity::Even,
                other => return Err(DfuError::ConfigError { detail: format!("invalid --uart-paritytype {other:?}") }),
            };
            let stop_bits = match self.uart_stopbits.as_str() {
                "1" => StopBits::One,
                "1.5" => StopBits::OnePointFive,
                "2" => StopBits::Two,
                other => return Err(DfuError::ConfigError { detail: format!("invalid --uart-stopbits {other:?}") }),
            };
            if !matches!(self.uart_databits, 7 | 8) {
                return Err(DfuError::ConfigError { detail: format!("--uart-databits must be 7 or 8, got {}", self.uart_databits) });
            }
            return Ok(ChannelSettings::Uart { baud, data_bits: self.uart_databits, parity, stop_bits });
        }
        Err(DfuError::ConfigError { detail: "exactly one of --i2c-address, --spi-clockspeed, or --uart-baudrate is required".into() })
    }
}

/// MTU assumed for the channels this binary can actually open. A real bridge
/// library would report this per-device; 64 matches the reference tool's
/// default packet buffer.
const DEFAULT_MTU: u32 = 64;

fn open_channel(settings: &ChannelSettings, port: Option<&str>, abort: Arc<std::sync::atomic::AtomicBool>) -> DfuResult<Box<dyn Channel>> {
    match settings {
        ChannelSettings::Uart { baud, .. } => {
            let path = port.ok_or_else(|| DfuError::ConfigError { detail: "--port is required for a UART channel".into() })?;
            Ok(Box::new(UartChannel::open_port(path, *baud, DEFAULT_MTU, abort)?))
        }
        ChannelSettings::I2c { .. } | ChannelSettings::Spi { .. } => Err(DfuError::ConfigError {
            detail: "I2C/SPI channels require a bridge implementation not linked into this standalone binary; \
                     link dfuhost::channel::I2cChannel/SpiChannel against your bridge crate instead"
                .into(),
        }),
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let abort_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

    if let Some(out) = &args.generate_mtbdfu {
        let data_file = args
            .mtbdfu_data_file
            .as_deref()
            .ok_or_else(|| DfuError::ConfigError { detail: "--generate-mtbdfu requires --mtbdfu-data-file".into() })?;
        let doc = mtbdfu::generate(
            args.file_version,
            args.product_id,
            args.checksum_type,
            args.application_id,
            args.application_start,
            args.application_length,
            data_file,
            GenerateAction::Program,
        );
        let text = serde_json::to_string_pretty(&doc)?;
        std::fs::write(out, text)?;
        log::info!(target: "dfuhost", "wrote {out}");
        return Ok(());
    }

    if args.channel.selected_count() != 1 {
        return Err(DfuError::ConfigError {
            detail: "exactly one channel flag group (i2c/spi/uart) is required".into(),
        }
        .into());
    }
    let settings = args.channel.settings()?;
    let mut channel = open_channel(&settings, args.channel.port.as_deref(), abort_flag.clone())?;

    let session = Session::new();
    let mut sink = |percent: f64| log::info!(target: "dfuhost", "progress: {percent:.1}%");

    if args.display_hw {
        let info = session.display_hw(channel.as_mut(), ChecksumKind::Sum16)?;
        println!(
            "silicon id: 0x{:08X}  silicon rev: 0x{:02X}  bootloader version: {}.{}.{}",
            info.silicon_id, info.silicon_rev, info.bootloader_version[0], info.bootloader_version[1], info.bootloader_version[2]
        );
        return Ok(());
    }
    if let Some(file) = &args.program_device {
        session.program(file, channel.as_mut(), &mut sink)?;
        return Ok(());
    }
    if let Some(file) = &args.verify_device {
        session.verify(file, channel.as_mut(), &mut sink)?;
        return Ok(());
    }
    if let Some(file) = &args.erase_device {
        session.erase(file, channel.as_mut(), &mut sink)?;
        return Ok(());
    }
    if let Some(file) = &args.custom_command {
        session.send_command(file, channel.as_mut(), &mut sink)?;
        return Ok(());
    }
    unreachable!("clap's \"action\" group guarantees exactly one branch above matched")
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .format_timestamp_millis()
        .parse_default_env()
        .init();

    ctrlc_abort_hook();

    match run(&args) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            log::error!(target: "dfuhost", "{err}");
            let code = match err.downcast_ref::<DfuError>() {
                Some(dfu_err) => dfu_err.exit_code() & 0xFF,
                None => 1,
            };
            std::process::exit(code as i32);
        }
    }
}

/// No-op placeholder for wiring a Ctrl-C handler to [`Session::abort`] when
/// this binary is embedded in a larger CLI; kept separate from `run` so a
/// future signal handler only needs to capture a cloned `Session`.
fn ctrlc_abort_hook() {}
