#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::io::BufRead;
use std::io::ErrorKind as IoErrorKind;
use std::sync::mpsc::channel;
use std::thread;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::{Delay, Serial};

use stm32_uart_bootloader::linux;
use stm32_uart_bootloader::service::{LogStatus, UpdateRequest, UpdateService};
use stm32_uart_bootloader::sim::{MemFlash, SimTarget};
use stm32_uart_bootloader::{
    parse_u32, Bootloader, DeviceOptions, FileImage, FlashProgrammer, Flasher, ImageSource,
    MemoryMap, Options,
};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    command: Command,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Write a firmware image and restart the device
    Flash {
        /// Raw binary image
        file: String,
    },
    /// Read the chip ID
    Cid,
    /// Restart the device
    Reset,
    /// Flash each image path read from stdin
    Watch,
    /// Run the bootloader against an emulated flash on the serial port
    Emulate {
        #[structopt(flatten)]
        device: DeviceOptions,

        /// Value of the emulated device ID register
        #[structopt(long, default_value = "0x0417", parse(try_from_str = parse_u32))]
        chip_id: u32,
    },
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn connect(
    port: &str,
    baud: usize,
    options: Options,
) -> anyhow::Result<Flasher<Serial, Delay, IoErrorKind>> {
    info!("Connecting to serial port");

    Flasher::linux(port, baud, options)
        .map_err(|e| anyhow!("error connecting to serial port {}: {:?}", port, e))
}

fn run(o: Args) -> anyhow::Result<()> {
    let Args {
        command,
        port,
        baud,
        options,
        ..
    } = o;

    match command {
        Command::Flash { file } => {
            let image = FileImage::open(&file).with_context(|| format!("opening {}", file))?;
            info!(
                "Flashing {} ({})",
                file,
                bytefmt::format(image.len() as u64)
            );

            let mut p = connect(&port, baud, options)?;

            let bar = ProgressBar::new(image.len() as u64);
            bar.set_style(
                ProgressStyle::default_bar().template(
                    "[{elapsed_precise}] [{wide_bar}] {bytes:>8}/{total_bytes:>8} (eta {eta})",
                ),
            );

            let session = p
                .update_with_progress(image, |written, _| bar.set_position(written as u64))
                .map_err(|e| anyhow!("update failed: {}", e))?;

            bar.finish_and_clear();
            info!(
                "Wrote {} pages at 0x{:08x} with {} retries",
                session.pages,
                session.base_address,
                session.total_retries()
            );
        }
        Command::Cid => {
            let mut p = connect(&port, baud, options)?;
            p.sync()
                .map_err(|e| anyhow!("error connecting to bootloader: {}", e))?;

            let id = p
                .chip_id()
                .map_err(|e| anyhow!("error reading chip ID: {}", e))?;
            info!("ID: {}", hex::encode(id.to_be_bytes()));
        }
        Command::Reset => {
            let mut p = connect(&port, baud, options)?;
            p.sync()
                .map_err(|e| anyhow!("error connecting to bootloader: {}", e))?;

            p.reset()
                .map_err(|e| anyhow!("error resetting device: {}", e))?;
            info!("Device reset");
        }
        Command::Watch => {
            let p = connect(&port, baud, options)?;
            let (tx, rx) = channel();

            thread::spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let path = match line {
                        Ok(l) if !l.trim().is_empty() => l.trim().to_string(),
                        Ok(_) => continue,
                        Err(_) => break,
                    };
                    match FileImage::open(&path) {
                        Ok(image) => {
                            if tx.send(UpdateRequest::new(&path, image)).is_err() {
                                break;
                            }
                        }
                        Err(e) => error!("Error opening {}: {}", path, e),
                    }
                }
            });

            UpdateService::new(p, rx, LogStatus).run();
        }
        Command::Emulate { device, chip_id } => emulate(&port, baud, device, chip_id)?,
    }

    Ok(())
}

fn emulate(port: &str, baud: usize, options: DeviceOptions, chip_id: u32) -> anyhow::Result<()> {
    let serial = linux::open(port, baud)
        .map_err(|e| anyhow!("error opening serial port {}: {:?}", port, e))?;

    let map = MemoryMap::STM32L073RZ;
    let flash = FlashProgrammer::new(MemFlash::new(map.flash), map);

    let mut l = Bootloader::new(serial, flash, SimTarget::new(chip_id), Delay {}, options);

    info!("Emulating bootloader on {}", port);

    // Every return from start is a restart of the emulated device
    loop {
        l.start()
            .map_err(|e| anyhow!("bootloader stopped: {}", e))?;
    }
}
