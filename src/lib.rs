//! STM32 UART Bootloader.
//!
//! Both ends of a small length-framed update protocol: the command
//! interpreter that runs in the bootloader on the target ([`device`]) and the
//! flasher that pushes an image into it over a serial link ([`flasher`]).

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;
#[cfg(feature = "linux")]
extern crate serial_core;

#[cfg(feature = "linux")]
pub mod linux;

pub mod device;
pub mod flash;
pub mod flasher;
pub mod image;
pub mod protocol;
pub mod service;
pub mod sim;

#[cfg(test)]
mod mock;

pub use device::{Bootloader, DeviceOptions, Dispatch};
pub use flash::{FlashError, FlashHal, FlashProgrammer, HalError, MemoryMap, Region, Target};
pub use flasher::{Flasher, Step, UpdateSession};
pub use image::{FileImage, ImageSource, MemoryImage};
pub use protocol::{Command, Frame, Reply};

/// Serial port for the flasher, with the control lines used to reset the target
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("nack received")]
    Nack,

    #[error("response timeout")]
    ResponseTimeout,

    #[error("malformed reply (first byte 0x{0:02x})")]
    MalformedReply(u8),

    #[error("unexpected reply to {command:?}: {reply:?}")]
    UnexpectedReply { command: Command, reply: Reply },

    #[error("{0}")]
    Codec(protocol::CodecError),

    #[error("image of {len} bytes needs {pages} pages, at most {max} can be erased")]
    ImageTooLarge { len: u32, pages: u32, max: u16 },

    #[error("invalid base address 0x{0:08x}")]
    InvalidBaseAddress(u32),

    #[error("device unresponsive to {command:?} after {attempts} attempts")]
    DeviceUnresponsive { command: Command, attempts: u32 },

    #[error("device rejected address 0x{0:08x}")]
    InvalidAddress(u32),

    #[error("device rejected erase of {count} pages from page {start}")]
    InvalidSectorCount { start: u8, count: u16 },

    #[error("device programming failed at 0x{address:08x} (status 0x{status:02x})")]
    DeviceProgrammingFailed { address: u32, status: u8 },

    #[error("image read failed: {0:?}")]
    Io(std::io::ErrorKind),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError> Error<SerialError> {
    /// Errors that another attempt at the same command may clear
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Nack
                | Error::ResponseTimeout
                | Error::MalformedReply(_)
                | Error::UnexpectedReply { .. }
        )
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init before sending the boot request
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub init_delay_ms: u32,

    /// Attempts after the first before giving up on a command
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub retries: u32,

    /// Flash address the image is written to
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "0x08006000", parse(try_from_str = parse_u32))
    )]
    pub base_address: u32,

    /// Do not append checksums to memory writes
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_checksum: bool,

    /// Skip reading the chip ID before erasing
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_identify: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 3000,
            poll_delay_ms: 1,
            init_delay_ms: 10,
            retries: 3,
            base_address: flasher::DEFAULT_BASE_ADDRESS,
            no_checksum: false,
            no_identify: false,
        }
    }
}

/// Read one byte, polling until `budget_ms` runs out
pub(crate) fn read_within<P, D, E>(
    port: &mut P,
    delay: &mut D,
    budget_ms: &mut u32,
    poll_ms: u32,
) -> Result<u8, Error<E>>
where
    P: Read<u8, Error = E>,
    D: DelayMs<u32>,
{
    let poll_ms = poll_ms.max(1);

    loop {
        match port.read() {
            Err(nb::Error::WouldBlock) => (),
            Err(nb::Error::Other(e)) => return Err(e.into()),
            Ok(v) => return Ok(v),
        }

        if *budget_ms == 0 {
            return Err(Error::ResponseTimeout);
        }

        let d = poll_ms.min(*budget_ms);
        delay.delay_ms(d);
        *budget_ms -= d;
    }
}

/// Write a buffer as one transmission
pub(crate) fn write_all<P, E>(port: &mut P, data: &[u8]) -> Result<(), Error<E>>
where
    P: Write<u8, Error = E>,
{
    for b in data {
        block!(port.write(*b))?;
    }
    block!(port.flush())?;
    Ok(())
}

/// Parse a decimal or `0x` prefixed hexadecimal integer
pub fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addresses() {
        assert_eq!(parse_u32("0x08006000"), Ok(0x0800_6000));
        assert_eq!(parse_u32("0X10"), Ok(16));
        assert_eq!(parse_u32("4096"), Ok(4096));
        assert!(parse_u32("0xZZ").is_err());
    }

    #[test]
    fn retryable_errors() {
        assert!(Error::<()>::Nack.is_retryable());
        assert!(Error::<()>::ResponseTimeout.is_retryable());
        assert!(Error::<()>::MalformedReply(0x12).is_retryable());
        assert!(!Error::<()>::Serial(()).is_retryable());
        assert!(!Error::<()>::InvalidAddress(0).is_retryable());
    }
}
