//! Bootloader side of the protocol.
//!
//! [`Bootloader`] reads one frame at a time from the serial port, runs the
//! matching handler against the flash and answers before reading the next.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::flash::{
    status_of, verify_checksum, FlashError, FlashHal, FlashProgrammer, Target, CHIP_ID_MASK,
};
use crate::protocol::{
    decode_command, encode_ack, encode_nack, status, Command, EraseRequest, Frame, WriteRequest,
    BOOT_REQUEST,
};
use crate::{read_within, write_all, Error};

/// Shortest frame length accepted for a memory write
pub const MEM_WRITE_MIN_LEN: usize = 7;

/// Default application vector table
pub const DEFAULT_APP_BASE: u32 = 0x0800_6000;

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct DeviceOptions {
    /// Time to wait for a boot request before starting the application
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3000"))]
    pub boot_window_ms: u32,

    /// Delay before resetting or jumping to the application
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub settle_delay_ms: u32,

    /// Discard frames that do not complete in this time, 0 waits forever
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0"))]
    pub frame_timeout_ms: u32,

    /// Period to poll the serial port while a timeout is running
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub frame_poll_ms: u32,

    /// Nack memory writes that do not carry a checksum
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub require_checksum: bool,

    /// Address of the application vector table
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "0x08006000", parse(try_from_str = crate::parse_u32))
    )]
    pub app_base: u32,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            boot_window_ms: 3000,
            settle_delay_ms: 1000,
            frame_timeout_ms: 0,
            frame_poll_ms: 1,
            require_checksum: false,
            app_base: DEFAULT_APP_BASE,
        }
    }
}

/// Outcome of handling one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dispatch {
    /// Request carried out and answered
    Handled(Command),
    /// Request refused with a nack
    Nacked(Command),
    /// Request too short to act on, nothing sent
    Dropped(Command),
    /// Unknown command code, nothing sent
    Ignored(u8),
    /// Frame did not complete within the frame timeout
    Discarded,
    /// Reset requested, the device is restarting
    Reset,
}

pub struct Bootloader<P, F, T, D> {
    options: DeviceOptions,
    port: P,
    flash: FlashProgrammer<F>,
    target: T,
    delay: D,
}

impl<P, F, T, D, E> Bootloader<P, F, T, D>
where
    P: Read<u8, Error = E> + Write<u8, Error = E>,
    F: FlashHal,
    T: Target,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a bootloader owning the port, flash and target
    pub fn new(
        port: P,
        flash: FlashProgrammer<F>,
        target: T,
        delay: D,
        options: DeviceOptions,
    ) -> Self {
        Self {
            options,
            port,
            flash,
            target,
            delay,
        }
    }

    pub fn flash(&self) -> &FlashProgrammer<F> {
        &self.flash
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Give back the owned parts
    pub fn release(self) -> (P, FlashProgrammer<F>, T, D) {
        (self.port, self.flash, self.target, self.delay)
    }

    /// Power-on entry point
    ///
    /// Waits for a boot request, otherwise starts the application. Falls back
    /// to the command loop when there is no application to start.
    pub fn start(&mut self) -> Result<(), Error<E>> {
        debug!(
            "Waiting {} ms for boot request",
            self.options.boot_window_ms
        );

        let mut budget = self.options.boot_window_ms;
        loop {
            match read_within(
                &mut self.port,
                &mut self.delay,
                &mut budget,
                self.options.frame_poll_ms,
            ) {
                Ok(BOOT_REQUEST) => {
                    info!("Boot request received");
                    return self.run();
                }
                Ok(v) => debug!("Ignoring 0x{:02x} in boot window", v),
                Err(Error::ResponseTimeout) => break,
                Err(e) => return Err(e),
            }
        }

        match self.boot_application() {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("No application to start ({}), staying in bootloader", e);
                self.run()
            }
        }
    }

    /// Validate the application vector table and jump to it
    pub fn boot_application(&mut self) -> Result<(), FlashError> {
        let base = self.options.app_base;

        let mut vectors = [0u8; 8];
        self.flash.read(base, &mut vectors)?;
        let sp = u32::from_le_bytes([vectors[0], vectors[1], vectors[2], vectors[3]]);
        let entry = u32::from_le_bytes([vectors[4], vectors[5], vectors[6], vectors[7]]);

        let map = self.flash.map();
        // Full descending stack, the initial pointer may be the end of SRAM
        let sp_ok = map.sram.contains(sp) || sp == map.sram.end();
        // Thumb bit set on the reset handler
        if !sp_ok || !map.flash.contains(entry & !1) {
            return Err(FlashError::InvalidAddress);
        }

        info!("Jumping to application at 0x{:08x}", entry);
        self.delay.delay_ms(self.options.settle_delay_ms);

        // Safety: the vector table points into flash and SRAM, checked above
        unsafe { self.target.jump(sp, entry) };

        Ok(())
    }

    /// Handle frames until a reset is requested
    pub fn run(&mut self) -> Result<(), Error<E>> {
        loop {
            if self.step()? == Dispatch::Reset {
                return Ok(());
            }
        }
    }

    /// Read and handle a single frame
    pub fn step(&mut self) -> Result<Dispatch, Error<E>> {
        let frame = match self.read_frame()? {
            Some(f) => f,
            None => return Ok(Dispatch::Discarded),
        };

        match frame.command {
            Command::GetCid => self.handle_get_cid(),
            Command::GoToReset => self.handle_reset(),
            Command::FlashErase => self.handle_erase(&frame),
            Command::MemWrite => self.handle_write(&frame),
            Command::Unknown(0) => {
                trace!("Empty frame");
                Ok(Dispatch::Ignored(0))
            }
            Command::Unknown(c) => {
                warn!("Invalid command 0x{:02x}", c);
                Ok(Dispatch::Ignored(c))
            }
        }
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, Error<E>> {
        let port = &mut self.port;
        let delay = &mut self.delay;
        let timeout = self.options.frame_timeout_ms;
        let poll = self.options.frame_poll_ms;

        // The length byte is awaited forever, the rest within the timeout
        let mut started = false;
        let mut budget = timeout;

        let r = decode_command(|| {
            if !started || timeout == 0 {
                started = true;
                return block!(port.read()).map_err(Error::Serial);
            }
            read_within(port, delay, &mut budget, poll)
        });

        match r {
            Ok(f) => Ok(Some(f)),
            Err(Error::ResponseTimeout) => {
                warn!("Discarding partial frame after {} ms", timeout);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn send_ack(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        write_all(&mut self.port, &encode_ack(data.len() as u8))?;
        if !data.is_empty() {
            write_all(&mut self.port, data)?;
        }
        Ok(())
    }

    fn handle_get_cid(&mut self) -> Result<Dispatch, Error<E>> {
        let cid = (self.target.id_register() & CHIP_ID_MASK) as u16;
        debug!("Chip ID request, replying 0x{:03x}", cid);

        self.send_ack(&cid.to_le_bytes())?;

        Ok(Dispatch::Handled(Command::GetCid))
    }

    fn handle_reset(&mut self) -> Result<Dispatch, Error<E>> {
        info!("Reset command received");

        self.send_ack(&[])?;
        // Status byte outside the ack's declared length
        write_all(&mut self.port, &[status::ADDR_VALID])?;

        self.delay.delay_ms(self.options.settle_delay_ms);
        self.target.system_reset();

        Ok(Dispatch::Reset)
    }

    fn handle_erase(&mut self, frame: &Frame) -> Result<Dispatch, Error<E>> {
        let req = match EraseRequest::parse(&frame.payload) {
            Some(r) => r,
            None => {
                warn!("Short erase request ({} bytes)", frame.total_length());
                return Ok(Dispatch::Dropped(Command::FlashErase));
            }
        };

        debug!(
            "Flash erase: {} pages from page {}",
            req.page_count, req.start_page
        );
        let s = status_of(&self.flash.erase_pages(req.start_page, req.page_count));

        self.send_ack(&[s])?;

        Ok(Dispatch::Handled(Command::FlashErase))
    }

    fn handle_write(&mut self, frame: &Frame) -> Result<Dispatch, Error<E>> {
        if frame.total_length() < MEM_WRITE_MIN_LEN {
            warn!("Short memory write ({} bytes)", frame.total_length());
            return Ok(Dispatch::Dropped(Command::MemWrite));
        }

        let req = match WriteRequest::parse(&frame.payload) {
            Some(r) => r,
            None => {
                warn!("Truncated memory write");
                return Ok(Dispatch::Dropped(Command::MemWrite));
            }
        };

        let checksum_ok = match req.checksum {
            Some(c) => verify_checksum(req.data, c),
            None => !self.options.require_checksum,
        };
        if !checksum_ok {
            warn!("Checksum mismatch on write to 0x{:08x}", req.address);
            write_all(&mut self.port, &encode_nack())?;
            return Ok(Dispatch::Nacked(Command::MemWrite));
        }

        debug!(
            "Memory write: {} bytes at 0x{:08x}",
            req.data.len(),
            req.address
        );

        // Ack on receipt, the status follows once the write completes
        write_all(&mut self.port, &encode_ack(1))?;

        let s = status_of(&self.flash.write_span(req.address, req.data));
        write_all(&mut self.port, &[s])?;

        Ok(Dispatch::Handled(Command::MemWrite))
    }
}
