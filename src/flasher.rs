//! Host side of the protocol.
//!
//! [`Flasher`] drives a device through sync, identify, erase, chunked writes
//! and reset. Every command is answered before the next is sent.

use core::fmt::Debug;
use core::marker::PhantomData;
use std::io::ErrorKind as IoErrorKind;

use embedded_hal::blocking::delay::DelayMs;

use crate::flash::{checksum, MemoryMap, MAX_ERASE_PAGES, PAGE_SIZE};
use crate::image::ImageSource;
use crate::protocol::{
    decode_reply, encode_command, status, Command, EraseRequest, Reply, ReplyError, WriteRequest,
    BOOT_REQUEST, MAX_CHUNK,
};
use crate::{read_within, write_all, Error, Options, SerialPort};

/// Default flash address of the application image
pub const DEFAULT_BASE_ADDRESS: u32 = 0x0800_6000;

/// Zero bytes sent to complete any partial frame on the device, each extra
/// zero reads as an empty frame
pub const SYNC_FILL: usize = 256;

/// Silence that ends a drain of stale input
const DRAIN_QUIET_MS: u32 = 20;

/// Most stale bytes a drain discards before giving up on the line
const DRAIN_LIMIT: usize = 4 * SYNC_FILL;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Step {
    Sync,
    GetCid,
    FlashErase,
    MemWrite { address: u32, len: usize },
    GoToReset,
}

/// A completed step and the retries it took
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct StepRecord {
    pub step: Step,
    pub retries: u32,
}

/// State of one attempt at pushing an image
#[derive(Clone, PartialEq, Debug)]
pub struct UpdateSession {
    pub image_len: u32,
    pub base_address: u32,
    pub start_page: u8,
    /// Pages erased to cover the image
    pub pages: u16,
    /// Bytes of the image written so far
    pub offset: u32,
    pub chip_id: Option<u16>,
    pub steps: Vec<StepRecord>,
}

impl UpdateSession {
    fn complete(&mut self, step: Step, retries: u32) {
        self.steps.push(StepRecord { step, retries });
    }

    /// Completed steps in order
    pub fn step_list(&self) -> Vec<Step> {
        self.steps.iter().map(|s| s.step).collect()
    }

    pub fn total_retries(&self) -> u32 {
        self.steps.iter().map(|s| s.retries).sum()
    }
}

pub struct Flasher<P, D, E> {
    options: Options,
    map: MemoryMap,
    port: P,
    delay: D,
    retried: u32,
    _err: PhantomData<E>,
}

impl<P, D, E> Flasher<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new flasher instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            options,
            map: MemoryMap::default(),
            port,
            delay,
            retried: 0,
            _err: PhantomData,
        }
    }

    /// Use a different device memory map
    pub fn with_map(mut self, map: MemoryMap) -> Self {
        self.map = map;
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Give back the port and delay
    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Work out the session for an image of `len` bytes without touching the device
    pub fn plan(&self, len: u32) -> Result<UpdateSession, Error<E>> {
        let base = self.options.base_address;
        let flash = self.map.flash;

        if base % PAGE_SIZE != 0 || !flash.contains(base) {
            return Err(Error::InvalidBaseAddress(base));
        }
        let start_page = (base - flash.base) / PAGE_SIZE;
        if start_page > u8::MAX as u32 {
            return Err(Error::InvalidBaseAddress(base));
        }

        let pages = len / PAGE_SIZE + (len % PAGE_SIZE != 0) as u32;
        if pages > MAX_ERASE_PAGES as u32 || !flash.contains_span(base, len) {
            return Err(Error::ImageTooLarge {
                len,
                pages,
                max: MAX_ERASE_PAGES,
            });
        }

        Ok(UpdateSession {
            image_len: len,
            base_address: base,
            start_page: start_page as u8,
            pages: pages as u16,
            offset: 0,
            chip_id: None,
            steps: Vec::new(),
        })
    }

    /// Push an image to the device
    pub fn update<S: ImageSource>(&mut self, image: S) -> Result<UpdateSession, Error<E>> {
        self.update_with_progress(image, |_, _| ())
    }

    /// Push an image to the device, calling `progress(written, total)` after each chunk
    ///
    /// The image is dropped before returning on every path.
    pub fn update_with_progress<S, F>(
        &mut self,
        mut image: S,
        mut progress: F,
    ) -> Result<UpdateSession, Error<E>>
    where
        S: ImageSource,
        F: FnMut(u32, u32),
    {
        let len = image.len();
        let mut session = self.plan(len)?;

        info!(
            "Updating {} bytes at 0x{:08x} ({} pages)",
            len, session.base_address, session.pages
        );

        self.retried = 0;
        self.sync()?;
        session.complete(Step::Sync, self.take_retries());

        if !self.options.no_identify {
            let cid = self.chip_id()?;
            info!("Chip ID: 0x{:03x}", cid);
            session.chip_id = Some(cid);
            session.complete(Step::GetCid, self.take_retries());
        }

        if session.pages > 0 {
            self.erase(session.start_page, session.pages)?;
            session.complete(Step::FlashErase, self.take_retries());

            let mut buf = [0u8; MAX_CHUNK];
            while session.offset < len {
                let want = ((len - session.offset) as usize).min(MAX_CHUNK);
                let n = read_full(&mut image, session.offset, &mut buf[..want])
                    .map_err(Error::Io)?;

                let address = session.base_address + session.offset;
                self.write(address, &buf[..n])?;

                session.offset += n as u32;
                session.complete(Step::MemWrite { address, len: n }, self.take_retries());
                progress(session.offset, len);
            }
        } else {
            debug!("Empty image, skipping erase and write");
        }

        self.reset()?;
        session.complete(Step::GoToReset, self.take_retries());

        info!(
            "Update complete ({} commands retried)",
            session.total_retries()
        );

        Ok(session)
    }

    /// Bring the device into the bootloader with its frame parser at a boundary
    pub fn sync(&mut self) -> Result<(), Error<E>> {
        // First, reset device
        if !self.options.no_reset {
            debug!("Resetting device");

            self.port.set_dtr(true)?;
            self.port.set_rts(true)?;

            self.delay.delay_ms(100u32);

            self.port.set_dtr(false)?;
            self.port.set_rts(false)?;

            self.delay.delay_ms(self.options.init_delay_ms);
        }

        debug!("Sending boot request");
        write_all(&mut self.port, &[BOOT_REQUEST])?;

        // Then complete any partial frame with empty ones
        write_all(&mut self.port, &[0u8; SYNC_FILL])?;

        self.drain()
    }

    /// Read the 12-bit device identifier
    pub fn chip_id(&mut self) -> Result<u16, Error<E>> {
        let d = self.transact(Command::GetCid, &[], 2)?;
        Ok(u16::from_le_bytes([d[0], d[1]]))
    }

    /// Erase `count` pages from flash page `start_page`
    pub fn erase(&mut self, start_page: u8, count: u16) -> Result<(), Error<E>> {
        debug!("Erasing {} pages from page {}", count, start_page);

        let req = EraseRequest {
            start_page,
            page_count: count,
        };
        let d = self.transact(Command::FlashErase, &req.encode(), 1)?;

        match d[0] {
            status::OK => Ok(()),
            status::INVALID => {
                error!("Device rejected erase of {} pages", count);
                Err(Error::InvalidSectorCount {
                    start: start_page,
                    count,
                })
            }
            s => {
                error!("Erase failed with status 0x{:02x}", s);
                Err(Error::DeviceProgrammingFailed {
                    address: self.map.page_address(start_page as u32),
                    status: s,
                })
            }
        }
    }

    /// Write one chunk of at most `MAX_CHUNK` bytes
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        debug!("Writing {} bytes at 0x{:08x}", data.len(), address);

        let crc = if self.options.no_checksum {
            None
        } else {
            Some(checksum(data))
        };
        let payload = WriteRequest {
            address,
            data,
            checksum: crc,
        }
        .encode()
        .map_err(Error::Codec)?;

        let d = self.transact(Command::MemWrite, &payload, 1)?;

        match d[0] {
            status::OK => Ok(()),
            status::INVALID => {
                error!("Device rejected address 0x{:08x}", address);
                Err(Error::InvalidAddress(address))
            }
            s => {
                error!("Write at 0x{:08x} failed with status 0x{:02x}", address, s);
                Err(Error::DeviceProgrammingFailed { address, status: s })
            }
        }
    }

    /// Restart the device, complete once the reset is acknowledged
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        self.transact(Command::GoToReset, &[], 0)?;

        // Trailing status byte, the link may already be gone
        let mut budget = self.options.response_timeout_ms;
        match read_within(
            &mut self.port,
            &mut self.delay,
            &mut budget,
            self.options.poll_delay_ms,
        ) {
            Ok(s) => debug!("Reset status 0x{:02x}", s),
            Err(e) => debug!("No status after reset ack: {}", e),
        }

        Ok(())
    }

    fn take_retries(&mut self) -> u32 {
        core::mem::replace(&mut self.retried, 0)
    }

    /// Send a command and collect the ack data, retrying on silence and
    /// framing errors
    fn transact(
        &mut self,
        command: Command,
        payload: &[u8],
        expected: usize,
    ) -> Result<Vec<u8>, Error<E>> {
        let frame = encode_command(command, payload).map_err(Error::Codec)?;
        let attempts = self.options.retries.saturating_add(1);

        for attempt in 1..=attempts {
            match self.exchange(command, &frame, expected) {
                Ok(d) => return Ok(d),
                Err(e) if e.is_retryable() => {
                    warn!(
                        "{:?} attempt {}/{} failed: {}",
                        command, attempt, attempts, e
                    );
                    if attempt < attempts {
                        self.retried += 1;
                        match self.drain() {
                            Ok(()) => (),
                            Err(Error::ResponseTimeout) => {
                                error!("Line did not settle after {:?}", command);
                                return Err(Error::DeviceUnresponsive {
                                    command,
                                    attempts: attempt,
                                });
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        error!("No usable response to {:?}", command);
        Err(Error::DeviceUnresponsive { command, attempts })
    }

    fn exchange(
        &mut self,
        command: Command,
        frame: &[u8],
        expected: usize,
    ) -> Result<Vec<u8>, Error<E>> {
        write_all(&mut self.port, frame)?;

        match self.read_reply()? {
            Reply::Ack(d) if d.len() == expected => Ok(d),
            Reply::Nack => {
                debug!("Received bootloader nack");
                Err(Error::Nack)
            }
            reply => Err(Error::UnexpectedReply { command, reply }),
        }
    }

    fn read_reply(&mut self) -> Result<Reply, Error<E>> {
        let port = &mut self.port;
        let delay = &mut self.delay;
        let poll = self.options.poll_delay_ms;
        let mut budget = self.options.response_timeout_ms;

        decode_reply(|| read_within(port, delay, &mut budget, poll)).map_err(|e| match e {
            ReplyError::Read(e) => e,
            ReplyError::Malformed(v) => {
                debug!("Received unexpected value: 0x{:02x}", v);
                Error::MalformedReply(v)
            }
        })
    }

    /// Discard input until the line has been quiet for a while
    ///
    /// Fails with `ResponseTimeout` if the line never goes quiet.
    fn drain(&mut self) -> Result<(), Error<E>> {
        let mut n = 0;
        loop {
            if n >= DRAIN_LIMIT {
                warn!("Line still busy after discarding {} bytes", n);
                return Err(Error::ResponseTimeout);
            }

            let mut budget = DRAIN_QUIET_MS;
            match read_within(
                &mut self.port,
                &mut self.delay,
                &mut budget,
                self.options.poll_delay_ms,
            ) {
                Ok(_) => n += 1,
                Err(Error::ResponseTimeout) => break,
                Err(e) => return Err(e),
            }
        }

        if n > 0 {
            debug!("Discarded {} stale bytes", n);
        }
        Ok(())
    }
}

/// Fill `buf` from the image, a short image is an error
fn read_full<S: ImageSource>(
    image: &mut S,
    offset: u32,
    buf: &mut [u8],
) -> Result<usize, IoErrorKind> {
    let mut n = 0;
    while n < buf.len() {
        match image.read_chunk(offset + n as u32, &mut buf[n..]) {
            Ok(0) => return Err(IoErrorKind::UnexpectedEof),
            Ok(r) => n += r,
            Err(e) => return Err(e.kind()),
        }
    }
    Ok(n)
}
