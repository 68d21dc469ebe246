//! Flash programming primitives used by the bootloader.
//!
//! Everything that touches the hardware goes through [`FlashHal`] and
//! [`Target`]. [`FlashProgrammer`] owns the HAL and enforces address range,
//! page count and word padding rules on top of it.

use crc::{Crc, CRC_32_MPEG_2};

use crate::protocol::status;

/// Erasable unit of flash
pub const PAGE_SIZE: u32 = 128;
/// Programmable unit of flash
pub const WORD_SIZE: u32 = 4;
/// Upper bound on the pages a single erase may cover
pub const MAX_ERASE_PAGES: u16 = 512;
/// Value of erased flash cells
pub const ERASED: u8 = 0xFF;

/// Mask applied to the identifier register to obtain the device id
pub const CHIP_ID_MASK: u32 = 0x0FFF;

/// Half open address range `[base, base + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u32,
    pub size: u32,
}

impl Region {
    pub const fn new(base: u32, size: u32) -> Self {
        Self { base, size }
    }

    /// First address past the region
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && address < self.end()
    }

    /// Check `[start, start + len)` lies within the region
    pub fn contains_span(&self, start: u32, len: u32) -> bool {
        match start.checked_add(len) {
            Some(end) => self.contains(start) && end <= self.end(),
            None => false,
        }
    }
}

/// Addressable memory of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMap {
    pub sram: Region,
    pub flash: Region,
}

impl MemoryMap {
    /// STM32L073RZ: 192 KiB flash, 20 KiB SRAM
    pub const STM32L073RZ: MemoryMap = MemoryMap {
        sram: Region::new(0x2000_0000, 20 * 1024),
        flash: Region::new(0x0800_0000, 192 * 1024),
    };

    /// True if `address` lies in SRAM or flash
    pub fn validate_address(&self, address: u32) -> bool {
        self.sram.contains(address) || self.flash.contains(address)
    }

    /// Address of a flash page
    pub fn page_address(&self, page: u32) -> u32 {
        self.flash.base + page * PAGE_SIZE
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::STM32L073RZ
    }
}

/// Failure reported by the flash controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    #[error("flash controller error")]
    Error,
    #[error("flash controller busy")]
    Busy,
    #[error("flash controller timeout")]
    Timeout,
}

impl HalError {
    pub fn status(&self) -> u8 {
        match self {
            HalError::Error => status::HAL_ERROR,
            HalError::Busy => status::HAL_BUSY,
            HalError::Timeout => status::HAL_TIMEOUT,
        }
    }
}

/// Raw flash controller access
pub trait FlashHal {
    fn unlock(&mut self) -> Result<(), HalError>;

    fn lock(&mut self) -> Result<(), HalError>;

    /// Erase `count` pages starting at the page containing `address`.
    ///
    /// # Safety
    /// `address` must be page aligned and the whole run must lie in flash that
    /// is not executing, the caller must hold the controller unlocked.
    unsafe fn erase(&mut self, address: u32, count: u16) -> Result<(), HalError>;

    /// Program one word.
    ///
    /// # Safety
    /// `address` must be word aligned, inside flash, with the controller unlocked.
    unsafe fn program_word(&mut self, address: u32, word: u32) -> Result<(), HalError>;

    /// Read back flash contents
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), HalError>;
}

/// Core control of the device
pub trait Target {
    /// Raw contents of the device identifier register
    fn id_register(&self) -> u32;

    /// Restart the device, on hardware this does not return
    fn system_reset(&mut self);

    /// Hand control to an application.
    ///
    /// # Safety
    /// `entry` must be the reset handler of a valid image and `stack_pointer`
    /// its initial stack. Interrupts and peripherals are torn down before the
    /// jump, on hardware this does not return.
    unsafe fn jump(&mut self, stack_pointer: u32, entry: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlashError {
    #[error("invalid address")]
    InvalidAddress,
    #[error("invalid sector count")]
    InvalidSectorCount,
    #[error("hardware error: {0}")]
    Hardware(HalError),
}

impl FlashError {
    /// Status byte reported over the wire
    pub fn status(&self) -> u8 {
        match self {
            FlashError::InvalidAddress | FlashError::InvalidSectorCount => status::INVALID,
            FlashError::Hardware(e) => e.status(),
        }
    }
}

impl From<HalError> for FlashError {
    fn from(e: HalError) -> Self {
        FlashError::Hardware(e)
    }
}

/// Status byte for the result of an erase or write
pub fn status_of(r: &Result<(), FlashError>) -> u8 {
    match r {
        Ok(_) => status::OK,
        Err(e) => e.status(),
    }
}

/// Range-checked erase and write on top of a [`FlashHal`]
pub struct FlashProgrammer<F> {
    hal: F,
    map: MemoryMap,
}

impl<F: FlashHal> FlashProgrammer<F> {
    pub fn new(hal: F, map: MemoryMap) -> Self {
        Self { hal, map }
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    pub fn hal(&self) -> &F {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut F {
        &mut self.hal
    }

    pub fn validate_address(&self, address: u32) -> bool {
        self.map.validate_address(address)
    }

    /// Erase `page_count` pages starting at flash page `start_page`
    pub fn erase_pages(&mut self, start_page: u8, page_count: u16) -> Result<(), FlashError> {
        if page_count > MAX_ERASE_PAGES {
            warn!("Refusing to erase {} pages", page_count);
            return Err(FlashError::InvalidSectorCount);
        }

        let address = self.map.page_address(start_page as u32);
        if !self
            .map
            .flash
            .contains_span(address, page_count as u32 * PAGE_SIZE)
        {
            warn!(
                "Erase of {} pages at 0x{:08x} leaves flash",
                page_count, address
            );
            return Err(FlashError::InvalidSectorCount);
        }

        if page_count == 0 {
            return Ok(());
        }

        debug!("Erasing {} pages at 0x{:08x}", page_count, address);

        self.hal.unlock()?;
        // Safety: the run is page aligned and inside flash, checked above
        let r = unsafe { self.hal.erase(address, page_count) };
        let l = self.hal.lock();

        // An erase failure outranks a relock failure
        r.and(l).map_err(FlashError::from)
    }

    /// Write `data` at `address` one word at a time
    ///
    /// The final partial word is padded with erased bytes. The first failing
    /// word stops the write, words before it stay programmed.
    pub fn write_span(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        if !self.validate_address(address)
            || !self.map.flash.contains_span(address, data.len() as u32)
        {
            warn!(
                "Rejecting write of {} bytes at 0x{:08x}",
                data.len(),
                address
            );
            return Err(FlashError::InvalidAddress);
        }

        debug!("Writing {} bytes at 0x{:08x}", data.len(), address);

        self.hal.unlock()?;

        let mut r = Ok(());
        for (i, chunk) in data.chunks(WORD_SIZE as usize).enumerate() {
            let mut word = [ERASED; WORD_SIZE as usize];
            word[..chunk.len()].copy_from_slice(chunk);

            let a = address + i as u32 * WORD_SIZE;
            // Safety: the span lies inside flash, checked above
            if let Err(e) = unsafe { self.hal.program_word(a, u32::from_le_bytes(word)) } {
                error!("Programming word at 0x{:08x} failed: {:?}", a, e);
                r = Err(FlashError::Hardware(e));
                break;
            }
        }

        let l = self.hal.lock();

        r.and(l.map_err(FlashError::from))
    }

    /// Read back flash contents
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if !self.map.flash.contains_span(address, buf.len() as u32) {
            return Err(FlashError::InvalidAddress);
        }
        self.hal.read(address, buf)?;
        Ok(())
    }
}

/// CRC as computed by the STM32 CRC unit fed one zero-extended word per byte
const STM32_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Checksum of a write payload
pub fn checksum(data: &[u8]) -> u32 {
    let mut digest = STM32_CRC.digest();
    for b in data {
        digest.update(&(*b as u32).to_be_bytes());
    }
    digest.finalize()
}

/// Compare `data` against a host supplied checksum
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    checksum(data) == expected
}
