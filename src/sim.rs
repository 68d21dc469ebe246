//! In-memory flash and target, for tests and for emulating a device on a
//! host serial port.

use crate::flash::{FlashHal, HalError, Region, Target, ERASED, PAGE_SIZE, WORD_SIZE};

/// Flash array held in memory
///
/// Programming behaves like NOR flash: bits can only be cleared, erase sets a
/// page back to `0xFF`.
#[derive(Debug, Clone)]
pub struct MemFlash {
    region: Region,
    data: Vec<u8>,
    unlocked: bool,
    erases: usize,
    words: Vec<(u32, u32)>,
    fail_at: Option<u32>,
    lock_error: Option<HalError>,
}

impl MemFlash {
    /// Create an erased flash covering `region`
    pub fn new(region: Region) -> Self {
        Self {
            region,
            data: vec![ERASED; region.size as usize],
            unlocked: false,
            erases: 0,
            words: Vec::new(),
            fail_at: None,
            lock_error: None,
        }
    }

    /// Raw contents from the start of the region
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Contents of `[address, address + len)`
    pub fn slice(&self, address: u32, len: usize) -> &[u8] {
        let o = (address - self.region.base) as usize;
        &self.data[o..o + len]
    }

    /// Overwrite contents directly, bypassing the controller
    pub fn fill(&mut self, address: u32, data: &[u8]) {
        let o = (address - self.region.base) as usize;
        self.data[o..o + data.len()].copy_from_slice(data);
    }

    /// Make programming the word at `address` fail
    pub fn fail_at(&mut self, address: u32) {
        self.fail_at = Some(address);
    }

    /// Make relocking the controller fail with `e`
    pub fn fail_lock(&mut self, e: HalError) {
        self.lock_error = Some(e);
    }

    /// Number of erase operations issued
    pub fn erase_count(&self) -> usize {
        self.erases
    }

    /// Every word programmed, in order
    pub fn words(&self) -> &[(u32, u32)] {
        &self.words
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    fn offset(&self, address: u32, len: u32) -> Result<usize, HalError> {
        if !self.region.contains_span(address, len) {
            return Err(HalError::Error);
        }
        Ok((address - self.region.base) as usize)
    }
}

impl FlashHal for MemFlash {
    fn unlock(&mut self) -> Result<(), HalError> {
        self.unlocked = true;
        Ok(())
    }

    fn lock(&mut self) -> Result<(), HalError> {
        if let Some(e) = self.lock_error {
            return Err(e);
        }
        self.unlocked = false;
        Ok(())
    }

    unsafe fn erase(&mut self, address: u32, count: u16) -> Result<(), HalError> {
        if !self.unlocked || address % PAGE_SIZE != 0 {
            return Err(HalError::Error);
        }
        let len = count as u32 * PAGE_SIZE;
        let o = self.offset(address, len)?;

        for b in &mut self.data[o..o + len as usize] {
            *b = ERASED;
        }
        self.erases += 1;

        Ok(())
    }

    unsafe fn program_word(&mut self, address: u32, word: u32) -> Result<(), HalError> {
        if !self.unlocked || address % WORD_SIZE != 0 || self.fail_at == Some(address) {
            return Err(HalError::Error);
        }
        let o = self.offset(address, WORD_SIZE)?;

        for (d, b) in self.data[o..o + 4].iter_mut().zip(word.to_le_bytes().iter()) {
            *d &= *b;
        }
        self.words.push((address, word));

        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), HalError> {
        let o = self.offset(address, buf.len() as u32)?;
        buf.copy_from_slice(&self.data[o..o + buf.len()]);
        Ok(())
    }
}

/// Target with a fixed identifier that records resets and jumps
#[derive(Debug, Default)]
pub struct SimTarget {
    id: u32,
    resets: usize,
    jumped: Option<(u32, u32)>,
}

impl SimTarget {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Stack pointer and entry of the last application jump
    pub fn jumped(&self) -> Option<(u32, u32)> {
        self.jumped
    }
}

impl Target for SimTarget {
    fn id_register(&self) -> u32 {
        self.id
    }

    fn system_reset(&mut self) {
        info!("Simulated device reset");
        self.resets += 1;
    }

    unsafe fn jump(&mut self, stack_pointer: u32, entry: u32) {
        info!(
            "Simulated jump to 0x{:08x} (sp 0x{:08x})",
            entry, stack_pointer
        );
        self.jumped = Some((stack_pointer, entry));
    }
}
