//! Serial ports and delays for tests

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::SerialPort;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockError {
    Disconnected,
}

/// Port replaying a fixed script of received bytes
///
/// `None` entries in the script read as one `WouldBlock` each.
#[derive(Debug, Default)]
pub struct ScriptPort {
    pub rx: VecDeque<Option<u8>>,
    pub tx: Vec<u8>,
    /// Indices into `tx` where a flush happened
    pub flushes: Vec<usize>,
    pub resets: usize,
}

impl ScriptPort {
    pub fn new(rx: &[u8]) -> Self {
        let mut p = Self::default();
        p.push(rx);
        p
    }

    pub fn push(&mut self, rx: &[u8]) -> &mut Self {
        self.rx.extend(rx.iter().map(|b| Some(*b)));
        self
    }

    /// Go quiet for `polls` reads
    pub fn pause(&mut self, polls: usize) -> &mut Self {
        self.rx.extend(std::iter::repeat(None).take(polls));
        self
    }

    /// Bytes written, split at each flush
    pub fn transmissions(&self) -> Vec<Vec<u8>> {
        let mut start = 0;
        let mut out = Vec::new();
        for end in &self.flushes {
            if *end > start {
                out.push(self.tx[start..*end].to_vec());
            }
            start = *end;
        }
        if start < self.tx.len() {
            out.push(self.tx[start..].to_vec());
        }
        out
    }
}

impl Read<u8> for ScriptPort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        self.rx.pop_front().flatten().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for ScriptPort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        self.flushes.push(self.tx.len());
        Ok(())
    }
}

impl SerialPort<MockError> for ScriptPort {
    fn set_rts(&mut self, _level: bool) -> Result<(), MockError> {
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), MockError> {
        if level {
            self.resets += 1;
        }
        Ok(())
    }
}

/// Port on a line that never goes quiet, every read returns a byte
#[derive(Debug, Default)]
pub struct NoisePort {
    pub reads: usize,
    pub tx: Vec<u8>,
}

impl Read<u8> for NoisePort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        self.reads += 1;
        Ok(0x2E)
    }
}

impl Write<u8> for NoisePort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        Ok(())
    }
}

impl SerialPort<MockError> for NoisePort {
    fn set_rts(&mut self, _level: bool) -> Result<(), MockError> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), MockError> {
        Ok(())
    }
}

/// One end of an in-memory serial link
#[derive(Debug)]
pub struct LinkPort {
    tx: Sender<u8>,
    rx: Receiver<u8>,
}

/// Create two connected ports
pub fn link() -> (LinkPort, LinkPort) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();
    (
        LinkPort { tx: a_tx, rx: a_rx },
        LinkPort { tx: b_tx, rx: b_rx },
    )
}

impl Read<u8> for LinkPort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        match self.rx.try_recv() {
            Ok(b) => Ok(b),
            Err(TryRecvError::Empty) => {
                std::thread::yield_now();
                Err(nb::Error::WouldBlock)
            }
            Err(TryRecvError::Disconnected) => Err(nb::Error::Other(MockError::Disconnected)),
        }
    }
}

impl Write<u8> for LinkPort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        self.tx
            .send(word)
            .map_err(|_| nb::Error::Other(MockError::Disconnected))
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        Ok(())
    }
}

impl SerialPort<MockError> for LinkPort {
    fn set_rts(&mut self, _level: bool) -> Result<(), MockError> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), MockError> {
        Ok(())
    }
}

/// Delay that really sleeps, for use against a device on another thread
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl DelayMs<u32> for StdDelay {
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Delay that returns immediately and counts the requested time
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay {
    pub total_ms: u64,
}

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += ms as u64;
    }
}
