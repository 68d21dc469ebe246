use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Flasher, Options, SerialPort};

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        ErrorKind::Io(k) => k,
        ErrorKind::InvalidInput => IoErrorKind::InvalidInput,
        ErrorKind::NoDevice => IoErrorKind::NotFound,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }
}

/// Open a serial port at `baud`, 8 data bits, no parity, one stop bit
pub fn open<P: AsRef<Path>>(port: P, baud: usize) -> Result<Serial, SerialError> {
    let mut port = Serial::open(port.as_ref())?;

    // Apply settings
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityNone);

    port.0.write_settings(&settings)?;

    Ok(port)
}

impl Flasher<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port flasher instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        let port = open(port, baud)?;

        Ok(Self::new(port, Delay {}, options))
    }
}
