//! Firmware image providers for the flasher.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Source of an opaque firmware image of known length
///
/// The flasher only reads forwards, one chunk after another.
pub trait ImageSource {
    /// Image length in bytes
    fn len(&self) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes at `offset`, returning the count read
    fn read_chunk(&mut self, offset: u32, buf: &mut [u8]) -> io::Result<usize>;
}

impl<S: ImageSource + ?Sized> ImageSource for Box<S> {
    fn len(&self) -> u32 {
        (**self).len()
    }

    fn read_chunk(&mut self, offset: u32, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_chunk(offset, buf)
    }
}

/// Image held in memory
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryImage(pub Vec<u8>);

impl ImageSource for MemoryImage {
    fn len(&self) -> u32 {
        self.0.len() as u32
    }

    fn read_chunk(&mut self, offset: u32, buf: &mut [u8]) -> io::Result<usize> {
        let o = (offset as usize).min(self.0.len());
        let n = buf.len().min(self.0.len() - o);
        buf[..n].copy_from_slice(&self.0[o..o + n]);
        Ok(n)
    }
}

/// Image read from a file, the file stays open until the image is dropped
#[derive(Debug)]
pub struct FileImage {
    file: File,
    len: u32,
    pos: u64,
}

impl FileImage {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len > u32::MAX as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "image larger than 4 GiB",
            ));
        }

        debug!("Opened image {} ({} bytes)", path.as_ref().display(), len);

        Ok(Self {
            file,
            len: len as u32,
            pos: 0,
        })
    }
}

impl ImageSource for FileImage {
    fn len(&self) -> u32 {
        self.len
    }

    fn read_chunk(&mut self, offset: u32, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos != offset as u64 {
            self.pos = self.file.seek(SeekFrom::Start(offset as u64))?;
        }

        // Fill as much of buf as the file allows
        let mut n = 0;
        while n < buf.len() {
            match self.file.read(&mut buf[n..])? {
                0 => break,
                r => n += r,
            }
        }
        self.pos += n as u64;

        Ok(n)
    }
}
