//! Wire format shared by the bootloader and the flasher.
//!
//! Requests are length-prefixed: `[len, command, payload...]` where `len` counts
//! every byte after itself. Replies are either an ack header `[0xA5, n]`
//! followed by `n` data bytes, or a single nack byte.

use core::convert::TryInto;

/// Positive acknowledgement, followed by a length byte and that many data bytes
pub const BL_ACK: u8 = 0xA5;
/// Negative acknowledgement
pub const BL_NACK: u8 = 0x7F;

/// Sent by the flasher after resetting the device to hold it in the bootloader
pub const BOOT_REQUEST: u8 = 0x50;

/// Ignored marker byte leading erase and write payloads
pub const REQUEST_MARKER: u8 = 0x01;

/// Largest value of the length byte
pub const MAX_FRAME_LEN: usize = 255;
/// Largest payload a single frame can carry
pub const MAX_PAYLOAD: usize = MAX_FRAME_LEN - 1;

/// Write payload bytes ahead of the data: marker, address, data length
pub const WRITE_HEADER_LEN: usize = 6;
/// Trailing checksum on write payloads
pub const CHECKSUM_LEN: usize = 4;

/// Largest chunk of image data carried by one write, kept word aligned so the
/// padding of one chunk never overlaps the next
pub const MAX_CHUNK: usize = (MAX_PAYLOAD - WRITE_HEADER_LEN - CHECKSUM_LEN) & !0x03;

/// Status bytes reported by erase and write
pub mod status {
    pub const OK: u8 = 0x00;
    pub const HAL_ERROR: u8 = 0x01;
    pub const HAL_BUSY: u8 = 0x02;
    pub const HAL_TIMEOUT: u8 = 0x03;
    /// Invalid sector count on erase, invalid address on write
    pub const INVALID: u8 = 0x04;

    /// Status byte sent after the reset ack
    pub const ADDR_VALID: u8 = 0x00;
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Command {
    /// Reads the 12-bit device identifier
    GetCid,

    /// Restarts the device
    GoToReset,

    /// Erases a run of flash pages
    FlashErase,

    /// Writes up to 244 bytes of data into flash
    MemWrite,

    /// Any other command code, ignored by the bootloader
    Unknown(u8),
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::GetCid => 0x51,
            Command::GoToReset => 0x52,
            Command::FlashErase => 0x53,
            Command::MemWrite => 0x54,
            Command::Unknown(c) => *c,
        }
    }
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        match code {
            0x51 => Command::GetCid,
            0x52 => Command::GoToReset,
            0x53 => Command::FlashErase,
            0x54 => Command::MemWrite,
            c => Command::Unknown(c),
        }
    }
}

/// A decoded request frame
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Frame {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Value of the length byte this frame was (or will be) sent with
    pub fn total_length(&self) -> usize {
        1 + self.payload.len()
    }
}

/// A decoded reply
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Reply {
    /// Ack carrying `data.len()` trailing bytes
    Ack(Vec<u8>),
    Nack,
}

#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),
    #[error("data of {0} bytes does not fit in an ack")]
    AckTooLarge(usize),
}

/// Failure while decoding a reply from a byte source
#[derive(Debug, PartialEq, Clone)]
pub enum ReplyError<E> {
    /// The byte source failed (timeout, serial error)
    Read(E),
    /// The first byte was neither ack nor nack
    Malformed(u8),
}

/// Encode a request frame
pub fn encode_command(command: Command, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let mut b = Vec::with_capacity(2 + payload.len());
    b.push((1 + payload.len()) as u8);
    b.push(command.code());
    b.extend_from_slice(payload);

    Ok(b)
}

/// Decode a request frame, pulling bytes from `next`
///
/// Unknown command codes are not an error. A zero length byte decodes to an
/// empty `Unknown(0)` frame.
pub fn decode_command<E, F>(mut next: F) -> Result<Frame, E>
where
    F: FnMut() -> Result<u8, E>,
{
    let len = next()? as usize;
    if len == 0 {
        return Ok(Frame {
            command: Command::Unknown(0),
            payload: Vec::new(),
        });
    }

    let command = Command::from(next()?);

    let mut payload = Vec::with_capacity(len - 1);
    for _ in 1..len {
        payload.push(next()?);
    }

    Ok(Frame { command, payload })
}

/// Encode an ack header, the data bytes follow as a separate transmission
pub fn encode_ack(follow_len: u8) -> [u8; 2] {
    [BL_ACK, follow_len]
}

pub fn encode_nack() -> [u8; 1] {
    [BL_NACK]
}

/// Decode a reply, pulling bytes from `next`
pub fn decode_reply<E, F>(mut next: F) -> Result<Reply, ReplyError<E>>
where
    F: FnMut() -> Result<u8, E>,
{
    match next().map_err(ReplyError::Read)? {
        BL_ACK => {
            let n = next().map_err(ReplyError::Read)?;
            let mut data = Vec::with_capacity(n as usize);
            for _ in 0..n {
                data.push(next().map_err(ReplyError::Read)?);
            }
            Ok(Reply::Ack(data))
        }
        BL_NACK => Ok(Reply::Nack),
        v => Err(ReplyError::Malformed(v)),
    }
}

/// Encode a full ack (header and data) into one buffer
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>, CodecError> {
    match reply {
        Reply::Ack(data) => {
            if data.len() > u8::MAX as usize {
                return Err(CodecError::AckTooLarge(data.len()));
            }
            let mut b = encode_ack(data.len() as u8).to_vec();
            b.extend_from_slice(data);
            Ok(b)
        }
        Reply::Nack => Ok(encode_nack().to_vec()),
    }
}

/// Flash erase request
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct EraseRequest {
    pub start_page: u8,
    pub page_count: u16,
}

impl EraseRequest {
    pub fn encode(&self) -> [u8; 4] {
        let [lo, hi] = self.page_count.to_le_bytes();
        [REQUEST_MARKER, self.start_page, lo, hi]
    }

    /// Parse an erase payload, `None` if it is too short
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 4 {
            return None;
        }

        Some(Self {
            start_page: payload[1],
            page_count: u16::from_le_bytes([payload[2], payload[3]]),
        })
    }
}

/// Memory write request
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct WriteRequest<'a> {
    pub address: u32,
    pub data: &'a [u8],
    /// Checksum over `data`, when the sender supplied one
    pub checksum: Option<u32>,
}

impl<'a> WriteRequest<'a> {
    /// Encode a write payload, appending the checksum if present
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let extra = if self.checksum.is_some() { CHECKSUM_LEN } else { 0 };
        let len = WRITE_HEADER_LEN + self.data.len() + extra;
        if self.data.len() > u8::MAX as usize || len > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(len));
        }

        let mut b = Vec::with_capacity(len);
        b.push(REQUEST_MARKER);
        b.extend_from_slice(&self.address.to_le_bytes());
        b.push(self.data.len() as u8);
        b.extend_from_slice(self.data);
        if let Some(crc) = self.checksum {
            b.extend_from_slice(&crc.to_le_bytes());
        }

        Ok(b)
    }

    /// Parse a write payload
    ///
    /// Returns `None` when the payload is shorter than its declared data
    /// length. Exactly four bytes past the data are read as a checksum, any
    /// other trailing bytes are ignored.
    pub fn parse(payload: &'a [u8]) -> Option<Self> {
        if payload.len() < WRITE_HEADER_LEN {
            return None;
        }

        let address = u32::from_le_bytes(payload[1..5].try_into().ok()?);
        let n = payload[5] as usize;

        let rest = &payload[WRITE_HEADER_LEN..];
        if rest.len() < n {
            return None;
        }
        let (data, trailer) = rest.split_at(n);

        let checksum = match trailer.len() {
            CHECKSUM_LEN => Some(u32::from_le_bytes(trailer.try_into().ok()?)),
            _ => None,
        };

        Some(Self {
            address,
            data,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(b: &[u8]) -> impl FnMut() -> Result<u8, ()> + '_ {
        let mut i = b.iter();
        move || i.next().copied().ok_or(())
    }

    #[test]
    fn command_codes() {
        assert_eq!(Command::from(0x51), Command::GetCid);
        assert_eq!(Command::from(0x54), Command::MemWrite);
        assert_eq!(Command::from(0x50), Command::Unknown(0x50));
        assert_eq!(Command::FlashErase.code(), 0x53);
        assert_eq!(Command::Unknown(0x99).code(), 0x99);
    }

    #[test]
    fn encode_get_cid() {
        assert_eq!(encode_command(Command::GetCid, &[]).unwrap(), vec![0x01, 0x51]);
    }

    #[test]
    fn command_frames_survive_the_wire() {
        for len in 0..=MAX_PAYLOAD {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let b = encode_command(Command::MemWrite, &payload).unwrap();
            assert_eq!(b[0] as usize, 1 + len);

            let f = decode_command(source(&b)).unwrap();
            assert_eq!(f.command, Command::MemWrite);
            assert_eq!(f.payload, payload);
            assert_eq!(f.total_length(), b[0] as usize);
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = [0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            encode_command(Command::MemWrite, &payload),
            Err(CodecError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn unknown_and_empty_frames() {
        let f = decode_command(source(&[0x02, 0x99, 0xAA])).unwrap();
        assert_eq!(f.command, Command::Unknown(0x99));
        assert_eq!(f.payload, vec![0xAA]);

        let f = decode_command(source(&[0x00, 0x51])).unwrap();
        assert_eq!(f.command, Command::Unknown(0));
        assert!(f.payload.is_empty());
    }

    #[test]
    fn truncated_frame_reports_source_error() {
        assert_eq!(decode_command(source(&[0x05, 0x53, 0x01])), Err(()));
    }

    #[test]
    fn replies() {
        assert_eq!(
            decode_reply(source(&[0xA5, 0x02, 0x17, 0x04])),
            Ok(Reply::Ack(vec![0x17, 0x04]))
        );
        assert_eq!(decode_reply(source(&[0xA5, 0x00])), Ok(Reply::Ack(vec![])));
        assert_eq!(decode_reply(source(&[0x7F])), Ok(Reply::Nack));
        assert_eq!(decode_reply(source(&[0x79])), Err(ReplyError::Malformed(0x79)));
        assert_eq!(decode_reply(source(&[0xA5, 0x02, 0x17])), Err(ReplyError::Read(())));

        assert_eq!(encode_ack(1), [0xA5, 0x01]);
        assert_eq!(encode_nack(), [0x7F]);
        assert_eq!(
            encode_reply(&Reply::Ack(vec![0x00])).unwrap(),
            vec![0xA5, 0x01, 0x00]
        );
    }

    #[test]
    fn erase_request_layout() {
        let req = EraseRequest {
            start_page: 0,
            page_count: 4,
        };
        let b = encode_command(Command::FlashErase, &req.encode()).unwrap();
        assert_eq!(b, vec![0x05, 0x53, 0x01, 0x00, 0x04, 0x00]);

        assert_eq!(EraseRequest::parse(&b[2..]), Some(req));
        assert_eq!(EraseRequest::parse(&[0x01, 0x00]), None);
    }

    #[test]
    fn write_request_layout() {
        let data = [0x11, 0x22, 0x33, 0x44, 0x55];
        let req = WriteRequest {
            address: 0x0800_8000,
            data: &data,
            checksum: Some(0xEFBB_CE40),
        };
        let p = req.encode().unwrap();
        assert_eq!(
            p,
            vec![
                0x01, 0x00, 0x80, 0x00, 0x08, 0x05, 0x11, 0x22, 0x33, 0x44, 0x55, 0x40, 0xCE,
                0xBB, 0xEF
            ]
        );
        assert_eq!(WriteRequest::parse(&p), Some(req.clone()));

        // Without the trailer there is no checksum
        let plain = WriteRequest::parse(&p[..11]).unwrap();
        assert_eq!(plain.data, &data);
        assert_eq!(plain.checksum, None);

        // Declared length longer than what arrived
        assert_eq!(WriteRequest::parse(&p[..8]), None);
    }

    #[test]
    fn max_chunk_fits_a_frame() {
        assert_eq!(MAX_CHUNK % 4, 0);

        let data = [0xAB; MAX_CHUNK];
        let req = WriteRequest {
            address: 0x0800_6000,
            data: &data,
            checksum: Some(0),
        };
        let p = req.encode().unwrap();
        assert!(encode_command(Command::MemWrite, &p).is_ok());
    }
}
