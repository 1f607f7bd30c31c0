use std::io::{self, ErrorKind, Read, Write};

use prost::Message;

use crate::protocol::Envelope;

/// Frames above this size are refused in both directions.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Writes `envelope` prefixed with its length as a 4 bytes big endian integer.
pub fn write_frame<W: Write>(writer: &mut W, envelope: &Envelope) -> io::Result<()> {
    let len = envelope.encoded_len();
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {} bytes", len, MAX_FRAME_LEN),
        ));
    }

    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    envelope
        .encode(&mut buf)
        .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;

    writer.write_all(&buf)?;
    writer.flush()
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Envelope> {
    let mut len = [0; 4];
    reader.read_exact(&mut len)?;

    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {} bytes", len, MAX_FRAME_LEN),
        ));
    }

    let mut buf = vec![0; len];
    reader.read_exact(&mut buf)?;

    Envelope::decode(&buf[..]).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}
