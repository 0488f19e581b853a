//! Frame-level helpers shared by the stream transports.
//!
//! A frame is a length header, a generation stamp, and the payload bytes,
//! all little-endian:
//!
//! ```text
//! [ len: u64 | stamp: u64 | payload: len bytes ]
//! ```

use std::io::{self, Read, Write};

/// A decoded frame: the sender's generation stamp and the payload.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    pub stamp: usize,
    pub payload: Vec<u8>,
}

/// Writes one frame to the stream.
pub fn write_frame<W: Write>(stream: &mut W, stamp: usize, payload: &[u8]) -> io::Result<()> {
    stream.write_all(&(payload.len() as u64).to_le_bytes())?;
    stream.write_all(&(stamp as u64).to_le_bytes())?;
    stream.write_all(payload)
}

/// Reads one complete frame, retrying through read timeouts until the
/// frame is whole.
pub fn read_frame<R: Read>(stream: &mut R) -> io::Result<Frame> {
    let len = read_u64(stream)?;
    finish_frame(stream, len as usize)
}

/// Attempts to begin reading a frame. Returns `Ok(None)` when no bytes are
/// immediately available; once the header has started to arrive, blocks
/// until the frame is whole.
pub fn try_read_frame<R: Read>(stream: &mut R) -> io::Result<Option<Frame>> {
    let mut header = [0u8; 8];
    match stream.read(&mut header) {
        Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
        Ok(n) => {
            fill(stream, &mut header[n..])?;
            finish_frame(stream, u64::from_le_bytes(header) as usize).map(Some)
        }
        Err(e) if would_block(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

fn finish_frame<R: Read>(stream: &mut R, len: usize) -> io::Result<Frame> {
    let stamp = read_u64(stream)? as usize;
    let mut payload = vec![0; len];
    fill(stream, &mut payload)?;
    Ok(Frame { stamp, payload })
}

fn read_u64<R: Read>(stream: &mut R) -> io::Result<u64> {
    let mut buffer = [0u8; 8];
    fill(stream, &mut buffer)?;
    Ok(u64::from_le_bytes(buffer))
}

/// Fills the buffer completely, retrying through timeouts and
/// interruptions. EOF mid-frame is an error.
fn fill<R: Read>(stream: &mut R, mut buffer: &mut [u8]) -> io::Result<()> {
    while !buffer.is_empty() {
        match stream.read(buffer) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => buffer = &mut buffer[n..],
            Err(e) if would_block(&e) || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
