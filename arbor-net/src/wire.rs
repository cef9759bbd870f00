//! Wire Protocol
//!
//! Every message is a frame: a 4-byte unsigned big-endian length prefix
//! followed by that many bytes of UTF-8 payload. Reads loop until the
//! frame is complete; a clean close before the first byte ends the
//! session, a close mid-frame is an error.
//!
//! Waiting for the *start* of a frame blocks indefinitely so keep-alive
//! sessions can idle between queries. Once a frame has begun, a short
//! timeout applies to the rest of the header and body.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use thiserror::Error;

/// How long a partially read frame may stall before the read fails.
pub const MID_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum NetError {
    #[error("connection closed mid-frame")]
    Closed,

    #[error("frame read timed out")]
    TimedOut,

    #[error("frame payload is not valid utf-8")]
    Utf8,

    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
}

/// Frame a payload and send all of it.
pub fn write_frame(stream: &mut TcpStream, payload: &str) -> Result<(), NetError> {
    let bytes = payload.as_bytes();
    let mut frame = Vec::with_capacity(4 + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(bytes);
    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly before
/// starting a new frame.
pub fn read_frame(stream: &mut TcpStream) -> Result<Option<String>, NetError> {
    read_frame_timeout(stream, None)
}

/// Read one frame, bounding the wait for its first byte. Used by
/// clients that must not hang on a dead peer.
pub fn read_frame_timeout(
    stream: &mut TcpStream,
    initial: Option<Duration>,
) -> Result<Option<String>, NetError> {
    stream.set_read_timeout(initial)?;
    let mut started = false;

    let mut header = [0u8; 4];
    if !read_all(stream, &mut header, &mut started)? {
        return Ok(None);
    }

    let length = u32::from_be_bytes(header) as usize;
    let mut body = vec![0u8; length];
    read_all(stream, &mut body, &mut started)?;

    let _ = stream.set_read_timeout(None);
    String::from_utf8(body).map(Some).map_err(|_| NetError::Utf8)
}

/// Fill `buf` completely. Returns `Ok(false)` only for a clean close
/// before the frame started.
fn read_all(stream: &mut TcpStream, buf: &mut [u8], started: &mut bool) -> Result<bool, NetError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 && !*started {
                    return Ok(false);
                }
                return Err(NetError::Closed);
            }
            Ok(n) => {
                if !*started {
                    *started = true;
                    stream.set_read_timeout(Some(MID_FRAME_TIMEOUT))?;
                }
                filled += n;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(NetError::TimedOut);
            }
            Err(err) => return Err(NetError::Io(err)),
        }
    }
    Ok(true)
}
