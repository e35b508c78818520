//! Reliable byte streaming over a socket. TCP may deliver a buffer in pieces,
//! so every read and write here loops until it has moved the full count (or hit
//! a clean EOF where one is allowed).

use std::io::{ErrorKind, Read, Write};

use crate::Result;

/// Read exactly `n` bytes from `stream`.
///
/// # Errors
/// returns an IO error if the stream errors or ends before `n` bytes arrive
pub fn recv_exact<R: Read>(stream: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read up to `n` bytes from `stream`, stopping early at EOF.
///
/// Returns however many bytes arrived before the stream ended; short reads are
/// not an error here, the caller decides whether the count is acceptable.
pub fn recv_up_to<R: Read>(stream: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut got = 0;
    while got < n {
        match stream.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(r) => got += r,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    buf.truncate(got);
    Ok(buf)
}

/// Read from `stream` until EOF.
pub fn recv_to_eof<R: Read>(stream: &mut R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Write all of `bytes` to `stream` and flush.
pub fn send_all<W: Write>(stream: &mut W, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes)?;
    stream.flush()?;
    Ok(())
}
