//! Terminal I/O primitives (spec §4.1): raw-mode scope, PTY fork-exec,
//! single-byte reads, and UTF-8 boundary reconstruction.

use std::io::Read;
use std::os::fd::BorrowedFd;

use nix::sys::termios::{self, SetArg, Termios};

use crate::error::{PiasError, Result};

/// Scoped raw-mode acquisition for a terminal fd. Captures the current
/// attributes on entry, disables local echo and enters raw mode; restores
/// the original attributes on drop, on every exit path (panic-unwind
/// included).
///
/// Grounded in the original's `no_echo` context manager: it clears only the
/// `ECHO` local flag and calls the equivalent of `tty.setraw`.
pub struct RawModeGuard {
    fd: i32,
    original: Termios,
}

impl RawModeGuard {
    /// Enter raw mode on the given fd (typically 0, stdin).
    pub fn enable(fd: i32) -> Result<Self> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let original = termios::tcgetattr(borrowed)?;

        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(borrowed, SetArg::TCSADRAIN, &raw)?;

        Ok(RawModeGuard { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let _ = termios::tcsetattr(borrowed, SetArg::TCSADRAIN, &self.original);
    }
}

/// Current controlling-terminal size, falling back to 80x24 on failure.
pub fn terminal_size() -> (u16, u16) {
    crossterm::terminal::size().unwrap_or((80, 24))
}

/// Read exactly one byte. An empty read (EOF) is reported as
/// `PiasError::PeerClosed` — this is the signal callers use to detect that
/// the peer has gone away.
pub fn read_one_byte(r: &mut dyn Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    let n = r.read(&mut buf)?;
    if n == 0 {
        return Err(PiasError::PeerClosed);
    }
    Ok(buf[0])
}

/// How many bytes a UTF-8 scalar starting with this leader byte occupies,
/// or `None` if `byte` cannot start a scalar (i.e. it's a continuation
/// byte).
fn utf8_sequence_len(byte: u8) -> Option<usize> {
    if byte & 0x80 == 0 {
        Some(1)
    } else if byte & 0xE0 == 0xC0 {
        Some(2)
    } else if byte & 0xF0 == 0xE0 {
        Some(3)
    } else if byte & 0xF8 == 0xF0 {
        Some(4)
    } else {
        None
    }
}

/// Reads bytes one at a time from an underlying source until a complete,
/// well-formed UTF-8 scalar has been assembled.
///
/// A continuation byte as the first byte of a scalar is reported as
/// `PiasError::Decode` (§7's `DecodeError`) — callers recover by dropping
/// that byte and continuing.
pub struct Utf8Accumulator;

impl Utf8Accumulator {
    /// Read one complete UTF-8 scalar, returning both the raw bytes (for
    /// byte-faithful forwarding) and the decoded `char`.
    pub fn read_scalar(r: &mut dyn Read) -> Result<(Vec<u8>, char)> {
        let first = read_one_byte(r)?;
        let len = utf8_sequence_len(first).ok_or(PiasError::Decode)?;
        let mut bytes = vec![first];
        for _ in 1..len {
            bytes.push(read_one_byte(r)?);
        }
        let s = std::str::from_utf8(&bytes).map_err(|_| PiasError::Decode)?;
        let c = s.chars().next().ok_or(PiasError::Decode)?;
        Ok((bytes, c))
    }
}
