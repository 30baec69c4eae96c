//! The view proxy (spec §4.7): the client side a user's terminal window
//! runs, forwarding raw keystrokes to the coordinator and writing back
//! whatever bytes it sends.
//!
//! Grounded in `coordinator.py`'s `proxy_to_coordinator`: a raw-mode stdin,
//! a readiness wait over {stdin, socket}, and byte-for-byte forwarding in
//! both directions with no interpretation.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::coordinator::{wait_for_data, CoordinatorControl, Ready};
use crate::error::{Result, StopCoordinator};
use crate::rendezvous;
use crate::termio::{read_one_byte, RawModeGuard};
use crate::util::retry::retry;

const SOCKET_READ_CHUNK: usize = 1024;

/// ANSI clear-screen-and-home, emitted before a Player's loop starts.
const CLEAR_AND_HOME: &[u8] = b"\x1b[2J\x1b[H";

/// Connect to a running session's rendezvous socket and proxy stdin/stdout
/// to it until the socket closes or a read fails.
///
/// `clear_screen` matches spec §4.7: the Player side clears the screen
/// before handing control to the replay; the Recorder side does not.
///
/// The rendezvous socket is bound by the coordinator thread this process
/// just spawned, so the first few connect attempts may race its startup;
/// retry briefly rather than fail the whole session over that.
pub fn run(datafile: &Path, clear_screen: bool) -> Result<()> {
    let socket = retry(|| rendezvous::connect(datafile), 10, 10)?;
    run_with_socket(socket, clear_screen)
}

/// As `run`, but against a socket the caller already connected — used by
/// `--join`, which needs to distinguish "no live session" from "session
/// starting up" before committing to the proxy loop.
pub fn run_with_socket(mut socket: UnixStream, clear_screen: bool) -> Result<()> {
    let _raw = RawModeGuard::enable(0)?;

    if clear_screen {
        std::io::stdout().write_all(CLEAR_AND_HOME)?;
        std::io::stdout().flush()?;
    }

    let control = CoordinatorControl::new()?;
    proxy_loop(&mut socket, &control)
}

fn proxy_loop(socket: &mut UnixStream, control: &CoordinatorControl) -> Result<()> {
    let stdin_fd = 0;
    let socket_fd = socket.as_raw_fd();

    loop {
        let ready = match wait_for_data(control.self_pipe(), &[stdin_fd, socket_fd], None) {
            Ok(r) => r,
            Err(StopCoordinator) => return Ok(()),
        };
        let ready_fds = match ready {
            Ready::Fds(fds) => fds,
            Ready::TimedOut => continue,
        };

        if ready_fds.contains(&socket_fd) {
            let mut buf = [0u8; SOCKET_READ_CHUNK];
            let n = socket.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            std::io::stdout().write_all(&buf[..n])?;
            std::io::stdout().flush()?;
        }

        if ready_fds.contains(&stdin_fd) {
            let mut stdin = std::io::stdin();
            match read_one_byte(&mut stdin) {
                Ok(byte) => socket.write_all(&[byte])?,
                Err(_) => return Ok(()),
            }
        }
    }
}
