//! Coordinator base: the self-pipe cancellation trick and a background
//! thread handle shared by the recorder and the player (spec §4.4).
//!
//! Grounded in `coordinator.py`'s `SocketCoordinator`: a listening socket, a
//! `wake_pipe` used to interrupt a blocking `select()`, and a `run()` loop
//! that treats `StopCoordinator` as a normal termination signal rather than
//! an error.

use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};
use nix::unistd::{close, pipe, read};

use crate::error::{PiasError, Result, StopCoordinator};

/// A pipe whose write end is never read; writing a single byte to it wakes
/// any thread blocked in `select()` on its read end.
pub struct SelfPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SelfPipe {
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        Ok(SelfPipe {
            read_fd: read_fd.into_raw_fd(),
            write_fd: write_fd.into_raw_fd(),
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Wake anything blocked on this pipe's read end.
    pub fn wake(&self) {
        let fd = unsafe { BorrowedFd::borrow_raw(self.write_fd) };
        let _ = nix::unistd::write(fd, &[0u8]);
    }

    /// Drain any pending wake bytes so a subsequent `select()` blocks again
    /// until the next explicit `wake()`.
    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        let _ = close(self.read_fd);
        let _ = close(self.write_fd);
    }
}

/// Outcome of a `wait_for_data` call other than a stop request.
#[derive(Debug, PartialEq, Eq)]
pub enum Ready {
    /// One or more of the requested fds are readable.
    Fds(Vec<RawFd>),
    /// The timeout elapsed with nothing ready.
    TimedOut,
}

/// Block until one of `fds` is ready to read, or `timeout` elapses, or the
/// self-pipe (always registered) is woken — in which case this returns
/// `Err(StopCoordinator)`, the direct analogue of the original raising its
/// `StopCoordinator` exception out of `wait_for_data`.
///
/// `timeout: None` blocks indefinitely aside from a stop wake.
pub fn wait_for_data(
    self_pipe: &SelfPipe,
    fds: &[RawFd],
    timeout: Option<Duration>,
) -> std::result::Result<Ready, StopCoordinator> {
    let self_pipe_fd = unsafe { BorrowedFd::borrow_raw(self_pipe.read_fd()) };
    let borrowed: Vec<BorrowedFd> = fds
        .iter()
        .map(|&fd| unsafe { BorrowedFd::borrow_raw(fd) })
        .collect();

    let mut read_set = FdSet::new();
    read_set.insert(self_pipe_fd);
    for fd in &borrowed {
        read_set.insert(*fd);
    }

    let mut tv = timeout.map(|d| TimeVal::milliseconds(d.as_millis() as i64));
    let nfds = match select(None, Some(&mut read_set), None, None, tv.as_mut()) {
        Ok(n) => n,
        // A select() error (e.g. EINTR) is not a stop request; report
        // nothing ready and let the caller's loop come back around.
        Err(_) => return Ok(Ready::TimedOut),
    };

    if nfds == 0 {
        return Ok(Ready::TimedOut);
    }

    if read_set.contains(self_pipe_fd) {
        self_pipe.drain();
        return Err(StopCoordinator);
    }

    let ready: Vec<RawFd> = fds
        .iter()
        .copied()
        .zip(borrowed.iter())
        .filter(|(_, bfd)| read_set.contains(**bfd))
        .map(|(fd, _)| fd)
        .collect();
    Ok(Ready::Fds(ready))
}

/// Shared control block for a coordinator's background thread: a stop flag
/// plus the self-pipe used to make that flag observable to a thread blocked
/// in `select()`.
pub struct CoordinatorControl {
    stop_flag: AtomicBool,
    self_pipe: SelfPipe,
}

impl CoordinatorControl {
    pub fn new() -> Result<Arc<Self>> {
        Ok(Arc::new(CoordinatorControl {
            stop_flag: AtomicBool::new(false),
            self_pipe: SelfPipe::new()?,
        }))
    }

    pub fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.self_pipe.wake();
    }

    pub fn self_pipe(&self) -> &SelfPipe {
        &self.self_pipe
    }
}

/// Owns a coordinator's background thread. `start` takes the coordinator's
/// `run` closure (already carrying whatever state it needs); `stop` signals
/// and `wait` joins.
///
/// This is the Rust shape of `SocketCoordinator.start()`/`.stop()`/
/// `.wait()` in the original: a real OS thread stands in for the Python
/// `threading.Thread`, and `catch_unwind` at the thread boundary stands in
/// for the `try/finally` that guarantees `cleanup()` always runs.
pub struct CoordinatorHandle {
    control: Arc<CoordinatorControl>,
    join_handle: Option<JoinHandle<Result<()>>>,
}

impl CoordinatorHandle {
    pub fn start<F>(control: Arc<CoordinatorControl>, run: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let join_handle = std::thread::spawn(move || {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(run)) {
                Ok(r) => r,
                Err(payload) => {
                    tracing::error!("coordinator thread panicked");
                    std::panic::resume_unwind(payload);
                }
            }
        });
        CoordinatorHandle {
            control,
            join_handle: Some(join_handle),
        }
    }

    pub fn stop(&self) {
        self.control.request_stop();
    }

    pub fn wait(mut self) -> Result<()> {
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(result) => result,
                Err(_) => Err(PiasError::Session("coordinator thread panicked".into())),
            }
        } else {
            Ok(())
        }
    }
}

/// The rendezvous listener's fd, for registration alongside the self-pipe
/// in a coordinator's `wait_for_data` call.
pub fn accept_fd(listener: &UnixListener) -> RawFd {
    listener.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_data_times_out_with_no_activity() {
        let control = CoordinatorControl::new().unwrap();
        let result = wait_for_data(control.self_pipe(), &[], Some(Duration::from_millis(20)));
        assert_eq!(result.unwrap(), Ready::TimedOut);
    }

    #[test]
    fn request_stop_wakes_a_blocked_wait() {
        let control = CoordinatorControl::new().unwrap();
        let control2 = control.clone();
        let handle = std::thread::spawn(move || {
            wait_for_data(control2.self_pipe(), &[], Some(Duration::from_secs(5)))
        });
        std::thread::sleep(Duration::from_millis(20));
        control.request_stop();
        let result = handle.join().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn coordinator_handle_runs_and_joins() {
        let control = CoordinatorControl::new().unwrap();
        let handle = CoordinatorHandle::start(control.clone(), move || Ok(()));
        handle.wait().unwrap();
    }

    #[test]
    fn coordinator_handle_propagates_run_error() {
        let control = CoordinatorControl::new().unwrap();
        let handle = CoordinatorHandle::start(control.clone(), move || {
            Err(PiasError::Session("boom".into()))
        });
        let err = handle.wait().unwrap_err();
        assert!(matches!(err, PiasError::Session(_)));
    }
}
