//! The Recorder (spec §4.5): a coordinator that forks a shell under a PTY
//! for each connecting view and logs the traffic between them.
//!
//! Grounded in `recorder.py`'s `run`/`_handle_input`/`_handle_output`/
//! `_handle_open_terminal`/`_handle_close_terminal`, adapted from the
//! original's TCP rendezvous + raw `pty.fork()` to the Unix-domain socket
//! and `portable_pty` this crate uses elsewhere.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};

use crate::coordinator::{wait_for_data, CoordinatorControl, Ready};
use crate::error::{PiasError, Result, StopCoordinator};
use crate::eventlog::{new_term, Event, EventLog, Mode, Term};
use crate::rendezvous;
use crate::termio::{self, Utf8Accumulator};

const DRAIN_CHUNK_BOUND: usize = 4096;

struct TerminalState {
    view: UnixStream,
    view_fd: RawFd,
    #[allow(dead_code)] // kept alive: dropping would release the pty session
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    pty_fd: RawFd,
}

/// Coordinator specialization that records a live session to an event log.
pub struct Recorder {
    listener: UnixListener,
    sock_path: PathBuf,
    control: std::sync::Arc<CoordinatorControl>,
    log: EventLog,
    terminals: HashMap<Term, TerminalState>,
}

impl Recorder {
    pub fn new(datafile: impl Into<PathBuf>, mode: Mode, shell: Option<PathBuf>) -> Result<Self> {
        let datafile = datafile.into();
        let log = EventLog::open(&datafile, mode, shell, false)?;
        let (listener, sock_path) = rendezvous::bind(&datafile)?;
        let control = CoordinatorControl::new()?;
        Ok(Recorder {
            listener,
            sock_path,
            control,
            log,
            terminals: HashMap::new(),
        })
    }

    pub fn control(&self) -> std::sync::Arc<CoordinatorControl> {
        self.control.clone()
    }

    /// Runs the full record loop. Always persists the event log and
    /// unlinks the rendezvous socket before returning, success or failure.
    pub fn run(mut self) -> Result<()> {
        let result = self.run_inner();
        self.cleanup();
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        if !self.await_first_terminal()? {
            return Ok(());
        }
        loop {
            if self.terminals.is_empty() {
                break;
            }
            if !self.steady_state_iteration()? {
                break;
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        for (term, mut state) in self.terminals.drain() {
            let _ = state.child.kill();
            let _ = state.child.wait();
            self.log.write_event(Event::Close { term });
        }
        if let Err(e) = self.log.close() {
            tracing::error!("failed to persist event log: {}", e);
        }
        rendezvous::remove(&self.sock_path);
    }

    /// Phase 1: block until the first view connects.
    fn await_first_terminal(&mut self) -> Result<bool> {
        let listener_fd = self.listener.as_raw_fd();
        match wait_for_data(self.control.self_pipe(), &[listener_fd], None) {
            Ok(_) => {
                self.accept_and_open_terminal()?;
                Ok(true)
            }
            Err(StopCoordinator) => Ok(false),
        }
    }

    /// Phase 2, one iteration of the 3-way priority wait.
    fn steady_state_iteration(&mut self) -> Result<bool> {
        let listener_fd = self.listener.as_raw_fd();
        let view_fds: Vec<(RawFd, Term)> = self
            .terminals
            .iter()
            .map(|(t, s)| (s.view_fd, t.clone()))
            .collect();
        let pty_fds: Vec<RawFd> = self.terminals.values().map(|s| s.pty_fd).collect();

        let mut fds = vec![listener_fd];
        fds.extend(view_fds.iter().map(|(fd, _)| *fd));
        fds.extend(&pty_fds);

        let start = Instant::now();
        let ready = match wait_for_data(self.control.self_pipe(), &fds, None) {
            Ok(r) => r,
            Err(StopCoordinator) => return Ok(false),
        };
        let elapsed = start.elapsed();

        let ready_fds = match ready {
            Ready::Fds(fds) => fds,
            Ready::TimedOut => Vec::new(),
        };

        if let Some((_, term)) = view_fds.iter().find(|(fd, _)| ready_fds.contains(fd)) {
            let term = term.clone();
            self.handle_view_ready(&term)?;
        } else if ready_fds.contains(&listener_fd) {
            self.accept_and_open_terminal()?;
        } else {
            self.log.write_event(Event::Pause {
                duration: elapsed.as_secs_f64(),
            });
        }

        let terms: Vec<Term> = self.terminals.keys().cloned().collect();
        for term in terms {
            self.drain_pty(&term)?;
        }

        Ok(true)
    }

    fn handle_view_ready(&mut self, term: &Term) -> Result<()> {
        let state = self.terminals.get_mut(term).expect("tracked terminal");
        match Utf8Accumulator::read_scalar(&mut state.view) {
            Ok((bytes, c)) => {
                self.log.write_event(Event::Read {
                    term: term.clone(),
                    data: c.to_string(),
                });
                let state = self.terminals.get_mut(term).expect("tracked terminal");
                if state.writer.write_all(&bytes).is_err() {
                    self.close_terminal(term)?;
                }
                Ok(())
            }
            Err(PiasError::PeerClosed) => self.close_terminal(term),
            Err(PiasError::Decode) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn accept_and_open_terminal(&mut self) -> Result<()> {
        let (view, _addr) = self.listener.accept()?;
        let term = self
            .log
            .reusable_close_term()
            .map(|s| s.to_string())
            .unwrap_or_else(new_term);

        let (cols, rows) = termio::terminal_size();
        let pty_system = native_pty_system();
        let pty_pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PiasError::Pty(e.into()))?;

        let cmd = CommandBuilder::new(self.log.shell());
        let child = pty_pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PiasError::Pty(e.into()))?;

        let reader = pty_pair
            .master
            .try_clone_reader()
            .map_err(|e| PiasError::Pty(e.into()))?;
        let writer = pty_pair
            .master
            .take_writer()
            .map_err(|e| PiasError::Pty(e.into()))?;
        let pty_fd = pty_pair
            .master
            .as_raw_fd()
            .ok_or_else(|| PiasError::Pty("pty master exposes no raw fd on this platform".into()))?;

        let view_fd = view.as_raw_fd();

        self.log.write_event(Event::Open {
            term: term.clone(),
            size: Some((cols, rows)),
        });

        self.terminals.insert(
            term,
            TerminalState {
                view,
                view_fd,
                master: pty_pair.master,
                reader,
                writer,
                child,
                pty_fd,
            },
        );
        Ok(())
    }

    fn close_terminal(&mut self, term: &Term) -> Result<()> {
        if let Some(mut state) = self.terminals.remove(term) {
            let _ = state.child.kill();
            let _ = state.child.wait();
        }
        self.log.write_event(Event::Close { term: term.clone() });
        Ok(())
    }

    /// Drain one terminal's PTY for as long as it stays immediately ready,
    /// up to `DRAIN_CHUNK_BOUND` bytes, emitting a single `Write` per burst.
    fn drain_pty(&mut self, term: &Term) -> Result<()> {
        let mut chunk: Vec<u8> = Vec::new();
        loop {
            let pty_fd = match self.terminals.get(term) {
                Some(s) => s.pty_fd,
                None => return Ok(()),
            };
            match wait_for_data(self.control.self_pipe(), &[pty_fd], Some(Duration::ZERO)) {
                Ok(Ready::Fds(ref ready)) if ready.contains(&pty_fd) => {}
                _ => break,
            }

            let state = self.terminals.get_mut(term).expect("tracked terminal");
            match Utf8Accumulator::read_scalar(&mut state.reader) {
                Ok((bytes, _)) => {
                    let _ = state.view.write_all(&bytes);
                    chunk.extend_from_slice(&bytes);
                    if chunk.len() >= DRAIN_CHUNK_BOUND {
                        break;
                    }
                }
                Err(PiasError::PeerClosed) => {
                    if !chunk.is_empty() {
                        self.log.write_event(Event::Write {
                            term: term.clone(),
                            data: String::from_utf8_lossy(&chunk).into_owned(),
                        });
                    }
                    return self.close_terminal(term);
                }
                Err(PiasError::Decode) => continue,
                Err(e) => return Err(e),
            }
        }
        if !chunk.is_empty() {
            self.log.write_event(Event::Write {
                term: term.clone(),
                data: String::from_utf8_lossy(&chunk).into_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::os::unix::net::UnixStream;

    #[test]
    fn record_a_short_echo_session() {
        let dir = tempfile::tempdir().unwrap();
        let datafile = dir.path().join("session.json");

        let recorder = Recorder::new(&datafile, Mode::Write, Some("/bin/sh".into())).unwrap();
        let control = recorder.control();
        let sock_path = recorder.sock_path.clone();

        let handle = std::thread::spawn(move || recorder.run());

        // Wait for the socket to appear, then connect as a view.
        for _ in 0..100 {
            if sock_path.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let mut view = UnixStream::connect(&sock_path).unwrap();
        view.write_all(b"exit\n").unwrap();

        let mut buf = Vec::new();
        let _ = view.read_to_end(&mut buf);

        control.request_stop();
        handle.join().unwrap().unwrap();

        let log = EventLog::open(&datafile, Mode::Read, None, false).unwrap();
        assert!(log.events().iter().any(|e| matches!(e, Event::Open { .. })));
    }
}
