//! The Player (spec §4.6): drives a recorded event stream, gating progress
//! on view keystrokes, optionally live-replaying recorded input into a
//! freshly spawned shell.
//!
//! The original's `player.py::replay_session` only ever drove a single
//! terminal; this generalizes to the multi-terminal/secondary-window shape
//! described fully in the specification, reusing the coordinator/self-pipe
//! machinery `recorder.rs` already established.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};

use crate::coordinator::{wait_for_data, CoordinatorControl, Ready};
use crate::error::{PiasError, Result, StopCoordinator};
use crate::eventlog::{Event, EventLog, Mode, Term};
use crate::rendezvous;
use crate::termio::Utf8Accumulator;

struct LivePty {
    #[allow(dead_code)] // kept alive: dropping would tear down the pty session
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    pty_fd: RawFd,
}

fn is_waypoint(c: char) -> bool {
    c == '\n' || c == '\r'
}

pub struct Player {
    listener: UnixListener,
    sock_path: PathBuf,
    datafile: PathBuf,
    control: Arc<CoordinatorControl>,
    log: EventLog,
    terminal_program: Option<PathBuf>,
    auto_type: Option<Duration>,
    auto_waypoint: Option<Duration>,
    live_replay: bool,
    views: HashMap<Term, UnixStream>,
    ptys: HashMap<Term, LivePty>,
}

impl Player {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        datafile: impl Into<PathBuf>,
        shell: Option<PathBuf>,
        live_replay: bool,
        auto_type: Option<Duration>,
        auto_waypoint: Option<Duration>,
        terminal_program: Option<PathBuf>,
    ) -> Result<Self> {
        let datafile = datafile.into();
        let log = EventLog::open(&datafile, Mode::Read, shell, live_replay)?;
        let (listener, sock_path) = rendezvous::bind(&datafile)?;
        let control = CoordinatorControl::new()?;
        Ok(Player {
            listener,
            sock_path,
            datafile,
            control,
            log,
            terminal_program,
            auto_type,
            auto_waypoint,
            live_replay,
            views: HashMap::new(),
            ptys: HashMap::new(),
        })
    }

    pub fn control(&self) -> Arc<CoordinatorControl> {
        self.control.clone()
    }

    pub fn run(mut self) -> Result<()> {
        let result = self.run_inner();
        self.cleanup();
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        loop {
            if self.control.should_stop() {
                break;
            }
            self.drain_live_ptys()?;
            let event = match self.log.read_event() {
                Some(e) => e,
                None => break,
            };
            match event {
                Event::Open { term, size } => self.handle_open(term, size)?,
                Event::Pause { duration } => std::thread::sleep(Duration::from_secs_f64(duration)),
                Event::Read { term, data } => self.handle_read(&term, &data)?,
                Event::Write { term, data } => self.handle_write(&term, &data)?,
                Event::Close { term } => self.handle_close(&term)?,
                Event::Echo { .. } => {
                    unreachable!("the expansion iterator never yields ECHO")
                }
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        for (_, mut pty) in self.ptys.drain() {
            let _ = pty.child.kill();
            let _ = pty.child.wait();
        }
        self.views.clear();
        let _ = self.log.close();
        rendezvous::remove(&self.sock_path);
    }

    fn handle_open(&mut self, term: Term, size: Option<(u16, u16)>) -> Result<()> {
        let listener_fd = self.listener.as_raw_fd();
        let connected_already = matches!(
            wait_for_data(self.control.self_pipe(), &[listener_fd], Some(Duration::from_millis(100))),
            Ok(Ready::Fds(ref f)) if f.contains(&listener_fd)
        );
        if !connected_already {
            self.spawn_joiner()?;
        }
        let (view, _addr) = self.listener.accept()?;

        if self.live_replay {
            let (cols, rows) = size.unwrap_or((80, 24));
            let pty_system = native_pty_system();
            let pair = pty_system
                .openpty(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| PiasError::Pty(e.into()))?;
            let cmd = CommandBuilder::new(self.log.shell());
            let child = pair
                .slave
                .spawn_command(cmd)
                .map_err(|e| PiasError::Pty(e.into()))?;
            let reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| PiasError::Pty(e.into()))?;
            let writer = pair
                .master
                .take_writer()
                .map_err(|e| PiasError::Pty(e.into()))?;
            let pty_fd = pair
                .master
                .as_raw_fd()
                .ok_or_else(|| PiasError::Pty("pty master exposes no raw fd on this platform".into()))?;
            self.ptys.insert(
                term.clone(),
                LivePty {
                    master: pair.master,
                    reader,
                    writer,
                    child,
                    pty_fd,
                },
            );
        }

        self.views.insert(term, view);
        Ok(())
    }

    /// Re-enter this binary in `--join` mode inside a freshly spawned
    /// terminal emulator (spec §6/§9 "subprocess re-entry"), passing the
    /// whole invocation through environment variables rather than argv.
    fn spawn_joiner(&self) -> Result<()> {
        let exe = std::env::current_exe()?;
        let terminal = self.terminal_program.clone().ok_or_else(|| {
            PiasError::Session("no terminal emulator configured to spawn a secondary view".into())
        })?;

        let mut cmd = std::process::Command::new(&terminal);
        cmd.arg("-e").arg(&exe);
        cmd.env("PIAS_OPT_JOIN", "1");
        cmd.env("PIAS_OPT_COMMAND", "play");
        cmd.env("PIAS_OPT_DATAFILE", &self.datafile);
        cmd.env("PIAS_OPT_TERMINAL", &terminal);
        cmd.env("PIAS_OPT_SHELL", self.log.shell());
        cmd.spawn()?;
        Ok(())
    }

    fn handle_read(&mut self, term: &Term, data: &str) -> Result<()> {
        let c = data.chars().next().unwrap_or('\0');
        if is_waypoint(c) {
            match self.auto_waypoint {
                Some(d) => std::thread::sleep(d),
                None => self.wait_for_waypoint(term)?,
            }
        } else {
            match self.auto_type {
                Some(d) => std::thread::sleep(d),
                None => self.wait_for_non_waypoint(term)?,
            }
        }

        if self.live_replay {
            if let Some(pty) = self.ptys.get_mut(term) {
                let _ = pty.writer.write_all(data.as_bytes());
            }
        }
        Ok(())
    }

    fn handle_write(&mut self, term: &Term, data: &str) -> Result<()> {
        if let Some(view) = self.views.get_mut(term) {
            if view.write_all(data.as_bytes()).is_err() {
                self.handle_close(term)?;
            }
        }
        Ok(())
    }

    fn handle_close(&mut self, term: &Term) -> Result<()> {
        self.views.remove(term);
        if let Some(mut pty) = self.ptys.remove(term) {
            let _ = pty.child.kill();
            let _ = pty.child.wait();
        }
        Ok(())
    }

    /// Block for the next character typed into `term`'s view, returning
    /// `None` if a stop was requested or the view closed mid-wait.
    fn next_view_char(&mut self, term: &Term) -> Result<Option<char>> {
        loop {
            let view_fd = match self.views.get(term) {
                Some(v) => v.as_raw_fd(),
                None => return Ok(None),
            };
            match wait_for_data(self.control.self_pipe(), &[view_fd], None) {
                Ok(_) => {}
                Err(StopCoordinator) => return Ok(None),
            }
            let view = self.views.get_mut(term).expect("checked above");
            match Utf8Accumulator::read_scalar(view) {
                Ok((_, c)) => return Ok(Some(c)),
                Err(PiasError::PeerClosed) => {
                    self.handle_close(term)?;
                    return Ok(None);
                }
                Err(PiasError::Decode) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn wait_for_waypoint(&mut self, term: &Term) -> Result<()> {
        while let Some(c) = self.next_view_char(term)? {
            if is_waypoint(c) {
                break;
            }
        }
        Ok(())
    }

    /// Skip waypoint characters so a stray Enter can't jump ahead through a
    /// non-waypoint step (spec §4.6).
    fn wait_for_non_waypoint(&mut self, term: &Term) -> Result<()> {
        while let Some(c) = self.next_view_char(term)? {
            if !is_waypoint(c) {
                break;
            }
        }
        Ok(())
    }

    fn drain_live_ptys(&mut self) -> Result<()> {
        if !self.live_replay {
            return Ok(());
        }
        let terms: Vec<Term> = self.ptys.keys().cloned().collect();
        for term in terms {
            self.drain_one_pty(&term)?;
        }
        Ok(())
    }

    fn drain_one_pty(&mut self, term: &Term) -> Result<()> {
        let mut first = true;
        loop {
            let pty_fd = match self.ptys.get(term) {
                Some(p) => p.pty_fd,
                None => return Ok(()),
            };
            let timeout = if first { Duration::from_millis(10) } else { Duration::ZERO };
            first = false;
            match wait_for_data(self.control.self_pipe(), &[pty_fd], Some(timeout)) {
                Ok(Ready::Fds(ref ready)) if ready.contains(&pty_fd) => {}
                _ => return Ok(()),
            }

            let pty = self.ptys.get_mut(term).expect("checked above");
            match Utf8Accumulator::read_scalar(&mut pty.reader) {
                Ok((bytes, _)) => {
                    if let Some(view) = self.views.get_mut(term) {
                        let _ = view.write_all(&bytes);
                    }
                }
                Err(PiasError::PeerClosed) => {
                    self.handle_close(term)?;
                    return Ok(());
                }
                Err(PiasError::Decode) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn canned_replay_of_echo_session_sends_expected_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let datafile = dir.path().join("session.json");

        // Build a tiny pre-recorded session: OPEN, ECHO("hi\n"), CLOSE.
        let mut writer = EventLog::open(&datafile, Mode::Write, Some("/bin/sh".into()), false).unwrap();
        writer.write_event(Event::Open {
            term: "T".into(),
            size: None,
        });
        writer.write_event(Event::Echo {
            term: "T".into(),
            data: "hi\n".into(),
        });
        writer.write_event(Event::Close { term: "T".into() });
        writer.close().unwrap();

        let player = Player::new(&datafile, None, false, Some(Duration::from_millis(1)), Some(Duration::from_millis(1)), None).unwrap();
        let control = player.control();
        let sock_path = player.sock_path.clone();

        let handle = std::thread::spawn(move || player.run());

        for _ in 0..100 {
            if sock_path.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let mut view = UnixStream::connect(&sock_path).unwrap();
        let mut out = Vec::new();
        let _ = view.read_to_end(&mut out);

        control.request_stop();
        handle.join().unwrap().unwrap();

        assert_eq!(out, b"hi\n");
    }
}
