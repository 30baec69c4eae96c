//! Event log: the ordered, self-compacting record of a session (spec §3/§4.2).
//!
//! Ported directly from `playitagainsam.eventlog.EventLog` — `write_event`'s
//! five compaction rules and `_iter_events`'s expansion are the same
//! operations, just typed.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PiasError, Result};

/// Opaque 128-bit terminal identifier, minted as a v4 UUID hex string (no
/// hyphens) to match the original's `uuid.uuid4().hex`.
pub type Term = String;

pub fn new_term() -> Term {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A single event in the log (spec §3 table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "act")]
pub enum Event {
    #[serde(rename = "OPEN")]
    Open {
        term: Term,
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<(u16, u16)>,
    },
    #[serde(rename = "CLOSE")]
    Close { term: Term },
    #[serde(rename = "READ")]
    Read { term: Term, data: String },
    #[serde(rename = "WRITE")]
    Write { term: Term, data: String },
    #[serde(rename = "ECHO")]
    Echo { term: Term, data: String },
    #[serde(rename = "PAUSE")]
    Pause { duration: f64 },
}

impl Event {
    fn term(&self) -> Option<&str> {
        match self {
            Event::Open { term, .. }
            | Event::Close { term }
            | Event::Read { term, .. }
            | Event::Write { term, .. }
            | Event::Echo { term, .. } => Some(term),
            Event::Pause { .. } => None,
        }
    }
}

/// How an `EventLog` was opened, mirroring the Python `mode` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    Append,
}

#[derive(Serialize, Deserialize)]
struct SessionDoc {
    events: Vec<Event>,
    shell: PathBuf,
}

/// The ordered, self-compacting sequence of events making up a session.
pub struct EventLog {
    datafile: PathBuf,
    mode: Mode,
    live_replay: bool,
    shell: PathBuf,
    events: Vec<Event>,
    terminals: HashSet<Term>,
    /// Expansion lookahead buffer consumed by `read_event`; refilled one
    /// source event at a time. This is the idiomatic stand-in for the
    /// original's Python generator (`_iter_events`), since Rust has no
    /// native generator syntax.
    pending: VecDeque<Event>,
    next_source: usize,
}

impl EventLog {
    /// Open a session file. `shell` is the explicit shell override (if
    /// any); for `read`/`append` modes with `live_replay` set, the
    /// effective shell falls back to whatever the file recorded.
    pub fn open(
        datafile: impl Into<PathBuf>,
        mode: Mode,
        shell: Option<PathBuf>,
        live_replay: bool,
    ) -> Result<Self> {
        let datafile = datafile.into();
        let (events, stored_shell) = match mode {
            Mode::Write => (Vec::new(), None),
            Mode::Read | Mode::Append => {
                let text = fs::read_to_string(&datafile)?;
                let doc: SessionDoc = serde_json::from_str(&text).map_err(|e| {
                    let msg = e.to_string();
                    if msg.contains("unknown variant") {
                        PiasError::ContractViolation(format!(
                            "unknown event tag in {}: {}",
                            datafile.display(),
                            msg
                        ))
                    } else {
                        PiasError::Json(e)
                    }
                })?;
                (doc.events, Some(doc.shell))
            }
        };

        let shell = shell
            .or(stored_shell)
            .unwrap_or_else(|| PathBuf::from(default_shell()));

        let mut terminals = HashSet::new();
        for event in &events {
            if let Some(term) = event.term() {
                terminals.insert(term.to_string());
            }
        }

        Ok(EventLog {
            datafile,
            mode,
            live_replay,
            shell,
            events,
            terminals,
            pending: VecDeque::new(),
            next_source: 0,
        })
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    pub fn set_shell(&mut self, shell: PathBuf) {
        self.shell = shell;
    }

    pub fn terminals(&self) -> &HashSet<Term> {
        &self.terminals
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// The term the *next* OPEN should reuse, per the append-continuation
    /// rule: only if the very last event in the log is a bare CLOSE.
    pub fn reusable_close_term(&self) -> Option<&str> {
        match self.events.last() {
            Some(Event::Close { term }) => Some(term.as_str()),
            _ => None,
        }
    }

    /// Append an event, applying the five compaction rules of spec §3.
    pub fn write_event(&mut self, event: Event) {
        // Rule 1: merge consecutive PAUSE.
        if let Event::Pause { duration } = &event {
            if let Some(Event::Pause { duration: last }) = self.events.last_mut() {
                *last += duration;
                return;
            }
        }

        // Rules 2 & 3 operate on same-terminal WRITE.
        if let Event::Write { term, data } = &event {
            if let Some(last) = self.events.last_mut() {
                let same_term = last.term() == Some(term.as_str());
                if same_term {
                    match last {
                        Event::Write { data: last_data, .. } => {
                            last_data.push_str(data);
                            return;
                        }
                        Event::Read {
                            data: read_data, ..
                        } if read_data == data => {
                            let echo = Event::Echo {
                                term: term.clone(),
                                data: data.clone(),
                            };
                            *last = echo;
                            // Absorb into a preceding ECHO on the same term.
                            let n = self.events.len();
                            if n >= 2 {
                                if let Event::Echo {
                                    term: prev_term,
                                    data: prev_data,
                                } = &mut self.events[n - 2]
                                {
                                    if prev_term == term {
                                        prev_data.push_str(data);
                                        self.events.pop();
                                    }
                                }
                            }
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }

        // Rule 4: an OPEN immediately following a same-term CLOSE cancels
        // both.
        if let Event::Open { term, .. } = &event {
            if let Some(Event::Close { term: last_term }) = self.events.last() {
                if last_term == term {
                    self.events.pop();
                    return;
                }
            }
        }

        if let Some(term) = event.term() {
            self.terminals.insert(term.to_string());
        }
        self.events.push(event);
    }

    /// Pull the next event off the expansion iterator (spec §3), or `None`
    /// once the log is exhausted.
    pub fn read_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.next_source >= self.events.len() {
                return None;
            }
            let source = self.events[self.next_source].clone();
            self.next_source += 1;
            self.expand_into_pending(source);
        }
    }

    fn expand_into_pending(&mut self, event: Event) {
        match event {
            Event::Echo { term, data } => {
                for c in data.chars() {
                    self.pending.push_back(Event::Read {
                        term: term.clone(),
                        data: c.to_string(),
                    });
                    if !self.live_replay {
                        self.pending.push_back(Event::Write {
                            term: term.clone(),
                            data: c.to_string(),
                        });
                    }
                }
            }
            Event::Read { term, data } => {
                for c in data.chars() {
                    self.pending.push_back(Event::Read {
                        term: term.clone(),
                        data: c.to_string(),
                    });
                }
            }
            Event::Write { .. } => {
                if !self.live_replay {
                    self.pending.push_back(event);
                }
            }
            other => self.pending.push_back(other),
        }
    }

    /// Persist, if this log was opened for writing. Atomically replaces the
    /// datafile: write to a sibling temp file, then rename.
    pub fn close(&self) -> Result<()> {
        if self.mode == Mode::Read {
            return Ok(());
        }
        let dir = self
            .datafile
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let prefix = self
            .datafile
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("pias-session");

        let tmp = tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?;
        let doc = SessionDoc {
            events: self.events.clone(),
            shell: self.shell.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)?;
        fs::write(tmp.path(), json)?;
        tmp.persist(&self.datafile)
            .map_err(|e| PiasError::Io(e.error))?;
        Ok(())
    }
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_evt(term: &str) -> Event {
        Event::Open {
            term: term.to_string(),
            size: None,
        }
    }
    fn close_evt(term: &str) -> Event {
        Event::Close {
            term: term.to_string(),
        }
    }
    fn read_evt(term: &str, data: &str) -> Event {
        Event::Read {
            term: term.to_string(),
            data: data.to_string(),
        }
    }
    fn write_evt(term: &str, data: &str) -> Event {
        Event::Write {
            term: term.to_string(),
            data: data.to_string(),
        }
    }
    fn pause_evt(duration: f64) -> Event {
        Event::Pause { duration }
    }

    fn new_write_log() -> EventLog {
        EventLog::open("/tmp/does-not-matter.json", Mode::Write, Some("/bin/sh".into()), false).unwrap()
    }

    /// S1: echo collapse.
    #[test]
    fn echo_collapse_scenario() {
        let mut log = new_write_log();
        log.write_event(open_evt("T"));
        log.write_event(read_evt("T", "a"));
        log.write_event(write_evt("T", "a"));
        log.write_event(read_evt("T", "b"));
        log.write_event(write_evt("T", "b"));
        log.write_event(close_evt("T"));

        assert_eq!(
            log.events(),
            &[
                open_evt("T"),
                Event::Echo {
                    term: "T".into(),
                    data: "ab".into()
                },
                close_evt("T"),
            ]
        );
    }

    /// S2: pause merge.
    #[test]
    fn pause_merge_scenario() {
        let mut log = new_write_log();
        log.write_event(open_evt("T"));
        log.write_event(pause_evt(0.3));
        log.write_event(pause_evt(0.4));
        log.write_event(close_evt("T"));

        match &log.events()[1] {
            Event::Pause { duration } => assert!((duration - 0.7).abs() < 1e-9),
            other => panic!("expected Pause, got {:?}", other),
        }
        assert_eq!(log.events().len(), 3);
    }

    /// S3: open-after-close cancellation / append continuation.
    #[test]
    fn open_after_close_cancels() {
        let mut log = new_write_log();
        log.write_event(open_evt("T1"));
        log.write_event(close_evt("T1"));
        assert_eq!(log.reusable_close_term(), Some("T1"));
        log.write_event(open_evt("T1"));
        // The CLOSE/OPEN pair vanished; log only has the original OPEN.
        assert_eq!(log.events(), &[open_evt("T1")]);
    }

    #[test]
    fn write_does_not_follow_write_unmerged() {
        let mut log = new_write_log();
        log.write_event(open_evt("T"));
        log.write_event(write_evt("T", "a"));
        log.write_event(write_evt("T", "b"));
        assert_eq!(
            log.events(),
            &[open_evt("T"), write_evt("T", "ab")]
        );
    }

    #[test]
    fn write_on_different_term_does_not_merge() {
        let mut log = new_write_log();
        log.write_event(open_evt("T1"));
        log.write_event(open_evt("T2"));
        log.write_event(write_evt("T1", "a"));
        log.write_event(write_evt("T2", "b"));
        assert_eq!(
            log.events(),
            &[open_evt("T1"), open_evt("T2"), write_evt("T1", "a"), write_evt("T2", "b")]
        );
    }

    #[test]
    fn read_write_mismatch_does_not_become_echo() {
        let mut log = new_write_log();
        log.write_event(open_evt("T"));
        log.write_event(read_evt("T", "secret"));
        log.write_event(write_evt("T", "****"));
        assert_eq!(
            log.events(),
            &[open_evt("T"), read_evt("T", "secret"), write_evt("T", "****")]
        );
    }

    /// S4: expansion in (non-live) play.
    #[test]
    fn expansion_non_live_replay() {
        let mut log = new_write_log();
        log.write_event(open_evt("T"));
        log.write_event(Event::Echo {
            term: "T".into(),
            data: "hi\n".into(),
        });
        log.write_event(close_evt("T"));

        let mut out = Vec::new();
        while let Some(e) = log.read_event() {
            out.push(e);
        }
        assert_eq!(
            out,
            vec![
                open_evt("T"),
                read_evt("T", "h"),
                write_evt("T", "h"),
                read_evt("T", "i"),
                write_evt("T", "i"),
                read_evt("T", "\n"),
                write_evt("T", "\n"),
                close_evt("T"),
            ]
        );
    }

    /// S5: live-replay suppresses WRITE.
    #[test]
    fn expansion_live_replay_suppresses_write() {
        let mut log = EventLog::open("/tmp/does-not-matter2.json", Mode::Write, Some("/bin/sh".into()), true)
            .unwrap();
        log.write_event(open_evt("T"));
        log.write_event(Event::Echo {
            term: "T".into(),
            data: "hi\n".into(),
        });
        log.write_event(close_evt("T"));

        let mut out = Vec::new();
        while let Some(e) = log.read_event() {
            out.push(e);
        }
        assert_eq!(
            out,
            vec![
                open_evt("T"),
                read_evt("T", "h"),
                read_evt("T", "i"),
                read_evt("T", "\n"),
                close_evt("T"),
            ]
        );
    }

    #[test]
    fn no_two_adjacent_pauses_invariant_holds_across_random_sequence() {
        let mut log = new_write_log();
        for i in 0..50 {
            if i % 3 == 0 {
                log.write_event(pause_evt(0.1));
            } else {
                log.write_event(write_evt("T", "x"));
            }
        }
        for w in log.events().windows(2) {
            assert!(!matches!((&w[0], &w[1]), (Event::Pause { .. }, Event::Pause { .. })));
        }
    }

    #[test]
    fn round_trip_through_close_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let mut log = EventLog::open(&path, Mode::Write, Some("/bin/sh".into()), false).unwrap();
        log.write_event(open_evt("T"));
        log.write_event(Event::Echo {
            term: "T".into(),
            data: "ab".into(),
        });
        log.write_event(close_evt("T"));
        log.close().unwrap();

        let mut reopened = EventLog::open(&path, Mode::Read, None, false).unwrap();
        assert_eq!(reopened.events(), log.events());

        let mut out = Vec::new();
        while let Some(e) = reopened.read_event() {
            out.push(e);
        }
        assert_eq!(out.len(), 1 /* open */ + 4 /* read+write per char */ + 1 /* close */);
    }

    #[test]
    fn append_mode_keeps_prior_events_as_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let mut log = EventLog::open(&path, Mode::Write, Some("/bin/sh".into()), false).unwrap();
        log.write_event(open_evt("T1"));
        log.write_event(close_evt("T1"));
        log.close().unwrap();

        let mut appended = EventLog::open(&path, Mode::Append, None, false).unwrap();
        assert_eq!(appended.reusable_close_term(), Some("T1"));
        appended.write_event(open_evt("T1"));
        assert_eq!(appended.events(), &[open_evt("T1")]);
    }
}
