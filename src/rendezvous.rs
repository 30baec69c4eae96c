//! The rendezvous socket (spec §4.3): a Unix-domain socket that lets the
//! view proxy and the running coordinator find each other, and whose mere
//! existence on disk doubles as the session mutex.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use crate::error::{PiasError, Result};

/// Derive the rendezvous socket path for a given datafile: sibling file
/// named `<datafile>.pias-session.sock`.
pub fn socket_path(datafile: &Path) -> PathBuf {
    let mut os = datafile.as_os_str().to_owned();
    os.push(".pias-session.sock");
    PathBuf::from(os)
}

/// Bind the rendezvous socket for a brand new session.
///
/// Fails with `PiasError::PreflightConflict` if the path already exists —
/// that's the signal a session is already live for this datafile.
pub fn bind(datafile: &Path) -> Result<(UnixListener, PathBuf)> {
    let path = socket_path(datafile);
    if path.exists() {
        return Err(PiasError::PreflightConflict(format!(
            "session socket already exists at {}",
            path.display()
        )));
    }
    let listener = UnixListener::bind(&path)?;
    Ok((listener, path))
}

/// Connect to an already-running session's rendezvous socket, used by the
/// view proxy (and by `--join`, after its grace-period retry loop).
pub fn connect(datafile: &Path) -> Result<UnixStream> {
    let path = socket_path(datafile);
    let stream = UnixStream::connect(&path).map_err(|_| {
        PiasError::PreflightConflict(format!("no live session at {}", path.display()))
    })?;
    Ok(stream)
}

/// Remove the socket file. Safe to call more than once; a missing file is
/// not an error since cleanup may race another exit path.
pub fn remove(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn bind_then_connect_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let datafile = dir.path().join("session.json");

        let (listener, sock_path) = bind(&datafile).unwrap();
        assert!(sock_path.exists());

        let accept_thread = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        let mut client = connect(&datafile).unwrap();
        client.write_all(b"hello").unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello");

        accept_thread.join().unwrap();
        remove(&sock_path);
        assert!(!sock_path.exists());
    }

    #[test]
    fn bind_twice_is_preflight_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let datafile = dir.path().join("session.json");

        let (_listener, sock_path) = bind(&datafile).unwrap();
        let err = bind(&datafile).unwrap_err();
        assert!(matches!(err, PiasError::PreflightConflict(_)));
        remove(&sock_path);
    }

    #[test]
    fn connect_with_no_listener_is_preflight_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let datafile = dir.path().join("session.json");
        let err = connect(&datafile).unwrap_err();
        assert!(matches!(err, PiasError::PreflightConflict(_)));
    }
}
