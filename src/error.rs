use std::fmt;

/// Error taxonomy for pias (spec §7).
///
/// Only `PeerClosed` and `Decode` are meant to be recovered locally by
/// callers; everything else unwinds to the coordinator boundary where
/// `cleanup()` runs before the process exits non-zero.
#[derive(Debug)]
pub enum PiasError {
    /// Session socket already present without `--join`, datafile exists
    /// without `--append`/`--overwrite`, or `--join` requested with no
    /// live session.
    PreflightConflict(String),
    /// A view socket or PTY master reported EOF.
    PeerClosed,
    /// A continuation byte was seen where a UTF-8 leader byte was expected.
    Decode,
    /// Underlying IO error (socket bind, PTY allocation, datafile write).
    Io(std::io::Error),
    /// PTY-related error from `portable_pty`.
    Pty(Box<dyn std::error::Error + Send + Sync>),
    /// Failure from a terminal-control call.
    Terminal(String),
    /// Session/coordinator bookkeeping error.
    Session(String),
    /// Event-log (de)serialization error.
    Json(serde_json::Error),
    /// Unknown subcommand or unknown event tag in a loaded file.
    ContractViolation(String),
}

impl fmt::Display for PiasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PiasError::PreflightConflict(msg) => write!(f, "preflight conflict: {}", msg),
            PiasError::PeerClosed => write!(f, "peer closed the connection"),
            PiasError::Decode => write!(f, "malformed UTF-8 byte sequence"),
            PiasError::Io(e) => write!(f, "IO error: {}", e),
            PiasError::Pty(e) => write!(f, "PTY error: {}", e),
            PiasError::Terminal(msg) => write!(f, "terminal error: {}", msg),
            PiasError::Session(msg) => write!(f, "session error: {}", msg),
            PiasError::Json(e) => write!(f, "JSON error: {}", e),
            PiasError::ContractViolation(msg) => write!(f, "contract violation: {}", msg),
        }
    }
}

impl std::error::Error for PiasError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PiasError::Io(e) => Some(e),
            PiasError::Pty(e) => Some(e.as_ref()),
            PiasError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PiasError {
    fn from(error: std::io::Error) -> Self {
        PiasError::Io(error)
    }
}

impl From<serde_json::Error> for PiasError {
    fn from(error: serde_json::Error) -> Self {
        PiasError::Json(error)
    }
}

impl From<nix::Error> for PiasError {
    fn from(error: nix::Error) -> Self {
        PiasError::Terminal(error.to_string())
    }
}

/// Result type alias for pias operations.
pub type Result<T> = std::result::Result<T, PiasError>;

/// Marker raised internally when a coordinator's stop flag is observed
/// during a readiness wait. Caught at the run-loop boundary and treated as
/// graceful termination, never surfaced to callers.
#[derive(Debug)]
pub struct StopCoordinator;

impl fmt::Display for StopCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coordinator stop requested")
    }
}

impl std::error::Error for StopCoordinator {}
