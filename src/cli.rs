use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Record and replay interactive terminal sessions.
#[derive(Parser, Debug, Clone)]
#[command(name = "pias")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// attach as a view to an already-running session instead of starting
    /// a new one
    #[arg(long, global = true)]
    pub join: bool,

    /// path to config file (defaults to ~/.pias/pias.toml)
    #[arg(short = 'C', long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Record a new session to `datafile`.
    Record {
        datafile: PathBuf,
        /// shell to run under the PTY (defaults to $SHELL)
        #[arg(long)]
        shell: Option<String>,
        /// keep existing events in `datafile`, continuing the recording
        #[arg(long, conflicts_with = "overwrite")]
        append: bool,
        /// clobber an existing `datafile`
        #[arg(long, conflicts_with = "append")]
        overwrite: bool,
    },
    /// Replay a recorded session from `datafile`.
    #[command(alias = "replay")]
    Play {
        datafile: PathBuf,
        /// terminal emulator used to spawn secondary windows
        #[arg(long)]
        terminal: Option<String>,
        /// substitute a fixed sleep for waiting on non-waypoint keystrokes
        #[arg(long, value_name = "MS", num_args = 0..=1, default_missing_value = "0")]
        auto_type: Option<u64>,
        /// substitute a fixed sleep for waiting on waypoint keystrokes
        #[arg(long, value_name = "MS", num_args = 0..=1, default_missing_value = "0")]
        auto_waypoint: Option<u64>,
        /// drive a freshly spawned shell with the recorded keystrokes
        /// instead of showing the recorded output verbatim
        #[arg(long)]
        live_replay: bool,
    },
}

impl Command {
    pub fn auto_type_duration(&self) -> Option<Duration> {
        match self {
            Command::Play { auto_type, .. } => auto_type.map(Duration::from_millis),
            Command::Record { .. } => None,
        }
    }

    pub fn auto_waypoint_duration(&self) -> Option<Duration> {
        match self {
            Command::Play { auto_waypoint, .. } => auto_waypoint.map(Duration::from_millis),
            Command::Record { .. } => None,
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        // Mirrors the original's `main()`: a terminal emulator re-invoking
        // this binary with no arguments is expected to have set
        // PIAS_OPT_* instead, so synthesize an argv from them when no
        // subcommand was actually typed.
        let mut cli = Cli::parse();
        if cli.command.is_none() {
            if let Some(synthesized) = Self::synthesize_from_env() {
                cli = synthesized;
            }
        }
        cli
    }

    fn synthesize_from_env() -> Option<Cli> {
        let join = std::env::var("PIAS_OPT_JOIN").is_ok();
        let datafile = std::env::var("PIAS_OPT_DATAFILE").ok()?;
        let command_name = std::env::var("PIAS_OPT_COMMAND").ok()?;
        let shell = std::env::var("PIAS_OPT_SHELL").ok();
        let terminal = std::env::var("PIAS_OPT_TERMINAL").ok();

        let command = match command_name.as_str() {
            "record" => Command::Record {
                datafile: PathBuf::from(datafile),
                shell,
                append: true,
                overwrite: false,
            },
            "play" | "replay" => Command::Play {
                datafile: PathBuf::from(datafile),
                terminal,
                auto_type: None,
                auto_waypoint: None,
                live_replay: false,
            },
            _ => return None,
        };

        Some(Cli {
            join,
            config: None,
            command: Some(command),
        })
    }
}
