use std::path::{Path, PathBuf};

use pias::cli::{Cli, Command};
use pias::config::Config;
use pias::error::{PiasError, Result};
use pias::eventlog::Mode;
use pias::{player, recorder, util, view};

fn main() {
    let cli = Cli::parse_args();
    let config = Config::load(cli.config.as_deref());
    util::telemetry::init(&config.logging.level);

    match run(cli, &config) {
        Ok(()) => {}
        Err(PiasError::PreflightConflict(msg)) => {
            eprintln!("pias: {}", msg);
            eprintln!("remediation: pass --join to attach to a running session, or remove the stale session socket.");
            std::process::exit(1);
        }
        Err(PiasError::ContractViolation(msg)) => {
            eprintln!("pias: {}", msg);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("pias: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli, config: &Config) -> Result<()> {
    let command = cli.command.clone().ok_or_else(|| {
        PiasError::ContractViolation("no subcommand given; expected record, play, or replay".into())
    })?;

    if cli.join {
        return join(&command);
    }

    match command {
        Command::Record {
            datafile,
            shell,
            append,
            overwrite,
        } => record(&datafile, shell.or_else(|| config.defaults.shell.clone()), append, overwrite),
        Command::Play {
            ref datafile,
            ref terminal,
            live_replay,
            ..
        } => {
            let auto_type = command.auto_type_duration();
            let auto_waypoint = command.auto_waypoint_duration();
            play(
                datafile,
                terminal.clone().or_else(|| config.defaults.terminal.clone()),
                auto_type,
                auto_waypoint,
                live_replay,
            )
        }
    }
}


fn record(datafile: &Path, shell: Option<String>, append: bool, overwrite: bool) -> Result<()> {
    preflight_datafile(datafile, append, overwrite)?;

    let mode = if append { Mode::Append } else { Mode::Write };
    let coordinator = recorder::Recorder::new(datafile, mode, shell.map(PathBuf::from))?;
    let control = coordinator.control();
    let handle = std::thread::spawn(move || coordinator.run());

    let result = view::run(datafile, false);

    control.stop();
    let join_result = handle.join().map_err(|_| PiasError::Session("recorder thread panicked".into()))?;
    join_result?;
    result
}

fn play(
    datafile: &Path,
    terminal: Option<String>,
    auto_type: Option<std::time::Duration>,
    auto_waypoint: Option<std::time::Duration>,
    live_replay: bool,
) -> Result<()> {
    if !datafile.exists() {
        return Err(PiasError::PreflightConflict(format!(
            "no such session file: {}",
            datafile.display()
        )));
    }

    let coordinator = player::Player::new(
        datafile,
        None,
        live_replay,
        auto_type,
        auto_waypoint,
        terminal.map(PathBuf::from),
    )?;
    let control = coordinator.control();
    let handle = std::thread::spawn(move || coordinator.run());

    let result = view::run(datafile, true);

    control.stop();
    let join_result = handle.join().map_err(|_| PiasError::Session("player thread panicked".into()))?;
    join_result?;
    result
}

fn join(command: &Command) -> Result<()> {
    let datafile = match command {
        Command::Record { datafile, .. } => datafile,
        Command::Play { datafile, .. } => datafile,
    };

    let socket = util::retry::retry(|| pias::rendezvous::connect(datafile), 10, 50).map_err(|_| {
        PiasError::PreflightConflict(format!("no live session to join at {}", datafile.display()))
    })?;

    view::run_with_socket(socket, false)
}

fn preflight_datafile(datafile: &Path, append: bool, overwrite: bool) -> Result<()> {
    if datafile.exists() && !append && !overwrite {
        return Err(PiasError::PreflightConflict(format!(
            "{} already exists; pass --append or --overwrite",
            datafile.display()
        )));
    }
    Ok(())
}
