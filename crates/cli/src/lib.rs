#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `endit-cli` is the front end of the `endit` binary: one executable, three
//! subcommands, one daemon per process. It resolves the configuration file
//! (flag, then `ENDIT_CONFIG`, then `/etc/endit.conf`), points the tracing
//! subscriber at stderr or the configured log directory, registers the
//! signal flags and hands control to the selected daemon loop.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use endit_archiver::Archiver;
use endit_config::{Config, DEFAULT_CONFIG_PATH};
use endit_core::signals::SignalFlags;
use endit_deleter::Deleter;
use endit_retriever::Retriever;

/// Environment variable selecting the configuration file.
const CONFIG_ENV: &str = "ENDIT_CONFIG";
/// Environment variable selecting the log filter (tracing syntax).
const LOG_ENV: &str = "ENDIT_LOG";
/// Exit status for a configuration that was read and parsed but rejected
/// (sysexits.h EX_CONFIG). Unreadable or syntactically broken files exit 1.
const EX_CONFIG: u8 = 78;

/// ENDIT: disk-to-tape bridge daemons for a dCache HSM pool.
#[derive(Debug, Parser)]
#[command(name = "endit", version, about)]
struct Args {
    /// Configuration file (overrides the ENDIT_CONFIG environment variable).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: DaemonCommand,
}

#[derive(Clone, Copy, Debug, Subcommand)]
enum DaemonCommand {
    /// Watch out/ and archive staged files to tape.
    Archiver,
    /// Watch request/ and retrieve files from tape into in/.
    Retriever,
    /// Watch trash/ and batch tape deletions.
    Deleter,
}

impl DaemonCommand {
    fn name(self) -> &'static str {
        match self {
            DaemonCommand::Archiver => "archiver",
            DaemonCommand::Retriever => "retriever",
            DaemonCommand::Deleter => "deleter",
        }
    }
}

/// Parses arguments, boots the selected daemon and returns the process exit
/// status.
pub fn run<I, T>(args: I) -> u8
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = Args::parse_from(args);
    let config_path = args
        .config
        .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let component = args.command.name();

    init_logging(component, peek_logdir(&config_path));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) if e.is_validation() => {
            error!(%e, "configuration rejected, fix the offending values");
            return EX_CONFIG;
        }
        Err(e) => {
            error!(%e, "cannot load configuration");
            return 1;
        }
    };

    let flags = match SignalFlags::register() {
        Ok(flags) => flags,
        Err(e) => {
            error!(%e, "cannot install signal handlers");
            return 1;
        }
    };

    info!(
        config = %config.config_path().display(),
        component,
        "endit {} starting",
        env!("CARGO_PKG_VERSION")
    );

    let outcome = match args.command {
        DaemonCommand::Archiver => Archiver::new(config, flags)
            .run()
            .map_err(|e| e.to_string()),
        DaemonCommand::Retriever => Retriever::new(config, flags)
            .run()
            .map_err(|e| e.to_string()),
        DaemonCommand::Deleter => Deleter::new(config, flags)
            .and_then(Deleter::run)
            .map_err(|e| e.to_string()),
    };

    match outcome {
        Ok(()) => {
            info!(component, "clean shutdown");
            0
        }
        Err(e) => {
            error!(component, error = %e, "daemon terminated");
            1
        }
    }
}

/// Reads `logdir` out of the configuration file without full parsing, so
/// the subscriber can be installed before load-time warnings are emitted.
fn peek_logdir(config_path: &std::path::Path) -> Option<PathBuf> {
    let contents = fs::read_to_string(config_path).ok()?;
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            if key.trim().eq_ignore_ascii_case("logdir") {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(PathBuf::from(value));
                }
            }
        }
    }
    None
}

fn init_logging(component: &str, logdir: Option<PathBuf>) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let log_file = logdir.and_then(|dir| {
        fs::create_dir_all(&dir).ok()?;
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{component}.log")))
            .ok()
    });

    // A second install attempt (daemon restarts within one process, tests)
    // keeps the existing subscriber.
    let outcome = match log_file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    if outcome.is_err() {
        tracing::debug!("tracing subscriber already installed, keeping it");
    }
}
