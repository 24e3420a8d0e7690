//! Builder used to configure one tape-client invocation.
//!
//! The argument shapes are fixed contracts with the external client:
//!
//! ```text
//! archive  -deletefiles <base opts> -description=<desc> -filelist=<path>
//! retrieve -replace=no -followsymbolic=yes <display opts> <base opts> -filelist=<path> <dest>/
//! delete archive -noprompt <display opts> <base opts> -filelist=<path>
//! ```
//!
//! Children run under a CPU-time rlimit rather than a wall-clock timeout; a
//! tape mount can legitimately take hours while consuming no CPU.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::PathBuf;
use std::process::Command;

use chrono::{DateTime, Local, SecondsFormat};

/// What the tape client should do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// `archive -deletefiles`: write staged copies to tape, unlinking each
    /// `out/` entry the server confirms.
    Archive {
        /// Session description; unique per invocation so sessions can be
        /// told apart on the tape server.
        description: String,
    },
    /// `retrieve`: read archived copies into the destination directory.
    Retrieve {
        /// Destination directory (the staging tree's `in/`).
        destination: PathBuf,
    },
    /// `delete archive -noprompt`: drop archived copies.
    Delete,
}

/// Builder used to configure and spawn a tape-client subprocess.
#[derive(Clone, Debug)]
pub struct DsmcCommand {
    program: OsString,
    operation: Operation,
    display_opts: Vec<OsString>,
    base_opts: Vec<OsString>,
    filelist: Option<PathBuf>,
    cpu_limit: Option<u64>,
}

impl DsmcCommand {
    /// Creates a new builder for the given operation.
    #[must_use]
    pub fn new(operation: Operation) -> Self {
        Self {
            program: OsString::from("dsmc"),
            operation,
            display_opts: Vec::new(),
            base_opts: Vec::new(),
            filelist: None,
            cpu_limit: None,
        }
    }

    /// Overrides the client binary. Primarily for tests, which substitute a
    /// script for the real client.
    pub fn set_program<S: Into<OsString>>(&mut self, program: S) -> &mut Self {
        self.program = program.into();
        self
    }

    /// Display options (`dsmc_displayopts`) for invocations whose output is
    /// parsed. Ignored by the archive shape.
    pub fn display_opts<I, S>(&mut self, opts: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.display_opts = opts.into_iter().map(Into::into).collect();
        self
    }

    /// Base options (`dsmcopts`) appended to every invocation.
    pub fn base_opts<I, S>(&mut self, opts: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.base_opts = opts.into_iter().map(Into::into).collect();
        self
    }

    /// Points the client at a request list written by
    /// [`crate::filelist::FileList`].
    pub fn filelist<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.filelist = Some(path.into());
        self
    }

    /// CPU-time limit in seconds applied in the child before exec.
    pub fn cpu_limit(&mut self, seconds: u64) -> &mut Self {
        self.cpu_limit = Some(seconds);
        self
    }

    /// Assembles the argument vector for this invocation.
    #[must_use]
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match &self.operation {
            Operation::Archive { description } => {
                args.push("archive".into());
                args.push("-deletefiles".into());
                args.extend(self.base_opts.iter().cloned());
                args.push(concat_os("-description=", description.as_ref()));
                if let Some(list) = &self.filelist {
                    args.push(concat_os("-filelist=", list.as_os_str()));
                }
            }
            Operation::Retrieve { destination } => {
                args.push("retrieve".into());
                args.push("-replace=no".into());
                args.push("-followsymbolic=yes".into());
                args.extend(self.display_opts.iter().cloned());
                args.extend(self.base_opts.iter().cloned());
                if let Some(list) = &self.filelist {
                    args.push(concat_os("-filelist=", list.as_os_str()));
                }
                let mut dest = destination.clone().into_os_string();
                dest.push("/");
                args.push(dest);
            }
            Operation::Delete => {
                args.push("delete".into());
                args.push("archive".into());
                args.push("-noprompt".into());
                args.extend(self.display_opts.iter().cloned());
                args.extend(self.base_opts.iter().cloned());
                if let Some(list) = &self.filelist {
                    args.push(concat_os("-filelist=", list.as_os_str()));
                }
            }
        }
        args
    }

    /// Builds the [`Command`], including the CPU rlimit hook.
    #[must_use]
    pub fn build(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.to_args());

        #[cfg(unix)]
        if let Some(seconds) = self.cpu_limit {
            use std::os::unix::process::CommandExt;
            // SAFETY: setrlimit is async-signal-safe and the closure touches
            // nothing else before exec.
            unsafe {
                command.pre_exec(move || {
                    let limit = libc::rlimit {
                        rlim_cur: seconds,
                        rlim_max: seconds,
                    };
                    if libc::setrlimit(libc::RLIMIT_CPU, &limit) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        command
    }
}

/// Session description for an archive invocation: `ENDIT-<ISO 8601>`.
///
/// Combined with the 2 s inter-spawn pacing this keeps concurrent session
/// descriptions unique.
#[must_use]
pub fn archive_description(now: DateTime<Local>) -> String {
    format!("ENDIT-{}", now.to_rfc3339_opts(SecondsFormat::Secs, false))
}

fn concat_os(prefix: &str, rest: &OsStr) -> OsString {
    let mut out = OsString::from(prefix);
    out.push(rest);
    out
}
