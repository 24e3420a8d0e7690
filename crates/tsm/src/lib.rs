#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `endit-tsm` is the only crate that talks to the tape client. The client is
//! an opaque external binary (`dsmc`): the daemons build an argument vector,
//! spawn it as a real OS child process, feed it a newline-separated file
//! list, and mine its mixed textual output for `ANxnnnnx` message codes. The
//! client's numeric exit status is advisory at best; the message codes are
//! the authoritative signal.
//!
//! - [`command`] builds the four invocation shapes (archive, retrieve,
//!   delete, and the base option plumbing they share).
//! - [`filelist`] writes the transient request lists handed over via
//!   `-filelist=`; a list lives exactly as long as its worker.
//! - [`worker`] supervises one running invocation: output drain threads, a
//!   prompt watchdog, non-blocking reaping, SIGKILL on demand.
//! - [`output`] extracts and classifies message codes.

pub mod command;
pub mod filelist;
pub mod output;
pub mod worker;

pub use command::DsmcCommand;
pub use filelist::FileList;
pub use worker::Worker;
