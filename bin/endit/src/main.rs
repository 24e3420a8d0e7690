#![deny(unsafe_code)]

use std::{env, process::ExitCode};

fn main() -> ExitCode {
    ExitCode::from(endit_cli::run(env::args_os()))
}
