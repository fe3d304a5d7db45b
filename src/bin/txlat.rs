//! `txlat <source-image>` — static-mode driver.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use arancini::output::personality::StaticOutputEngine;
use arancini::txlat::TxlatEngine;

fn main() -> ExitCode {
    let mut args = std::env::args_os().skip(1);
    let (Some(source), None) = (args.next(), args.next()) else {
        eprintln!("error: usage: txlat <source-image>");
        return ExitCode::FAILURE;
    };

    let stdout = io::stdout();
    let mut engine = StaticOutputEngine::new(stdout.lock());

    match TxlatEngine::new().translate(&PathBuf::from(source), &mut engine) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let _ = writeln!(io::stderr(), "translation error: {e}");
            ExitCode::FAILURE
        }
    }
}
