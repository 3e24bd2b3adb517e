//! Printing results and errors for the user, and logger setup.

use std::io::{IsTerminal, Write};

use colored::Colorize;

/// Sets up `env_logger`. `RUST_LOG` takes precedence over the verbosity flag.
pub fn init_logger(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .try_init();
}

pub fn print_message(message: &str) {
    println!("{message}");
}

/// Overwrites a one-line progress indicator on stderr. Nothing is printed unless stderr is a
/// terminal.
pub fn print_progress(current: usize, total: usize) {
    let mut stderr = std::io::stderr();
    if !stderr.is_terminal() {
        return;
    }
    let _ = write!(stderr, "\r{}", format!("Inspecting package {current}/{total}").dimmed());
    if current == total {
        let _ = writeln!(stderr);
    }
    let _ = stderr.flush();
}

/// Prints an error to stderr, in red when stderr is a terminal.
pub fn print_error(message: &str) {
    if std::io::stderr().is_terminal() {
        eprintln!("{}", message.red());
    } else {
        eprintln!("{message}");
    }
}
