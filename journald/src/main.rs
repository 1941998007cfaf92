//! systemd-journald-style collection daemon.
//!
//! Takes no positional arguments; configuration comes from
//! `journald.conf` and the kernel command line. Exits 0 on a clean
//! drain, nonzero when initialization fails.

use journald::storage::Paths;
use journald::{Config, Dispatcher};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if std::env::args().nth(1).is_some() {
        eprintln!("This program takes no arguments.");
        return std::process::ExitCode::FAILURE;
    }

    let config = Config::load(None);

    let mut dispatcher = match Dispatcher::new(config, Paths::system_default()) {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            error!(error = %err, "initialization failed");
            return std::process::ExitCode::FAILURE;
        }
    };

    match dispatcher.run() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "dispatcher failed");
            std::process::ExitCode::FAILURE
        }
    }
}
