//! Process bootstrap: configuration, logging, signal registration, serve.
//!
//! Startup resource failures (bind/listen/poll creation) are the only errors
//! that terminate the process; they are logged and exit nonzero before any
//! connection is served.

use echo_chamber::{logging, Config, Server};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.log_level, config.log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    // Cooperative shutdown: SIGINT/SIGTERM set the flag, every long-running
    // thread observes it at its next loop iteration.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
        }) {
            error!(error = %e, "Failed to register signal handler");
            return ExitCode::FAILURE;
        }
    }

    info!(
        listen = %config.listen,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Starting echo-chamber"
    );

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    match server.run(shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}
