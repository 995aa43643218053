//! echolog: a single-client TCP message log
//!
//! Each client sends one newline-terminated message. The server appends it
//! to a log file and replies with everything logged so far, then closes
//! the connection.
//!
//! Features:
//! - One connection at a time, in arrival order
//! - Foreground or daemon (`-d`) execution
//! - Clean shutdown on SIGINT/SIGTERM, deleting the log
//! - Status and errors recorded to syslog in every mode

mod config;
mod connection;
mod daemon;
mod logging;
mod protocol;
mod server;
mod signals;
mod storage;

use config::Config;
use daemon::Detached;
use server::Server;
use signals::ShutdownToken;
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> ExitCode {
    let config = Config::load();
    let program = logging::program_name();

    if config.daemon {
        // Fork before logging exists so the child sets up its own
        match daemon::detach() {
            Ok(Detached::Parent { child }) => {
                logging::init(&program, true);
                info!(pid = child, "Created server process");
                return ExitCode::SUCCESS;
            }
            Ok(Detached::Child) => {}
            Err(e) => {
                logging::init(&program, true);
                error!(error = %e, "Failed to create child process");
                return ExitCode::FAILURE;
            }
        }
    }

    logging::init(&program, !config.daemon);
    serve(config)
}

/// Run the server until a termination signal, then tear it down.
fn serve(config: Config) -> ExitCode {
    info!(
        addr = %config.listen,
        store = %config.store_path.display(),
        daemon = config.daemon,
        "Starting echolog server"
    );

    let mut server = match Server::init(&config, ShutdownToken::new()) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Server setup failed");
            logging::close();
            return ExitCode::FAILURE;
        }
    };

    server.run();
    server.shutdown();
    logging::close();

    ExitCode::SUCCESS
}
