mod config;
mod handlers;
mod http;
mod network;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use crate::server::Server;

/// Configurable HTTP/1.1 origin server with static file service, uploads and
/// CGI execution.
#[derive(Parser)]
#[command(name = "webserv", version, about)]
struct Cli {
    /// Path to the configuration file
    config: PathBuf,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::new(&config) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.bind() {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = server.run() {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
